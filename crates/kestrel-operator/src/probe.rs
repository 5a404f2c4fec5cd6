//! Status probing
//!
//! Builds a [`ClusterStatus`] from storage, every node and the managed etcd
//! and Kubernetes APIs. Node probes run concurrently. Failing to reach a
//! node fails the probe; an unreachable etcd or API server only marks that
//! part of the status unhealthy.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use k8s_openapi::api::core::v1::Node as K8sNode;
use kube::api::{Api, ListParams};
use tracing::{debug, warn};

use kestrel_common::images::service;
use kestrel_common::{
    ClusterStatus, EtcdClusterStatus, EtcdMember, EtcdNodeStatus, Error, KubeNodeStatus,
    KubernetesClusterStatus, Node, NodeStatus, ResourceDefinition, Result, Taint, TaintEffect,
};
use kestrel_infra::Infrastructure;
use kestrel_pki::CaKind;
use kestrel_storage::etcd::etcd_err;

/// Deadline for each etcd and Kubernetes API probe
const API_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for one member's own status
const MEMBER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Raft entries a member may trail the leader by and still count as in sync
const MAX_RAFT_LAG: u64 = 16;

fn absent<T>(result: Result<T>) -> Result<bool> {
    match result {
        Ok(_) => Ok(false),
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(e),
    }
}

/// Probe everything a decision needs
pub async fn probe(infra: &Infrastructure, resources: &[ResourceDefinition]) -> Result<ClusterStatus> {
    let storage = infra.storage();
    let mut status = ClusterStatus {
        config_version: storage.get_config_version().await?,
        service_account_missing: absent(storage.get_service_account_key().await)?,
        ..Default::default()
    };
    for ca in CaKind::ALL {
        if absent(storage.get_ca_certificate(ca.name()).await)? {
            status.missing_cas.insert(ca.name().to_string());
        }
    }

    let nodes = try_join_all(infra.cluster().nodes.iter().map(|n| probe_node(infra, n))).await?;
    status.nodes = nodes.into_iter().map(|n| (n.address.clone(), n)).collect();

    let etcd_running = status.nodes.values().any(|n| n.is_running(service::ETCD));
    status.etcd = if etcd_running {
        probe_etcd(infra).await
    } else {
        EtcdClusterStatus::default()
    };
    status.etcd.bootstrapped = storage.is_etcd_bootstrapped().await?;

    let apiserver_running = status
        .nodes
        .values()
        .any(|n| n.is_running(service::KUBE_APISERVER));
    if apiserver_running {
        status.kubernetes = probe_kubernetes(infra, resources).await;
    }

    debug!(
        nodes = status.nodes.len(),
        etcd_healthy = status.etcd.is_healthy,
        kubernetes_ready = status.kubernetes.is_ready,
        "cluster probed"
    );
    Ok(status)
}

async fn probe_node(infra: &Infrastructure, node: &Node) -> Result<NodeStatus> {
    let engine = infra.engine(&node.address)?;
    let services = engine.inspect(&service::ALL).await?;
    let has_data = engine
        .volume_exists(&infra.cluster().options.etcd.volume_name)
        .await?;
    Ok(NodeStatus {
        address: node.address.clone(),
        ssh_connected: true,
        etcd: EtcdNodeStatus { has_data },
        services,
    })
}

async fn probe_etcd(infra: &Infrastructure) -> EtcdClusterStatus {
    match tokio::time::timeout(API_PROBE_TIMEOUT, etcd_members(infra)).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            warn!(error = %e, "etcd probe failed");
            EtcdClusterStatus::default()
        }
        Err(_) => {
            warn!("etcd probe timed out");
            EtcdClusterStatus::default()
        }
    }
}

async fn etcd_members(infra: &Infrastructure) -> Result<EtcdClusterStatus> {
    let mut client = infra.etcd_client().await?;
    let list = client.member_list().await.map_err(etcd_err)?;
    client.status().await.map_err(etcd_err)?;

    let mut status = EtcdClusterStatus {
        is_healthy: true,
        ..Default::default()
    };
    for m in list.members() {
        let member = EtcdMember {
            id: m.id(),
            name: m.name().to_string(),
            peer_urls: m.peer_urls().to_vec(),
        };
        let Some(address) = member.address().map(str::to_string) else {
            warn!(member = member.id, "etcd member without peer URL");
            continue;
        };
        status.members.insert(address, member);
    }

    let progress = join_all(
        status
            .members
            .iter()
            .filter(|(_, m)| !m.name.is_empty())
            .map(|(address, _)| member_progress(infra, address)),
    )
    .await;
    let progress: BTreeMap<String, MemberProgress> = progress.into_iter().flatten().collect();
    status.in_sync = in_sync(&status.members, &progress);
    Ok(status)
}

/// Raft position one member reported about itself
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MemberProgress {
    member_id: u64,
    leader: u64,
    raft_index: u64,
}

/// Ask one member directly for its raft position; `None` when unreachable
async fn member_progress(infra: &Infrastructure, address: &str) -> Option<(String, MemberProgress)> {
    let query = async {
        let mut client = infra.etcd_member_client(address).await?;
        let status = client.status().await.map_err(etcd_err)?;
        let member_id = status.header().map(|h| h.member_id()).unwrap_or_default();
        Ok::<_, Error>(MemberProgress {
            member_id,
            leader: status.leader(),
            raft_index: status.raft_index(),
        })
    };
    match tokio::time::timeout(MEMBER_PROBE_TIMEOUT, query).await {
        Ok(Ok(progress)) => Some((address.to_string(), progress)),
        Ok(Err(e)) => {
            debug!(node = %address, error = %e, "etcd member status failed");
            None
        }
        Err(_) => {
            debug!(node = %address, "etcd member status timed out");
            None
        }
    }
}

/// A member is in sync when it answered, agrees on the leader and trails the
/// leader's raft index by at most [`MAX_RAFT_LAG`] entries
fn in_sync(
    members: &BTreeMap<String, EtcdMember>,
    progress: &BTreeMap<String, MemberProgress>,
) -> BTreeMap<String, bool> {
    let leader = progress.values().find(|p| p.member_id != 0 && p.member_id == p.leader);
    members
        .keys()
        .map(|address| {
            let synced = match (leader, progress.get(address)) {
                (Some(leader), Some(p)) => {
                    p.leader == leader.member_id
                        && p.raft_index.saturating_add(MAX_RAFT_LAG) >= leader.raft_index
                }
                _ => false,
            };
            (address.clone(), synced)
        })
        .collect()
}

async fn probe_kubernetes(
    infra: &Infrastructure,
    resources: &[ResourceDefinition],
) -> KubernetesClusterStatus {
    match tokio::time::timeout(API_PROBE_TIMEOUT, kubernetes_state(infra, resources)).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            warn!(error = %e, "kubernetes probe failed");
            KubernetesClusterStatus::default()
        }
        Err(_) => {
            warn!("kubernetes probe timed out");
            KubernetesClusterStatus::default()
        }
    }
}

fn taint_effect(effect: &str) -> TaintEffect {
    match effect {
        "PreferNoSchedule" => TaintEffect::PreferNoSchedule,
        "NoExecute" => TaintEffect::NoExecute,
        _ => TaintEffect::NoSchedule,
    }
}

pub(crate) fn kube_node_status(node: &K8sNode) -> KubeNodeStatus {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True");
    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .map(|t| Taint {
                    key: t.key.clone(),
                    value: t.value.clone().unwrap_or_default(),
                    effect: taint_effect(&t.effect),
                })
                .collect()
        })
        .unwrap_or_default();
    KubeNodeStatus {
        name: node.metadata.name.clone().unwrap_or_default(),
        ready,
        labels: node.metadata.labels.clone().unwrap_or_default(),
        annotations: node.metadata.annotations.clone().unwrap_or_default(),
        taints,
    }
}

async fn kubernetes_state(
    infra: &Infrastructure,
    resources: &[ResourceDefinition],
) -> Result<KubernetesClusterStatus> {
    let client = infra.kube_client().await?;
    let nodes: Api<K8sNode> = Api::all(client.clone());
    let list = nodes.list(&ListParams::default()).await?;

    let mut status = KubernetesClusterStatus {
        is_ready: true,
        nodes: list
            .items
            .iter()
            .map(kube_node_status)
            .map(|n| (n.name.clone(), n))
            .collect(),
        resource_annotations: BTreeMap::new(),
    };
    for definition in resources {
        match kestrel_resource::fetch_annotations(&client, definition).await {
            Ok(Some(annotations)) => {
                status
                    .resource_annotations
                    .insert(definition.key.clone(), annotations);
            }
            Ok(None) => {}
            Err(e) => debug!(key = %definition.key, error = %e, "resource lookup failed"),
        }
    }
    Ok(status)
}

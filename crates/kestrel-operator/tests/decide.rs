//! Decision walks over observed status snapshots

use std::collections::{BTreeMap, BTreeSet};

use kestrel_common::config::EngineConfig;
use kestrel_common::images::service;
use kestrel_common::{
    Cluster, ClusterStatus, EtcdMember, EtcdNodeStatus, KubeNodeStatus, Node, NodeStatus,
    ResourceDefinition, ServiceStatus, Taint, TaintEffect, ANNOTATION_MANAGED_TAINTS,
    ANNOTATION_REVISION, CONFIG_VERSION,
};
use kestrel_operator::commands::{desired_annotations, desired_labels, desired_taints};
use kestrel_operator::{decide, services, Context, Decision, Operator, Phase};
use kestrel_pki::CaKind;

fn node(address: &str, control_plane: bool) -> Node {
    Node {
        address: address.to_string(),
        hostname: format!("host-{}", address.rsplit('.').next().unwrap_or(address)),
        user: "core".to_string(),
        control_plane,
        ..Default::default()
    }
}

fn cluster() -> Cluster {
    Cluster {
        name: "prod".to_string(),
        nodes: vec![
            node("10.0.0.1", true),
            node("10.0.0.2", true),
            node("10.0.0.3", true),
            node("10.0.0.4", false),
        ],
        service_subnet: "10.96.0.0/16".to_string(),
        pod_subnet: "10.244.0.0/16".to_string(),
        ..Default::default()
    }
}

fn running(cluster: &Cluster, node: &Node, name: &str) -> ServiceStatus {
    let spec = services::desired(name, cluster, node, &EngineConfig::default()).unwrap();
    ServiceStatus {
        running: true,
        image: spec.image,
        built_in_params: spec.built_in,
        extra_params: spec.extra,
    }
}

/// Storage initialized and rivers running everywhere, nothing else
fn upgraded(cluster: &Cluster) -> ClusterStatus {
    let nodes = cluster
        .nodes
        .iter()
        .map(|n| {
            let mut services = BTreeMap::new();
            services.insert(
                service::RIVERS.to_string(),
                running(cluster, n, service::RIVERS),
            );
            let status = NodeStatus {
                address: n.address.clone(),
                ssh_connected: true,
                services,
                ..Default::default()
            };
            (n.address.clone(), status)
        })
        .collect();
    ClusterStatus {
        config_version: Some(CONFIG_VERSION.to_string()),
        nodes,
        ..Default::default()
    }
}

/// Every service current, etcd healthy and every Node object up to date
fn converged(cluster: &Cluster) -> ClusterStatus {
    let mut status = upgraded(cluster);
    for n in &cluster.nodes {
        let node_status = status.nodes.get_mut(&n.address).unwrap();
        let mut names: Vec<&str> = Vec::new();
        if n.control_plane {
            names.push(service::ETCD);
            names.extend(service::CONTROL_PLANE);
            node_status.etcd = EtcdNodeStatus { has_data: true };
            status.etcd.members.insert(
                n.address.clone(),
                EtcdMember {
                    id: n.address.len() as u64,
                    name: n.address.clone(),
                    peer_urls: vec![format!("https://{}:2380", n.address)],
                },
            );
            status.etcd.in_sync.insert(n.address.clone(), true);
        }
        names.extend(service::NODE);
        for name in names {
            node_status
                .services
                .insert(name.to_string(), running(cluster, n, name));
        }
        status.kubernetes.nodes.insert(
            n.nodename().to_string(),
            KubeNodeStatus {
                name: n.nodename().to_string(),
                ready: true,
                labels: desired_labels(n),
                annotations: desired_annotations(n, cluster.taint_control_plane),
                taints: desired_taints(n, cluster.taint_control_plane),
            },
        );
    }
    status.etcd.is_healthy = true;
    status.etcd.bootstrapped = true;
    status.kubernetes.is_ready = true;
    status
}

fn decide_from(
    start: Phase,
    cluster: &Cluster,
    status: &ClusterStatus,
    resources: &[ResourceDefinition],
) -> Decision {
    let config = EngineConfig::default();
    let ctx = Context {
        cluster,
        status,
        resources,
        config: &config,
    };
    decide(start, &ctx).unwrap()
}

fn steps(decision: &Decision) -> Vec<String> {
    decision
        .operator
        .as_ref()
        .map(|plan| plan.describe().into_iter().map(|c| c.name).collect())
        .unwrap_or_default()
}

fn name(decision: &Decision) -> Option<&str> {
    decision.operator.as_ref().map(|plan| plan.name())
}

#[test]
fn fresh_storage_is_upgraded_first() {
    let cluster = cluster();
    let status = ClusterStatus {
        missing_cas: CaKind::ALL.iter().map(|ca| ca.name().to_string()).collect(),
        service_account_missing: true,
        ..Default::default()
    };
    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::Upgrade);
    assert_eq!(name(&decision), Some("upgrade"));

    let mut expected = vec!["ca-init"; CaKind::ALL.len()];
    expected.extend(["service-account-key", "config-version"]);
    assert_eq!(steps(&decision), expected);
}

#[test]
fn rivers_is_started_on_every_node_after_upgrade() {
    let cluster = cluster();
    let status = ClusterStatus {
        config_version: Some(CONFIG_VERSION.to_string()),
        ..Default::default()
    };
    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::Rivers);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "rivers-bootstrap");
    assert_eq!(
        plan.targets(),
        vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]
    );
    assert_eq!(plan.len(), 8);
}

#[test]
fn unbooted_etcd_is_bootstrapped_on_control_plane_nodes() {
    let cluster = cluster();
    let status = upgraded(&cluster);
    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::EtcdBoot);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "etcd-bootstrap");
    assert_eq!(plan.targets(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

    let mut expected = Vec::new();
    for _ in 0..3 {
        expected.extend(["etcd-files", "image-pull", "volume-create", "container-run"]);
    }
    expected.extend(["etcd-wait", "etcd-mark-bootstrapped"]);
    assert_eq!(steps(&decision), expected);
}

#[test]
fn half_booted_etcd_is_wiped_before_bootstrap() {
    let cluster = cluster();
    let mut status = upgraded(&cluster);
    status.nodes.get_mut("10.0.0.1").unwrap().etcd.has_data = true;

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::EtcdBootAborted);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "etcd-bootstrap-aborted");
    assert_eq!(plan.targets(), vec!["10.0.0.1"]);
    assert_eq!(steps(&decision), vec!["container-stop", "volume-remove"]);
}

#[test]
fn healthy_but_unmarked_etcd_only_gets_the_marker() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status.etcd.bootstrapped = false;

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::EtcdBoot);
    assert_eq!(steps(&decision), vec!["etcd-mark-bootstrapped"]);
}

#[test]
fn unhealthy_bootstrapped_etcd_is_waited_on() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status.etcd.is_healthy = false;

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::EtcdWait);
    assert_eq!(name(&decision), Some("etcd-wait-cluster"));
    assert_eq!(steps(&decision), vec!["etcd-wait"]);
}

#[test]
fn control_plane_starts_once_etcd_is_healthy() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    for n in status.nodes.values_mut() {
        for name in service::CONTROL_PLANE.iter().chain(service::NODE.iter()) {
            n.services.remove(*name);
        }
    }
    status.kubernetes = Default::default();

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::K8sStart);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "kube-control-plane-bootstrap");
    assert_eq!(
        steps(&decision)[..5],
        ["control-plane-files", "image-pull", "container-run", "container-run", "container-run"]
    );
}

#[test]
fn stale_member_is_removed_before_anything_else_in_maintenance() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status.etcd.members.insert(
        "10.0.0.9".to_string(),
        EtcdMember {
            id: 0x99,
            name: "10.0.0.9".to_string(),
            peer_urls: vec!["https://10.0.0.9:2380".to_string()],
        },
    );

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::EtcdMaintain);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "etcd-remove-member");
    assert_eq!(plan.targets(), vec!["10.0.0.9"]);
    assert_eq!(plan.describe()[0].detail, "99");
}

#[test]
fn new_control_plane_node_joins_as_existing_member() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status.etcd.members.remove("10.0.0.3");
    status.etcd.in_sync.remove("10.0.0.3");
    let n3 = status.nodes.get_mut("10.0.0.3").unwrap();
    n3.services.remove(service::ETCD);
    n3.etcd.has_data = false;

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::EtcdMaintain);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "etcd-add-member");
    assert_eq!(plan.targets(), vec!["10.0.0.3"]);
    assert_eq!(
        steps(&decision),
        vec!["etcd-files", "image-pull", "volume-create", "etcd-member-add", "container-run"]
    );
}

#[test]
fn drifted_etcd_member_is_restarted_alone() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status
        .nodes
        .get_mut("10.0.0.2")
        .unwrap()
        .services
        .get_mut(service::ETCD)
        .unwrap()
        .image = "quay.io/coreos/etcd:v3.3.0".to_string();

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "etcd-restart");
    assert_eq!(plan.targets(), vec!["10.0.0.2"]);
}

#[test]
fn drifted_etcd_member_waits_for_every_member_in_sync() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status
        .nodes
        .get_mut("10.0.0.2")
        .unwrap()
        .services
        .get_mut(service::ETCD)
        .unwrap()
        .image = "quay.io/coreos/etcd:v3.3.0".to_string();
    status.etcd.in_sync.insert("10.0.0.1".to_string(), false);

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::Completed);
}

#[test]
fn drifted_scheduler_is_recreated_without_reinstalling_files() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status
        .nodes
        .get_mut("10.0.0.2")
        .unwrap()
        .services
        .get_mut(service::KUBE_SCHEDULER)
        .unwrap()
        .running = false;

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::K8sMaintain);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "kube-restart");
    assert_eq!(plan.targets(), vec!["10.0.0.2"]);
    let described = plan.describe();
    assert_eq!(described.len(), 2);
    assert_eq!(described[0].name, "image-pull");
    assert_eq!(described[1].name, "container-run");
    assert_eq!(described[1].detail, service::KUBE_SCHEDULER);
}

#[test]
fn node_objects_of_departed_machines_are_removed() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status.kubernetes.nodes.insert(
        "host-9".to_string(),
        KubeNodeStatus {
            name: "host-9".to_string(),
            ready: false,
            ..Default::default()
        },
    );

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "kube-node-remove");
    assert_eq!(plan.targets(), vec!["host-9"]);
}

#[test]
fn missing_control_plane_label_triggers_node_update() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status
        .kubernetes
        .nodes
        .get_mut("host-1")
        .unwrap()
        .labels
        .clear();

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "kube-node-update");
    assert_eq!(plan.targets(), vec!["host-1"]);
}

#[test]
fn controller_taints_on_not_ready_nodes_do_not_hold_back_resources() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    let worker = status.kubernetes.nodes.get_mut("host-4").unwrap();
    worker.ready = false;
    worker.taints.push(Taint {
        key: "node.kubernetes.io/not-ready".to_string(),
        value: String::new(),
        effect: TaintEffect::NoSchedule,
    });
    let resources = vec![ResourceDefinition::from_stored(
        "DaemonSet/kube-system/cni",
        br#"{"apiVersion":"apps/v1","kind":"DaemonSet","metadata":{"name":"cni","namespace":"kube-system"}}"#
            .to_vec(),
        11,
    )
    .unwrap()];

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &resources);
    assert_eq!(decision.phase, Phase::K8sMaintain);
    assert_eq!(name(&decision), Some("resource-apply"));
}

#[test]
fn taint_dropped_from_the_definition_is_removed() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    let worker = status.kubernetes.nodes.get_mut("host-4").unwrap();
    worker.taints.push(Taint {
        key: "dedicated".to_string(),
        value: "db".to_string(),
        effect: TaintEffect::NoSchedule,
    });
    worker
        .annotations
        .insert(ANNOTATION_MANAGED_TAINTS.to_string(), "dedicated".to_string());

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "kube-node-update");
    assert_eq!(plan.targets(), vec!["host-4"]);

    let worker = status.kubernetes.nodes.get_mut("host-4").unwrap();
    worker
        .annotations
        .insert(ANNOTATION_MANAGED_TAINTS.to_string(), String::new());
    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::Completed);
}

#[test]
fn pending_resources_are_applied_and_undecodable_ones_skipped() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    let mut applied = BTreeMap::new();
    applied.insert(ANNOTATION_REVISION.to_string(), "3".to_string());
    status
        .kubernetes
        .resource_annotations
        .insert("Namespace/apps".to_string(), applied);

    let resources = vec![
        ResourceDefinition::from_stored(
            "Namespace/apps",
            br#"{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"apps"}}"#.to_vec(),
            3,
        )
        .unwrap(),
        ResourceDefinition::from_stored(
            "ConfigMap/default/broken",
            br#"{"apiVersion":"v1","kind":"Secret","metadata":{"name":"broken"}}"#.to_vec(),
            4,
        )
        .unwrap(),
        ResourceDefinition::from_stored(
            "ConfigMap/default/settings",
            br#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"settings"},"data":{"level":"debug"}}"#
                .to_vec(),
            5,
        )
        .unwrap(),
    ];

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &resources);
    assert_eq!(decision.phase, Phase::K8sMaintain);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.name(), "resource-apply");
    assert_eq!(plan.targets(), vec!["ConfigMap/default/settings"]);
}

#[test]
fn worker_running_control_plane_services_is_stopped() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    let worker = cluster.node("10.0.0.4").unwrap();
    status.nodes.get_mut("10.0.0.4").unwrap().services.insert(
        service::KUBE_APISERVER.to_string(),
        running(&cluster, worker, service::KUBE_APISERVER),
    );

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::StopControlPlane);
    let plan = decision.operator.as_ref().unwrap();
    assert_eq!(plan.targets(), vec!["10.0.0.4"]);
    assert_eq!(plan.describe()[0].detail, service::KUBE_APISERVER);
}

#[test]
fn converged_cluster_completes() {
    let cluster = cluster();
    let status = converged(&cluster);
    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::Completed);
    assert!(decision.operator.is_none());
}

#[test]
fn later_start_does_not_revisit_earlier_phases() {
    let cluster = cluster();
    let mut status = converged(&cluster);
    status.config_version = None;
    status.missing_cas = BTreeSet::from(["server".to_string()]);

    let decision = decide_from(Phase::K8sMaintain, &cluster, &status, &[]);
    assert_eq!(decision.phase, Phase::Completed);

    let decision = decide_from(Phase::Upgrade, &cluster, &status, &[]);
    assert_eq!(name(&decision), Some("upgrade"));
}

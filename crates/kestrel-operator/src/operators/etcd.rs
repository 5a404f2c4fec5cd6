//! etcd bootstrap, start and membership maintenance
//!
//! Membership changes only happen on a healthy cluster and touch one member
//! per tick, so quorum is never at risk from more than one change at a time.

use kestrel_common::images::{self, service};
use kestrel_common::{Node, Result};

use super::Context;
use crate::commands::{
    AddEtcdMember, CreateVolume, InstallEtcdFiles, MarkEtcdBootstrapped, PullImage,
    RemoveEtcdMember, RemoveVolume, RunContainer, StopContainer, WaitEtcdHealthy,
};
use crate::operator::Plan;
use crate::phase::Condition;
use crate::services::{self, InitialCluster, InitialState};

fn addresses(nodes: &[&Node]) -> Vec<String> {
    nodes.iter().map(|n| n.address.clone()).collect()
}

fn volume(ctx: &Context<'_>) -> String {
    ctx.cluster.options.etcd.volume_name.clone()
}

/// Push the steps that wipe etcd from a node
fn push_destroy(plan: &mut Plan, ctx: &Context<'_>, node: &Node) {
    plan.push(StopContainer {
        node: node.address.clone(),
        name: service::ETCD.to_string(),
    })
    .push(RemoveVolume {
        node: node.address.clone(),
        name: volume(ctx),
    });
}

/// Push the steps that start a member for the first time
fn push_first_start(plan: &mut Plan, ctx: &Context<'_>, node: &Node, initial: &InitialCluster) {
    plan.push(InstallEtcdFiles { node: node.clone() })
        .push(PullImage {
            node: node.address.clone(),
            image: images::ETCD.to_string(),
        })
        .push(CreateVolume {
            node: node.address.clone(),
            name: volume(ctx),
        });
    if initial.state == InitialState::Existing {
        plan.push(AddEtcdMember {
            node: node.address.clone(),
        });
    }
    plan.push(RunContainer {
        node: node.address.clone(),
        spec: services::etcd(ctx.cluster, node, Some(initial)),
    });
}

/// Wipe every member left behind by an interrupted bootstrap
pub fn bootstrap_aborted(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let nodes: Vec<&Node> = ctx
        .cluster
        .nodes
        .iter()
        .filter(|n| ctx.has_etcd_data(n) || ctx.has_service(n, service::ETCD))
        .collect();
    let mut plan = Plan::new("etcd-bootstrap-aborted", addresses(&nodes));
    for node in nodes {
        push_destroy(&mut plan, ctx, node);
    }
    Ok(plan.non_empty())
}

/// Start a brand-new cluster on every control plane node
///
/// A healthy cluster that was never marked only gets the marker.
pub fn bootstrap(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let etcd = &ctx.status.etcd;
    if etcd.bootstrapped || Condition::EtcdHalfBooted.holds(ctx.status) {
        return Ok(None);
    }
    let nodes: Vec<&Node> = ctx.cluster.control_plane_nodes().collect();
    let mut plan = Plan::new("etcd-bootstrap", addresses(&nodes));
    if etcd.is_healthy {
        plan.push(MarkEtcdBootstrapped);
        return Ok(Some(plan));
    }

    let initial = InitialCluster {
        members: addresses(&nodes),
        state: InitialState::New,
    };
    for node in &nodes {
        push_first_start(&mut plan, ctx, node, &initial);
    }
    plan.push(WaitEtcdHealthy {
        timeout: ctx.config.command_timeout,
    })
    .push(MarkEtcdBootstrapped);
    Ok(Some(plan))
}

/// Start stopped members that still hold data
pub fn start(ctx: &Context<'_>) -> Result<Option<Plan>> {
    if !ctx.status.etcd.bootstrapped {
        return Ok(None);
    }
    let nodes: Vec<&Node> = ctx
        .cluster
        .control_plane_nodes()
        .filter(|n| ctx.has_etcd_data(n) && !ctx.is_running(n, service::ETCD))
        .collect();
    let mut plan = Plan::new("etcd-start", addresses(&nodes));
    for node in nodes {
        plan.push(InstallEtcdFiles { node: node.clone() })
            .push(PullImage {
                node: node.address.clone(),
                image: images::ETCD.to_string(),
            })
            .push(RunContainer {
                node: node.address.clone(),
                spec: services::etcd(ctx.cluster, node, None),
            });
    }
    Ok(plan.non_empty())
}

/// Wait for an unhealthy cluster to recover
pub fn wait_cluster(ctx: &Context<'_>) -> Result<Option<Plan>> {
    if ctx.status.etcd.is_healthy {
        return Ok(None);
    }
    let targets = ctx
        .cluster
        .control_plane_nodes()
        .map(|n| n.address.clone())
        .collect();
    Ok(Some(Plan::new("etcd-wait-cluster", targets).then(WaitEtcdHealthy {
        timeout: ctx.config.command_timeout,
    })))
}

/// Remove one member whose node is no longer a control plane node
pub fn remove_member(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let etcd = &ctx.status.etcd;
    if !etcd.is_healthy {
        return Ok(None);
    }
    let stale = etcd.members.iter().find(|(address, _)| {
        ctx.cluster
            .node(address)
            .map_or(true, |n| !n.control_plane)
    });
    Ok(stale.map(|(address, member)| {
        Plan::new("etcd-remove-member", vec![address.clone()]).then(RemoveEtcdMember {
            node: address.clone(),
            id: member.id,
        })
    }))
}

/// Wipe etcd from one node that is not a member but still runs it or has data
pub fn destroy_member(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let etcd = &ctx.status.etcd;
    if !etcd.is_healthy {
        return Ok(None);
    }
    let leftover = ctx.cluster.nodes.iter().find(|n| {
        let has_etcd = ctx.has_etcd_data(n) || ctx.has_service(n, service::ETCD);
        let member = n.control_plane && etcd.member(&n.address).is_some();
        has_etcd && !member
    });
    Ok(leftover.map(|node| {
        let mut plan = Plan::new("etcd-destroy-member", vec![node.address.clone()]);
        push_destroy(&mut plan, ctx, node);
        plan
    }))
}

/// Join one control plane node that is not yet a running member
pub fn add_member(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let etcd = &ctx.status.etcd;
    if !etcd.is_healthy {
        return Ok(None);
    }
    let joining = ctx.cluster.control_plane_nodes().find(|n| {
        match etcd.member(&n.address) {
            None => true,
            Some(m) => m.name.is_empty() && !ctx.is_running(n, service::ETCD),
        }
    });
    let Some(node) = joining else {
        return Ok(None);
    };

    let mut members: Vec<String> = etcd.members.keys().cloned().collect();
    if !members.contains(&node.address) {
        members.push(node.address.clone());
    }
    let initial = InitialCluster {
        members,
        state: InitialState::Existing,
    };
    let mut plan = Plan::new("etcd-add-member", vec![node.address.clone()]);
    if ctx.has_service(node, service::ETCD) {
        plan.push(StopContainer {
            node: node.address.clone(),
            name: service::ETCD.to_string(),
        });
    }
    push_first_start(&mut plan, ctx, node, &initial);
    Ok(Some(plan))
}

/// Restart one member whose parameters drifted, once every member is in sync
pub fn restart(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let etcd = &ctx.status.etcd;
    if !etcd.is_healthy || etcd.members.keys().any(|a| !etcd.is_in_sync(a)) {
        return Ok(None);
    }
    for node in ctx.cluster.control_plane_nodes() {
        if etcd.member(&node.address).is_none() || !ctx.has_service(node, service::ETCD) {
            continue;
        }
        if ctx.is_current(node, service::ETCD)? {
            continue;
        }
        let plan = Plan::new("etcd-restart", vec![node.address.clone()])
            .then(InstallEtcdFiles { node: node.clone() })
            .then(PullImage {
                node: node.address.clone(),
                image: images::ETCD.to_string(),
            })
            .then(RunContainer {
                node: node.address.clone(),
                spec: services::etcd(ctx.cluster, node, None),
            });
        return Ok(Some(plan));
    }
    Ok(None)
}

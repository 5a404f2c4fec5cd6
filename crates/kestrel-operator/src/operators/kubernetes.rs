//! Kubernetes control plane, node services and Node objects

use std::collections::BTreeSet;

use kestrel_common::images::{self, service};
use kestrel_common::{KubeNodeStatus, Node, Result, Taint};

use super::Context;
use crate::commands::{
    desired_annotations, desired_labels, desired_taints, managed_taint_keys, merge_taints,
    InstallControlPlaneFiles, InstallNodeFiles, PullImage, RemoveKubeNode, RunContainer,
    UpdateKubeNode,
};
use crate::operator::Plan;
use crate::services;

/// Services a node runs, in start order
fn expected_services(node: &Node) -> Vec<&'static str> {
    let mut names = Vec::new();
    if node.control_plane {
        names.extend(service::CONTROL_PLANE);
    }
    names.extend(service::NODE);
    names
}

fn push_run(plan: &mut Plan, ctx: &Context<'_>, node: &Node, name: &str) -> Result<()> {
    plan.push(RunContainer {
        node: node.address.clone(),
        spec: services::desired(name, ctx.cluster, node, ctx.config)?,
    });
    Ok(())
}

fn push_pull(plan: &mut Plan, node: &Node) {
    plan.push(PullImage {
        node: node.address.clone(),
        image: images::KUBERNETES.to_string(),
    });
}

/// Start the control plane when no API server was ever created
pub fn control_plane_bootstrap(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let nodes: Vec<&Node> = ctx.cluster.control_plane_nodes().collect();
    if nodes.iter().any(|n| ctx.has_service(n, service::KUBE_APISERVER)) {
        return Ok(None);
    }
    let mut plan = Plan::new(
        "kube-control-plane-bootstrap",
        nodes.iter().map(|n| n.address.clone()).collect(),
    );
    for node in nodes {
        plan.push(InstallControlPlaneFiles { node: node.clone() });
        push_pull(&mut plan, node);
        for name in service::CONTROL_PLANE {
            push_run(&mut plan, ctx, node, name)?;
        }
    }
    Ok(plan.non_empty())
}

/// Start kubelet and kube-proxy on nodes that never ran them
pub fn worker_bootstrap(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let nodes: Vec<&Node> = ctx
        .cluster
        .nodes
        .iter()
        .filter(|n| !ctx.has_service(n, service::KUBELET))
        .collect();
    let mut plan = Plan::new(
        "kube-worker-bootstrap",
        nodes.iter().map(|n| n.address.clone()).collect(),
    );
    for node in nodes {
        plan.push(InstallNodeFiles { node: node.clone() });
        push_pull(&mut plan, node);
        for name in service::NODE {
            push_run(&mut plan, ctx, node, name)?;
        }
    }
    Ok(plan.non_empty())
}

/// Whether one of `names` is stale because its container does not exist
fn any_missing(ctx: &Context<'_>, node: &Node, stale: &[&str], names: &[&str]) -> bool {
    names
        .iter()
        .any(|n| stale.iter().any(|s| s == n) && !ctx.has_service(node, n))
}

/// Recreate drifted or missing services on one node, control plane first
pub fn restart(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let ordered = ctx
        .cluster
        .control_plane_nodes()
        .chain(ctx.cluster.worker_nodes());
    for node in ordered {
        let mut stale = Vec::new();
        for name in expected_services(node) {
            if !ctx.is_current(node, name)? {
                stale.push(name);
            }
        }
        if stale.is_empty() {
            continue;
        }

        let mut plan = Plan::new("kube-restart", vec![node.address.clone()]);
        if node.control_plane && any_missing(ctx, node, &stale, &service::CONTROL_PLANE) {
            plan.push(InstallControlPlaneFiles { node: node.clone() });
        }
        if any_missing(ctx, node, &stale, &service::NODE) {
            plan.push(InstallNodeFiles { node: node.clone() });
        }
        push_pull(&mut plan, node);
        for name in stale {
            push_run(&mut plan, ctx, node, name)?;
        }
        return Ok(Some(plan));
    }
    Ok(None)
}

/// Delete Node objects of machines that left the cluster
pub fn node_remove(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let kubernetes = &ctx.status.kubernetes;
    if !kubernetes.is_ready {
        return Ok(None);
    }
    let wanted: BTreeSet<&str> = ctx.cluster.nodes.iter().map(|n| n.nodename()).collect();
    let gone: Vec<String> = kubernetes
        .nodes
        .keys()
        .filter(|name| !wanted.contains(name.as_str()))
        .cloned()
        .collect();
    let mut plan = Plan::new("kube-node-remove", gone.clone());
    for name in gone {
        plan.push(RemoveKubeNode { name });
    }
    Ok(plan.non_empty())
}

fn taint_set(taints: &[Taint]) -> BTreeSet<(&str, &str, String)> {
    taints
        .iter()
        .map(|t| (t.key.as_str(), t.value.as_str(), t.effect.to_string()))
        .collect()
}

fn needs_update(node: &Node, current: &KubeNodeStatus, taint_control_plane: bool) -> bool {
    let labels_missing = desired_labels(node)
        .iter()
        .any(|(k, v)| current.labels.get(k) != Some(v));
    let annotations_missing = desired_annotations(node, taint_control_plane)
        .iter()
        .any(|(k, v)| current.annotations.get(k) != Some(v));
    let desired = desired_taints(node, taint_control_plane);
    let managed = managed_taint_keys(&desired, &current.annotations);
    let taints_differ = taint_set(&merge_taints(&current.taints, &desired, &managed))
        != taint_set(&current.taints);
    labels_missing || annotations_missing || taints_differ
}

/// Bring labels, annotations and taints of registered Node objects in line
pub fn node_update(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let kubernetes = &ctx.status.kubernetes;
    if !kubernetes.is_ready {
        return Ok(None);
    }
    let taint_control_plane = ctx.cluster.taint_control_plane;
    let nodes: Vec<&Node> = ctx
        .cluster
        .nodes
        .iter()
        .filter(|n| {
            kubernetes
                .nodes
                .get(n.nodename())
                .is_some_and(|current| needs_update(n, current, taint_control_plane))
        })
        .collect();
    let mut plan = Plan::new(
        "kube-node-update",
        nodes.iter().map(|n| n.nodename().to_string()).collect(),
    );
    for node in nodes {
        plan.push(UpdateKubeNode {
            node: node.clone(),
            taint_control_plane,
        });
    }
    Ok(plan.non_empty())
}

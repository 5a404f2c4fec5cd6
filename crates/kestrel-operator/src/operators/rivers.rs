use kestrel_common::images::{self, service};
use kestrel_common::Result;

use super::Context;
use crate::commands::{PullImage, RunContainer};
use crate::operator::Plan;
use crate::services;

/// Start rivers on nodes where it was never created
pub fn bootstrap(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let nodes: Vec<_> = ctx
        .cluster
        .nodes
        .iter()
        .filter(|n| !ctx.has_service(n, service::RIVERS))
        .collect();
    let mut plan = Plan::new(
        "rivers-bootstrap",
        nodes.iter().map(|n| n.address.clone()).collect(),
    );
    for node in nodes {
        plan.push(PullImage {
            node: node.address.clone(),
            image: images::TOOLS.to_string(),
        })
        .push(RunContainer {
            node: node.address.clone(),
            spec: services::rivers(ctx.cluster, ctx.config),
        });
    }
    Ok(plan.non_empty())
}

/// Recreate rivers where it stopped or its upstream list changed
pub fn restart(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let spec = services::rivers(ctx.cluster, ctx.config);
    let mut nodes = Vec::new();
    for node in &ctx.cluster.nodes {
        if ctx.has_service(node, service::RIVERS) && !ctx.is_current(node, service::RIVERS)? {
            nodes.push(node);
        }
    }
    let mut plan = Plan::new(
        "rivers-restart",
        nodes.iter().map(|n| n.address.clone()).collect(),
    );
    for node in nodes {
        plan.push(RunContainer {
            node: node.address.clone(),
            spec: spec.clone(),
        });
    }
    Ok(plan.non_empty())
}

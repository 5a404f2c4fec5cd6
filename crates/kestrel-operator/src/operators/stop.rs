use kestrel_common::images::service;
use kestrel_common::Result;

use super::Context;
use crate::commands::StopContainer;
use crate::operator::Plan;

/// Stop control plane services on nodes that are no longer control plane
pub fn stop_control_plane(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let mut targets = Vec::new();
    let mut stops = Vec::new();
    for node in ctx.cluster.worker_nodes() {
        let running: Vec<&str> = service::CONTROL_PLANE
            .into_iter()
            .filter(|name| ctx.has_service(node, name))
            .collect();
        if running.is_empty() {
            continue;
        }
        targets.push(node.address.clone());
        stops.extend(running.into_iter().map(|name| StopContainer {
            node: node.address.clone(),
            name: name.to_string(),
        }));
    }

    let mut plan = Plan::new("stop-control-plane", targets);
    for stop in stops {
        plan.push(stop);
    }
    Ok(plan.non_empty())
}

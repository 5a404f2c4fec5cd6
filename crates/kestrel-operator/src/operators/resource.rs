use tracing::warn;

use kestrel_common::Result;

use super::Context;
use crate::commands::ApplyResource;
use crate::operator::Plan;

/// Apply every stored resource whose revision or image is not live yet
///
/// Definitions that cannot be decoded are skipped so one bad resource does
/// not hold back the rest.
pub fn apply(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let kubernetes = &ctx.status.kubernetes;
    if !kubernetes.is_ready {
        return Ok(None);
    }
    let mut pending = Vec::new();
    for definition in ctx.resources {
        if !definition.need_update(kubernetes.resource_annotations.get(&definition.key)) {
            continue;
        }
        if let Err(e) = kestrel_resource::decode(definition) {
            warn!(key = %definition.key, error = %e, "skipping undecodable resource");
            continue;
        }
        pending.push(definition);
    }

    let mut plan = Plan::new(
        "resource-apply",
        pending.iter().map(|d| d.key.clone()).collect(),
    );
    for definition in pending {
        plan.push(ApplyResource {
            definition: definition.clone(),
        });
    }
    Ok(plan.non_empty())
}

use kestrel_common::{Result, CONFIG_VERSION};
use kestrel_pki::CaKind;

use super::Context;
use crate::commands::{GenerateServiceAccountKey, InitializeCa, SetConfigVersion};
use crate::operator::Plan;

/// Initialize missing CAs and the service-account key, then stamp the version
pub fn upgrade(ctx: &Context<'_>) -> Result<Option<Plan>> {
    let status = ctx.status;
    let mut plan = Plan::new("upgrade", Vec::new());

    for ca in CaKind::ALL {
        if status.missing_cas.contains(ca.name()) {
            plan.push(InitializeCa { ca });
        }
    }
    if status.service_account_missing {
        plan.push(GenerateServiceAccountKey);
    }
    if status.config_version.as_deref() != Some(CONFIG_VERSION) {
        plan.push(SetConfigVersion);
    }
    Ok(plan.non_empty())
}

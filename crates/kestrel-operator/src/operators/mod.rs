//! Operators for every phase and the decision procedure
//!
//! Planning is pure: an operator is computed from the desired cluster, the
//! observed status and the stored resources, with no I/O. Each phase lists
//! its candidate operators in priority order and the first one with work
//! wins.

mod etcd;
mod kubernetes;
mod resource;
mod rivers;
mod stop;
mod upgrade;

use tracing::debug;

use kestrel_common::config::EngineConfig;
use kestrel_common::{Cluster, ClusterStatus, Error, Node, NodeStatus, ResourceDefinition, Result};

use crate::operator::Plan;
use crate::phase::{next_phase, Phase};
use crate::services;

/// Everything planning may look at
#[derive(Clone, Copy, Debug)]
pub struct Context<'a> {
    /// Desired cluster
    pub cluster: &'a Cluster,
    /// Observed status
    pub status: &'a ClusterStatus,
    /// Stored resource definitions in creation order
    pub resources: &'a [ResourceDefinition],
    /// Engine tunables
    pub config: &'a EngineConfig,
}

impl<'a> Context<'a> {
    fn node_status(&self, address: &str) -> Option<&'a NodeStatus> {
        self.status.node(address)
    }

    fn has_service(&self, node: &Node, name: &str) -> bool {
        self.node_status(&node.address)
            .and_then(|s| s.service(name))
            .is_some()
    }

    fn is_running(&self, node: &Node, name: &str) -> bool {
        self.node_status(&node.address)
            .is_some_and(|s| s.is_running(name))
    }

    fn has_etcd_data(&self, node: &Node) -> bool {
        self.node_status(&node.address)
            .is_some_and(|s| s.etcd.has_data)
    }

    /// Whether `name` runs on `node` exactly as the cluster asks
    fn is_current(&self, node: &Node, name: &str) -> Result<bool> {
        let spec = services::desired(name, self.cluster, node, self.config)?;
        let status = self.node_status(&node.address).and_then(|s| s.service(name));
        Ok(services::is_current(status, &spec))
    }
}

type Candidate = fn(&Context<'_>) -> Result<Option<Plan>>;

const UPGRADE: &[Candidate] = &[upgrade::upgrade];
const RIVERS: &[Candidate] = &[rivers::bootstrap, rivers::restart];
const ETCD_BOOT_ABORTED: &[Candidate] = &[etcd::bootstrap_aborted];
const ETCD_BOOT: &[Candidate] = &[etcd::bootstrap];
const ETCD_START: &[Candidate] = &[etcd::start];
const ETCD_WAIT: &[Candidate] = &[etcd::wait_cluster];
const K8S_START: &[Candidate] = &[
    kubernetes::control_plane_bootstrap,
    kubernetes::worker_bootstrap,
];
const ETCD_MAINTAIN: &[Candidate] = &[
    etcd::remove_member,
    etcd::destroy_member,
    etcd::add_member,
    etcd::restart,
];
const K8S_MAINTAIN: &[Candidate] = &[
    kubernetes::restart,
    kubernetes::node_remove,
    kubernetes::node_update,
    resource::apply,
];
const STOP_CONTROL_PLANE: &[Candidate] = &[stop::stop_control_plane];

fn candidates(phase: Phase) -> &'static [Candidate] {
    match phase {
        Phase::Upgrade => UPGRADE,
        Phase::Rivers => RIVERS,
        Phase::EtcdBootAborted => ETCD_BOOT_ABORTED,
        Phase::EtcdBoot => ETCD_BOOT,
        Phase::EtcdStart => ETCD_START,
        Phase::EtcdWait => ETCD_WAIT,
        Phase::K8sStart => K8S_START,
        Phase::EtcdMaintain => ETCD_MAINTAIN,
        Phase::K8sMaintain => K8S_MAINTAIN,
        Phase::StopControlPlane => STOP_CONTROL_PLANE,
        Phase::Completed => &[],
    }
}

/// Operator for one phase, if the phase has work
pub fn operator_for(phase: Phase, ctx: &Context<'_>) -> Result<Option<Plan>> {
    for candidate in candidates(phase) {
        if let Some(plan) = candidate(ctx)? {
            return Ok(Some(plan));
        }
    }
    Ok(None)
}

/// The phase a tick ends up in and the operator to run there
#[derive(Debug)]
pub struct Decision {
    /// Phase holding the operator, or `Completed`
    pub phase: Phase,
    /// `None` only when `phase` is `Completed`
    pub operator: Option<Plan>,
}

/// Upper bound on phases visited in one decision
const MAX_STEPS: usize = 4 * Phase::ALL.len();

/// Walk the transition table from `start` until a phase yields an operator
pub fn decide(start: Phase, ctx: &Context<'_>) -> Result<Decision> {
    let mut phase = start;
    for _ in 0..MAX_STEPS {
        if phase == Phase::Completed {
            return Ok(Decision {
                phase,
                operator: None,
            });
        }
        if let Some(plan) = operator_for(phase, ctx)? {
            return Ok(Decision {
                phase,
                operator: Some(plan),
            });
        }
        let next = next_phase(phase, ctx.status);
        debug!(from = %phase, to = %next, "phase satisfied");
        phase = next;
    }
    Err(Error::internal_with_context(
        "decide",
        format!("no progress after {MAX_STEPS} phases starting at {start}"),
    ))
}

//! Convergence phases and the transition table
//!
//! A phase is left once it yields no operator. Where it goes next is looked
//! up in [`TRANSITIONS`]: the first row whose source matches and whose
//! condition holds for the observed status wins.

use std::fmt;

use kestrel_common::ClusterStatus;

/// One discrete state of cluster convergence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Storage layout migration, CA and service-account initialization
    Upgrade,
    /// Local API proxy on every node
    Rivers,
    /// Cleanup of a bootstrap that left etcd half-initialized
    EtcdBootAborted,
    /// First start of the etcd cluster
    EtcdBoot,
    /// Start stopped etcd members that still have data
    EtcdStart,
    /// Wait for etcd to report healthy
    EtcdWait,
    /// First start of the Kubernetes control plane and node services
    K8sStart,
    /// etcd membership changes and restarts
    EtcdMaintain,
    /// Kubernetes restarts, Node objects and user resources
    K8sMaintain,
    /// Stop control plane services on nodes that lost the role
    StopControlPlane,
    /// Nothing left to do
    Completed,
}

impl Phase {
    /// Every phase in forward order
    pub const ALL: [Phase; 11] = [
        Phase::Upgrade,
        Phase::Rivers,
        Phase::EtcdBootAborted,
        Phase::EtcdBoot,
        Phase::EtcdStart,
        Phase::EtcdWait,
        Phase::K8sStart,
        Phase::EtcdMaintain,
        Phase::K8sMaintain,
        Phase::StopControlPlane,
        Phase::Completed,
    ];

    /// Name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Upgrade => "upgrade",
            Phase::Rivers => "rivers",
            Phase::EtcdBootAborted => "etcd-boot-aborted",
            Phase::EtcdBoot => "etcd-boot",
            Phase::EtcdStart => "etcd-start",
            Phase::EtcdWait => "etcd-wait",
            Phase::K8sStart => "k8s-start",
            Phase::EtcdMaintain => "etcd-maintain",
            Phase::K8sMaintain => "k8s-maintain",
            Phase::StopControlPlane => "stop-control-plane",
            Phase::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate over observed status guarding a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    /// Always taken
    Always,
    /// Bootstrap never completed, some member has data and etcd is unhealthy
    EtcdHalfBooted,
    /// Bootstrap never completed and etcd is not half-booted
    EtcdUnbooted,
}

impl Condition {
    /// Evaluate against a status snapshot
    pub fn holds(&self, status: &ClusterStatus) -> bool {
        let any_data = status.nodes.values().any(|n| n.etcd.has_data);
        match self {
            Condition::Always => true,
            Condition::EtcdHalfBooted => {
                !status.etcd.bootstrapped && any_data && !status.etcd.is_healthy
            }
            Condition::EtcdUnbooted => {
                !status.etcd.bootstrapped && (!any_data || status.etcd.is_healthy)
            }
        }
    }
}

/// One row of the transition table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Phase being left
    pub from: Phase,
    /// Guard
    pub when: Condition,
    /// Phase entered
    pub to: Phase,
}

const fn edge(from: Phase, when: Condition, to: Phase) -> Transition {
    Transition { from, when, to }
}

/// The transition table, evaluated top to bottom
pub const TRANSITIONS: &[Transition] = &[
    edge(Phase::Upgrade, Condition::Always, Phase::Rivers),
    edge(Phase::Rivers, Condition::EtcdHalfBooted, Phase::EtcdBootAborted),
    edge(Phase::Rivers, Condition::EtcdUnbooted, Phase::EtcdBoot),
    edge(Phase::Rivers, Condition::Always, Phase::EtcdStart),
    edge(Phase::EtcdBootAborted, Condition::Always, Phase::EtcdBoot),
    edge(Phase::EtcdBoot, Condition::EtcdHalfBooted, Phase::EtcdBootAborted),
    edge(Phase::EtcdBoot, Condition::Always, Phase::EtcdStart),
    edge(Phase::EtcdStart, Condition::Always, Phase::EtcdWait),
    edge(Phase::EtcdWait, Condition::Always, Phase::K8sStart),
    edge(Phase::K8sStart, Condition::Always, Phase::EtcdMaintain),
    edge(Phase::EtcdMaintain, Condition::Always, Phase::K8sMaintain),
    edge(Phase::K8sMaintain, Condition::Always, Phase::StopControlPlane),
    edge(Phase::StopControlPlane, Condition::Always, Phase::Completed),
];

/// Phase entered after `from` is satisfied; `Completed` stays put
pub fn next_phase(from: Phase, status: &ClusterStatus) -> Phase {
    TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.when.holds(status))
        .map(|t| t.to)
        .unwrap_or(Phase::Completed)
}

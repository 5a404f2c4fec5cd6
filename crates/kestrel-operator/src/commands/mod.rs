//! Commanders: single side-effecting steps
//!
//! Every commander is idempotent. Files are rewritten atomically, containers
//! are replaced rather than mutated, and membership changes check the current
//! membership first, so re-running a step after a partial failure converges.

mod etcd;
mod kubernetes;
mod node;
mod upgrade;

pub use etcd::{AddEtcdMember, RemoveEtcdMember, WaitEtcdHealthy};
pub use kubernetes::{
    desired_annotations, desired_labels, desired_taints, managed_taint_keys, merge_taints,
    ApplyResource, RemoveKubeNode, UpdateKubeNode, CONTROL_PLANE_LABEL, CONTROL_PLANE_TAINT,
};
pub use node::{
    CreateVolume, InstallControlPlaneFiles, InstallEtcdFiles, InstallNodeFiles, PullImage,
    RemoveVolume, RunContainer, StopContainer,
};
pub use upgrade::{GenerateServiceAccountKey, InitializeCa, MarkEtcdBootstrapped, SetConfigVersion};

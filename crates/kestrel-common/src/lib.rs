//! Common types for kestrel: cluster model, errors, configuration and utilities

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod constraints;
pub mod error;
pub mod images;
pub mod record;
pub mod resource;
pub mod retry;
pub mod status;
pub mod telemetry;
pub mod vault;

pub use cluster::{Cluster, EtcdBackupConfig, Mount, Node, Options, ServiceParams, Taint, TaintEffect};
pub use constraints::Constraints;
pub use error::Error;
pub use vault::VaultConfig;
pub use record::{Command, Record, RecordStatus};
pub use resource::{resource_key, sort_resources, ResourceDefinition, ResourceKind};
pub use status::{
    ClusterStatus, EtcdClusterStatus, EtcdMember, EtcdNodeStatus, KubeNodeStatus,
    KubernetesClusterStatus, NodeStatus, ServiceStatus,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation holding the revision of an applied user resource
pub const ANNOTATION_REVISION: &str = "kestrel.io/revision";

/// Annotation holding the image hint of an applied user resource
pub const ANNOTATION_IMAGE: &str = "kestrel.io/image";

/// Node annotation listing the taint keys kestrel owns, comma separated
pub const ANNOTATION_MANAGED_TAINTS: &str = "kestrel.io/managed-taints";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kestrel";

/// Version of the stored configuration layout understood by this build
pub const CONFIG_VERSION: &str = "1";

/// Directory on every node holding certificates and kubeconfigs
pub const NODE_CONFIG_DIR: &str = "/etc/kestrel";

/// Directory on every node holding per-container start parameters
pub const NODE_PARAMS_DIR: &str = "/var/lib/kestrel/params";

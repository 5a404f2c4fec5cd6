//! Remote execution and per-tick infrastructure for kestrel
//!
//! An [`Agent`] runs shell commands on one node; [`ContainerEngine`] drives
//! the node's container CLI through it. [`Infrastructure`] wires one agent
//! per node together with storage, the certificate authorities and client
//! factories for the managed etcd and Kubernetes API.

#![deny(missing_docs)]

pub mod agent;
pub mod engine;
pub mod infrastructure;
pub mod kubeconfig;
pub mod session;
pub mod testing;

pub use agent::{install_file, remove_files, Agent, CommandOutput, SshAgent};
pub use engine::{ContainerEngine, ParamsRecord, SystemContainer};
pub use infrastructure::{Infrastructure, ETCD_CLIENT_PORT, ETCD_PEER_PORT};
pub use kubeconfig::Kubeconfig;
pub use session::{CertCache, Session};

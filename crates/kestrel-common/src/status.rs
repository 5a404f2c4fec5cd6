//! Observed cluster state
//!
//! Every value here is rebuilt from live probes at the start of a tick and
//! dropped at its end. Nothing in this module is persisted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cluster::Taint;
use crate::ServiceParams;

/// State of one system container on a node
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Container exists and is running
    pub running: bool,
    /// Image the container was created from
    pub image: String,
    /// Built-in parameters recorded when the container was started
    pub built_in_params: ServiceParams,
    /// Extra parameters recorded when the container was started
    pub extra_params: ServiceParams,
}

impl ServiceStatus {
    /// True when the container runs `image` with exactly the given parameters
    pub fn matches(&self, image: &str, built_in: &ServiceParams, extra: &ServiceParams) -> bool {
        self.running
            && self.image == image
            && &self.built_in_params == built_in
            && &self.extra_params == extra
    }
}

/// Local etcd state of a control plane node
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EtcdNodeStatus {
    /// The etcd data volume exists
    pub has_data: bool,
}

/// Observed state of one node
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node address
    pub address: String,
    /// The SSH transport is usable
    pub ssh_connected: bool,
    /// Local etcd data state
    pub etcd: EtcdNodeStatus,
    /// System containers keyed by service name; absent means not created
    pub services: BTreeMap<String, ServiceStatus>,
}

impl NodeStatus {
    /// Status of a service, `None` when the container does not exist
    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.get(name)
    }

    /// True when the named service is running
    pub fn is_running(&self, name: &str) -> bool {
        self.service(name).is_some_and(|s| s.running)
    }
}

/// One etcd cluster member as reported by the member list
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EtcdMember {
    /// Member ID
    pub id: u64,
    /// Member name (node address); empty until the member has started
    pub name: String,
    /// Peer URLs
    pub peer_urls: Vec<String>,
}

impl EtcdMember {
    /// Node address extracted from the first peer URL
    pub fn address(&self) -> Option<&str> {
        let url = self.peer_urls.first()?;
        let rest = url.split("://").nth(1).unwrap_or(url);
        rest.rsplit_once(':').map(|(host, _)| host).or(Some(rest))
    }
}

/// Observed state of the managed etcd cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EtcdClusterStatus {
    /// Cluster answered a health query
    pub is_healthy: bool,
    /// The bootstrap completion marker is present in storage
    pub bootstrapped: bool,
    /// Members keyed by node address
    pub members: BTreeMap<String, EtcdMember>,
    /// Per-member health keyed by node address
    pub in_sync: BTreeMap<String, bool>,
}

impl EtcdClusterStatus {
    /// Member running on a node
    pub fn member(&self, address: &str) -> Option<&EtcdMember> {
        self.members.get(address)
    }

    /// Whether the member on `address` reported healthy
    pub fn is_in_sync(&self, address: &str) -> bool {
        self.in_sync.get(address).copied().unwrap_or(false)
    }
}

/// Observed state of one Kubernetes Node object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct KubeNodeStatus {
    /// Node object name
    pub name: String,
    /// Ready condition is True
    pub ready: bool,
    /// Current labels
    pub labels: BTreeMap<String, String>,
    /// Current annotations
    pub annotations: BTreeMap<String, String>,
    /// Current taints
    pub taints: Vec<Taint>,
}

/// Observed state of the Kubernetes API
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct KubernetesClusterStatus {
    /// The API server answered
    pub is_ready: bool,
    /// Node objects keyed by name
    pub nodes: BTreeMap<String, KubeNodeStatus>,
    /// Annotations of existing user resources keyed by resource key
    pub resource_annotations: BTreeMap<String, BTreeMap<String, String>>,
}

/// Everything a tick knows about the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterStatus {
    /// Stored configuration version, `None` when never written
    pub config_version: Option<String>,
    /// CA names whose root certificate is absent from storage
    pub missing_cas: BTreeSet<String>,
    /// The service-account signing key is absent from storage
    pub service_account_missing: bool,
    /// etcd cluster state
    pub etcd: EtcdClusterStatus,
    /// Kubernetes API state
    pub kubernetes: KubernetesClusterStatus,
    /// Per-node state keyed by address
    pub nodes: BTreeMap<String, NodeStatus>,
}

impl ClusterStatus {
    /// Status of a node, if it was probed
    pub fn node(&self, address: &str) -> Option<&NodeStatus> {
        self.nodes.get(address)
    }
}

//! Desired cluster definition
//!
//! A [`Cluster`] is written by an administrator and read by the engine on
//! every tick. It is validated in full before any mutation is attempted.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Default Kubernetes cluster domain
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Default name of the etcd data volume on control plane nodes
pub const DEFAULT_ETCD_VOLUME: &str = "kestrel-etcd";

/// Effect of a node taint
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum TaintEffect {
    /// Do not schedule new pods
    #[default]
    NoSchedule,
    /// Avoid scheduling new pods
    PreferNoSchedule,
    /// Evict running pods
    NoExecute,
}

impl std::fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSchedule => write!(f, "NoSchedule"),
            Self::PreferNoSchedule => write!(f, "PreferNoSchedule"),
            Self::NoExecute => write!(f, "NoExecute"),
        }
    }
}

/// A Kubernetes node taint
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default)]
    pub value: String,
    /// Taint effect
    #[serde(default)]
    pub effect: TaintEffect,
}

/// A machine in the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Node {
    /// IPv4 address reachable over SSH
    pub address: String,
    /// Host name; the address is used when empty
    #[serde(default)]
    pub hostname: String,
    /// SSH login user
    pub user: String,
    /// Whether this node runs etcd and the Kubernetes control plane
    #[serde(default)]
    pub control_plane: bool,
    /// Annotations to set on the Kubernetes Node object
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Labels to set on the Kubernetes Node object
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Taints to set on the Kubernetes Node object
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl Node {
    /// Name used for the etcd member and the Kubernetes Node
    pub fn nodename(&self) -> &str {
        if self.hostname.is_empty() {
            &self.address
        } else {
            &self.hostname
        }
    }
}

/// Extra bind mount for a system container
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mount {
    /// Host path
    pub source: String,
    /// Path inside the container
    pub destination: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// Read-only bind mount
    pub fn ro(path: &str) -> Self {
        Self {
            source: path.to_string(),
            destination: path.to_string(),
            read_only: true,
        }
    }

    /// Read-write bind mount
    pub fn rw(path: &str) -> Self {
        Self {
            source: path.to_string(),
            destination: path.to_string(),
            read_only: false,
        }
    }

    /// Argument for `docker run --volume`
    pub fn to_volume_arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.destination)
        } else {
            format!("{}:{}", self.source, self.destination)
        }
    }
}

/// Parameters a system container is started with
///
/// Used both for the engine's built-in parameters and for the
/// administrator-supplied extras in [`Options`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceParams {
    /// Command-line arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Bind mounts
    #[serde(default)]
    pub extra_binds: Vec<Mount>,
    /// Environment variables
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl ServiceParams {
    /// Parameters consisting of arguments only
    pub fn args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extra_args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Add bind mounts
    pub fn with_binds(mut self, binds: impl IntoIterator<Item = Mount>) -> Self {
        self.extra_binds.extend(binds);
        self
    }

    fn validate(&self, cluster: &str, field: &str) -> Result<(), Error> {
        for (i, bind) in self.extra_binds.iter().enumerate() {
            if !bind.source.starts_with('/') || !bind.destination.starts_with('/') {
                return Err(Error::validation_for_field(
                    cluster,
                    format!("{field}.extra_binds[{i}]"),
                    "bind paths must be absolute",
                ));
            }
        }
        for key in self.extra_env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(Error::validation_for_field(
                    cluster,
                    format!("{field}.extra_env"),
                    format!("invalid environment variable name {key:?}"),
                ));
            }
        }
        Ok(())
    }
}

/// etcd options
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct EtcdOptions {
    /// Extra parameters
    #[serde(flatten)]
    pub params: ServiceParams,
    /// Name of the data volume
    #[serde(default = "default_etcd_volume")]
    pub volume_name: String,
}

fn default_etcd_volume() -> String {
    DEFAULT_ETCD_VOLUME.to_string()
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            params: ServiceParams::default(),
            volume_name: default_etcd_volume(),
        }
    }
}

/// kubelet options
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KubeletOptions {
    /// Extra parameters
    #[serde(flatten)]
    pub params: ServiceParams,
    /// Cluster DNS domain
    #[serde(default = "default_domain")]
    pub domain: String,
}

fn default_domain() -> String {
    DEFAULT_CLUSTER_DOMAIN.to_string()
}

impl Default for KubeletOptions {
    fn default() -> Self {
        Self {
            params: ServiceParams::default(),
            domain: default_domain(),
        }
    }
}

/// Per-component options
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Options {
    /// etcd
    #[serde(default)]
    pub etcd: EtcdOptions,
    /// rivers (local TCP proxy to the API servers)
    #[serde(default)]
    pub rivers: ServiceParams,
    /// kube-apiserver
    #[serde(default)]
    pub kube_api: ServiceParams,
    /// kube-controller-manager
    #[serde(default)]
    pub kube_controller_manager: ServiceParams,
    /// kube-scheduler
    #[serde(default)]
    pub kube_scheduler: ServiceParams,
    /// kube-proxy
    #[serde(default)]
    pub kube_proxy: ServiceParams,
    /// kubelet
    #[serde(default)]
    pub kubelet: KubeletOptions,
}

/// etcd backup settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct EtcdBackupConfig {
    /// Whether periodic backups are enabled
    #[serde(default)]
    pub enabled: bool,
    /// PersistentVolumeClaim receiving snapshots
    #[serde(default)]
    pub pvc_name: String,
    /// Cron schedule
    #[serde(default)]
    pub schedule: String,
    /// Number of snapshots to keep
    #[serde(default)]
    pub rotate: u32,
}

/// The desired cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Cluster {
    /// Cluster name
    pub name: String,
    /// Machines
    pub nodes: Vec<Node>,
    /// Taint control plane nodes with NoSchedule
    #[serde(default)]
    pub taint_control_plane: bool,
    /// CIDR for Service cluster IPs
    pub service_subnet: String,
    /// CIDR for pod IPs
    #[serde(default)]
    pub pod_subnet: String,
    /// Upstream DNS servers
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// `namespace/name` of a Service providing upstream DNS
    #[serde(default)]
    pub dns_service: String,
    /// etcd backup settings
    #[serde(default)]
    pub etcd_backup: EtcdBackupConfig,
    /// Per-component options
    #[serde(default)]
    pub options: Options,
}

impl Cluster {
    /// Control plane nodes in definition order
    pub fn control_plane_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.control_plane)
    }

    /// Worker nodes in definition order
    pub fn worker_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.control_plane)
    }

    /// Look up a node by address
    pub fn node(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// Cluster DNS domain
    pub fn domain(&self) -> &str {
        &self.options.kubelet.domain
    }

    /// Validate the cluster definition
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::validation("cluster name is empty"));
        }
        let name = self.name.as_str();

        if self.nodes.is_empty() {
            return Err(Error::validation_for_field(name, "nodes", "no nodes"));
        }

        let mut addresses = HashSet::new();
        let mut names = HashSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            node.address.parse::<Ipv4Addr>().map_err(|_| {
                Error::validation_for_field(
                    name,
                    format!("nodes[{i}].address"),
                    format!("invalid IPv4 address {:?}", node.address),
                )
            })?;
            if !addresses.insert(node.address.as_str()) {
                return Err(Error::validation_for_field(
                    name,
                    format!("nodes[{i}].address"),
                    format!("duplicate address {}", node.address),
                ));
            }
            if !node.hostname.is_empty() && !is_dns_subdomain(&node.hostname) {
                return Err(Error::validation_for_field(
                    name,
                    format!("nodes[{i}].hostname"),
                    format!("invalid hostname {:?}", node.hostname),
                ));
            }
            if !names.insert(node.nodename()) {
                return Err(Error::validation_for_field(
                    name,
                    format!("nodes[{i}].hostname"),
                    format!("duplicate node name {}", node.nodename()),
                ));
            }
            if node.user.is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    format!("nodes[{i}].user"),
                    "ssh user is empty",
                ));
            }
            for key in node.labels.keys().chain(node.annotations.keys()) {
                if !is_qualified_key(key) {
                    return Err(Error::validation_for_field(
                        name,
                        format!("nodes[{i}]"),
                        format!("invalid label or annotation key {key:?}"),
                    ));
                }
            }
            for taint in &node.taints {
                if !is_qualified_key(&taint.key) {
                    return Err(Error::validation_for_field(
                        name,
                        format!("nodes[{i}].taints"),
                        format!("invalid taint key {:?}", taint.key),
                    ));
                }
            }
        }

        if self.control_plane_nodes().next().is_none() {
            return Err(Error::validation_for_field(
                name,
                "nodes",
                "no control plane node",
            ));
        }

        let service = parse_cidr(&self.service_subnet).map_err(|e| {
            Error::validation_for_field(name, "service_subnet", e)
        })?;
        if !self.pod_subnet.is_empty() {
            let pod = parse_cidr(&self.pod_subnet)
                .map_err(|e| Error::validation_for_field(name, "pod_subnet", e))?;
            if cidrs_overlap(service, pod) {
                return Err(Error::validation_for_field(
                    name,
                    "pod_subnet",
                    "pod subnet overlaps service subnet",
                ));
            }
        }

        for server in &self.dns_servers {
            server.parse::<Ipv4Addr>().map_err(|_| {
                Error::validation_for_field(
                    name,
                    "dns_servers",
                    format!("invalid DNS server {server:?}"),
                )
            })?;
        }
        if !self.dns_service.is_empty() {
            let parts: Vec<&str> = self.dns_service.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
                return Err(Error::validation_for_field(
                    name,
                    "dns_service",
                    "must be namespace/name",
                ));
            }
        }

        if self.etcd_backup.enabled {
            if self.etcd_backup.pvc_name.is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    "etcd_backup.pvc_name",
                    "pvc name is required when backups are enabled",
                ));
            }
            if self.etcd_backup.schedule.is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    "etcd_backup.schedule",
                    "schedule is required when backups are enabled",
                ));
            }
        }

        self.validate_options()
    }

    fn validate_options(&self) -> Result<(), Error> {
        let name = self.name.as_str();
        let opts = &self.options;
        opts.etcd.params.validate(name, "options.etcd")?;
        opts.rivers.validate(name, "options.rivers")?;
        opts.kube_api.validate(name, "options.kube_api")?;
        opts.kube_controller_manager
            .validate(name, "options.kube_controller_manager")?;
        opts.kube_scheduler.validate(name, "options.kube_scheduler")?;
        opts.kube_proxy.validate(name, "options.kube_proxy")?;
        opts.kubelet.params.validate(name, "options.kubelet")?;

        if opts.etcd.volume_name.is_empty() {
            return Err(Error::validation_for_field(
                name,
                "options.etcd.volume_name",
                "volume name is empty",
            ));
        }
        if !is_dns_subdomain(&opts.kubelet.domain) {
            return Err(Error::validation_for_field(
                name,
                "options.kubelet.domain",
                format!("invalid domain {:?}", opts.kubelet.domain),
            ));
        }
        Ok(())
    }
}

/// Parse an IPv4 CIDR into its network address and prefix length
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), String> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| format!("invalid CIDR {cidr:?}"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| format!("invalid CIDR address in {cidr:?}"))?;
    let len: u8 = len
        .parse()
        .map_err(|_| format!("invalid CIDR prefix length in {cidr:?}"))?;
    if len > 30 {
        return Err(format!("CIDR {cidr:?} is too small"));
    }
    let mask = u32::MAX.checked_shl(32 - len as u32).unwrap_or(0);
    Ok((Ipv4Addr::from(u32::from(addr) & mask), len))
}

/// First usable address of a subnet (the kubernetes Service cluster IP)
pub fn first_address(cidr: &str) -> Result<Ipv4Addr, String> {
    let (network, _) = parse_cidr(cidr)?;
    Ok(Ipv4Addr::from(u32::from(network) + 1))
}

fn cidrs_overlap(a: (Ipv4Addr, u8), b: (Ipv4Addr, u8)) -> bool {
    let len = a.1.min(b.1);
    let mask = u32::MAX.checked_shl(32 - len as u32).unwrap_or(0);
    (u32::from(a.0) & mask) == (u32::from(b.0) & mask)
}

fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

fn is_dns_subdomain(name: &str) -> bool {
    name.len() <= 253 && name.split('.').all(is_dns_label)
}

/// Kubernetes qualified name, optionally prefixed with a DNS subdomain
fn is_qualified_key(key: &str) -> bool {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if !is_dns_subdomain(prefix) {
            return false;
        }
    }
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn node(address: &str, control_plane: bool) -> Node {
        Node {
            address: address.to_string(),
            user: "kestrel".to_string(),
            control_plane,
            ..Default::default()
        }
    }

    pub(crate) fn cluster(cp: usize, workers: usize) -> Cluster {
        let mut nodes = Vec::new();
        for i in 0..cp {
            nodes.push(node(&format!("10.0.0.{}", i + 1), true));
        }
        for i in 0..workers {
            nodes.push(node(&format!("10.0.1.{}", i + 1), false));
        }
        Cluster {
            name: "test".to_string(),
            nodes,
            service_subnet: "10.68.0.0/16".to_string(),
            pod_subnet: "10.64.0.0/14".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_cluster_passes() {
        cluster(3, 2).validate().unwrap();
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut c = cluster(1, 0);
        c.name.clear();
        assert!(c.validate().unwrap_err().to_string().contains("name is empty"));
    }

    #[test]
    fn control_plane_is_required() {
        let c = cluster(0, 2);
        assert!(c.validate().is_err());
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let mut c = cluster(2, 0);
        c.nodes[1].address = c.nodes[0].address.clone();
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate address"));
    }

    #[test]
    fn invalid_address_names_the_field() {
        let mut c = cluster(1, 1);
        c.nodes[1].address = "node-b".to_string();
        match c.validate().unwrap_err() {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("nodes[1].address"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn overlapping_subnets_are_rejected() {
        let mut c = cluster(1, 0);
        c.pod_subnet = "10.68.128.0/17".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn relative_binds_are_rejected() {
        let mut c = cluster(1, 0);
        c.options.kube_api.extra_binds.push(Mount {
            source: "var/log".to_string(),
            destination: "/var/log".to_string(),
            read_only: false,
        });
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn backup_requires_pvc_and_schedule() {
        let mut c = cluster(1, 0);
        c.etcd_backup.enabled = true;
        assert!(c.validate().is_err());
        c.etcd_backup.pvc_name = "etcdbackup".to_string();
        c.etcd_backup.schedule = "*/10 * * * *".to_string();
        c.validate().unwrap();
    }

    #[test]
    fn taint_keys_must_be_qualified() {
        let mut c = cluster(1, 0);
        c.nodes[0].taints.push(Taint {
            key: "-bad".to_string(),
            ..Default::default()
        });
        assert!(c.validate().is_err());
        c.nodes[0].taints[0].key = "example.com/dedicated".to_string();
        c.validate().unwrap();
    }

    #[test]
    fn nodename_falls_back_to_address() {
        let mut n = node("10.0.0.9", false);
        assert_eq!(n.nodename(), "10.0.0.9");
        n.hostname = "worker-9".to_string();
        assert_eq!(n.nodename(), "worker-9");
    }

    #[test]
    fn first_service_address() {
        assert_eq!(
            first_address("10.68.0.0/16").unwrap(),
            Ipv4Addr::new(10, 68, 0, 1)
        );
        assert_eq!(
            first_address("10.68.3.7/16").unwrap(),
            Ipv4Addr::new(10, 68, 0, 1)
        );
        assert!(first_address("10.68.0.0").is_err());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: Options = serde_json::from_str(r#"{"kube_api":{"extra_args":["--v=2"]}}"#).unwrap();
        assert_eq!(opts.kube_api.extra_args, vec!["--v=2"]);
        assert_eq!(opts.etcd.volume_name, DEFAULT_ETCD_VOLUME);
        assert_eq!(opts.kubelet.domain, DEFAULT_CLUSTER_DOMAIN);
    }
}

//! The five certificate authorities and their issuance functions
//!
//! | CA | Signs |
//! |----|-------|
//! | server | etcd and kube-apiserver serving certificates |
//! | etcd-peer | etcd peer certificates |
//! | etcd-client | etcd client certificates |
//! | kubernetes | component, kubelet and admin client certificates |
//! | kubernetes-aggregation | the API aggregation front proxy |
//!
//! Roles are ensured lazily: the first issuance against a role creates it if
//! the backend does not have it yet, after which this process skips the
//! check.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use kestrel_common::cluster::first_address;
use kestrel_common::{Error, Node, Result};

use crate::vault::{IssueRequest, IssuedCertificate, RolePolicy, SecretsBackend};

/// Lifetime of CA roots and long-lived system certificates
pub const SYSTEM_TTL: &str = "87600h";

/// Maximum lease of a PKI mount
pub const MOUNT_MAX_TTL: &str = "876000h";

/// Default lifetime of admin client certificates
pub const ADMIN_TTL: &str = "2h";

/// KV path of SSH private keys
pub const SSH_SECRET_PATH: &str = "kestrel/ssh";

/// One of the five certificate authorities
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CaKind {
    /// Serving certificates for etcd and kube-apiserver
    Server,
    /// etcd peer traffic
    EtcdPeer,
    /// etcd clients
    EtcdClient,
    /// Kubernetes client authentication
    Kubernetes,
    /// API aggregation front proxy
    KubernetesAggregation,
}

impl CaKind {
    /// Every CA
    pub const ALL: [CaKind; 5] = [
        Self::Server,
        Self::EtcdPeer,
        Self::EtcdClient,
        Self::Kubernetes,
        Self::KubernetesAggregation,
    ];

    /// Name used as the storage key suffix (`ca/<name>`)
    pub fn name(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::EtcdPeer => "etcd-peer",
            Self::EtcdClient => "etcd-client",
            Self::Kubernetes => "kubernetes",
            Self::KubernetesAggregation => "kubernetes-aggregation",
        }
    }

    /// PKI mount in the secrets backend
    pub fn mount(&self) -> String {
        format!("kestrel/ca-{}", self.name())
    }

    fn common_name(&self) -> &'static str {
        match self {
            Self::Server => "server CA",
            Self::EtcdPeer => "etcd peer CA",
            Self::EtcdClient => "etcd client CA",
            Self::Kubernetes => "kubernetes CA",
            Self::KubernetesAggregation => "kubernetes aggregation CA",
        }
    }
}

impl std::fmt::Display for CaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Roles defined on CA mounts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoleName {
    /// Long-lived certificates for system components
    System,
    /// Short-lived administrator client certificates
    Admin,
    /// kubelet client/serving certificates
    Kubelet,
}

impl RoleName {
    /// Role name in the secrets backend
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Admin => "admin",
            Self::Kubelet => "kubelet",
        }
    }
}

/// Fixed policy of a role on a CA
pub fn role_policy(ca: CaKind, role: RoleName) -> RolePolicy {
    let (server, client) = match ca {
        CaKind::Server | CaKind::EtcdPeer => (true, true),
        CaKind::EtcdClient | CaKind::KubernetesAggregation => (false, true),
        CaKind::Kubernetes => (role == RoleName::Kubelet, true),
    };
    let mut policy = RolePolicy {
        ttl: SYSTEM_TTL.to_string(),
        max_ttl: SYSTEM_TTL.to_string(),
        allow_any_name: true,
        enforce_hostnames: false,
        allow_ip_sans: true,
        server_flag: server,
        client_flag: client,
        organization: Vec::new(),
        key_type: "rsa".to_string(),
        key_bits: 2048,
    };
    match role {
        RoleName::System => {}
        RoleName::Admin => {
            policy.ttl = ADMIN_TTL.to_string();
            policy.max_ttl = "24h".to_string();
            policy.allow_ip_sans = false;
            policy.server_flag = false;
            if ca == CaKind::Kubernetes {
                policy.organization = vec!["system:masters".to_string()];
            }
        }
        RoleName::Kubelet => {
            policy.organization = vec!["system:nodes".to_string()];
        }
    }
    policy
}

/// SSH private keys read from the secrets backend
#[derive(Clone, Default)]
pub struct SshKeys {
    default: Option<String>,
    nodes: BTreeMap<String, String>,
}

impl SshKeys {
    /// Key for a node, falling back to the default key
    pub fn for_node(&self, address: &str) -> Option<&str> {
        self.nodes
            .get(address)
            .or(self.default.as_ref())
            .map(String::as_str)
    }
}

impl std::fmt::Debug for SshKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshKeys")
            .field("default", &self.default.is_some())
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Issues certificates from the five CAs
pub struct Pki {
    backend: Arc<dyn SecretsBackend>,
    ensured: Mutex<HashSet<(CaKind, RoleName)>>,
}

impl Pki {
    /// Wrap a secrets backend
    pub fn new(backend: Arc<dyn SecretsBackend>) -> Self {
        Self {
            backend,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// The underlying secrets backend
    pub fn backend(&self) -> &Arc<dyn SecretsBackend> {
        &self.backend
    }

    /// Mount a CA if needed and generate its root, returning the PEM root
    pub async fn initialize_ca(&self, ca: CaKind) -> Result<String> {
        let mount = ca.mount();
        if !self.backend.mount_exists(&mount).await? {
            self.backend.enable_pki(&mount, MOUNT_MAX_TTL).await?;
        }
        let pem = self
            .backend
            .generate_root(&mount, ca.common_name(), MOUNT_MAX_TTL)
            .await?;
        info!(ca = %ca, "initialized certificate authority");
        Ok(pem)
    }

    /// Read SSH private keys; entry `""` is the default key
    pub async fn ssh_keys(&self) -> Result<SshKeys> {
        let mut nodes = self
            .backend
            .read_kv(SSH_SECRET_PATH)
            .await?
            .ok_or_else(|| Error::secrets(SSH_SECRET_PATH, "no SSH keys stored"))?;
        let default = nodes.remove("");
        Ok(SshKeys { default, nodes })
    }

    async fn ensure_role(&self, ca: CaKind, role: RoleName) -> Result<()> {
        if self.ensured.lock().contains(&(ca, role)) {
            return Ok(());
        }
        let mount = ca.mount();
        if !self.backend.role_exists(&mount, role.as_str()).await? {
            self.backend
                .write_role(&mount, role.as_str(), &role_policy(ca, role))
                .await?;
        }
        self.ensured.lock().insert((ca, role));
        Ok(())
    }

    async fn issue(&self, ca: CaKind, role: RoleName, request: IssueRequest) -> Result<IssuedCertificate> {
        self.ensure_role(ca, role).await?;
        self.backend
            .issue(&ca.mount(), role.as_str(), &request)
            .await
    }

    /// etcd serving certificate for a control plane node
    pub async fn issue_etcd_server(&self, node: &Node) -> Result<IssuedCertificate> {
        self.issue(
            CaKind::Server,
            RoleName::System,
            IssueRequest {
                common_name: node.nodename().to_string(),
                alt_names: vec!["localhost".to_string()],
                ip_sans: vec!["127.0.0.1".to_string(), node.address.clone()],
                ..Default::default()
            },
        )
        .await
    }

    /// etcd peer certificate for a control plane node
    pub async fn issue_etcd_peer(&self, node: &Node) -> Result<IssuedCertificate> {
        self.issue(
            CaKind::EtcdPeer,
            RoleName::System,
            IssueRequest {
                common_name: node.nodename().to_string(),
                alt_names: vec!["localhost".to_string()],
                ip_sans: vec!["127.0.0.1".to_string(), node.address.clone()],
                ..Default::default()
            },
        )
        .await
    }

    /// Long-lived etcd client certificate for a system user
    pub async fn issue_etcd_client(&self, user: &str) -> Result<IssuedCertificate> {
        let mut request = IssueRequest::new(user);
        request.exclude_cn_from_sans = true;
        self.issue(CaKind::EtcdClient, RoleName::System, request).await
    }

    /// Short-lived etcd client certificate for the engine itself
    pub async fn issue_etcd_admin(&self, ttl: &str) -> Result<IssuedCertificate> {
        let mut request = IssueRequest::new("root");
        request.exclude_cn_from_sans = true;
        request.ttl = Some(ttl.to_string());
        self.issue(CaKind::EtcdClient, RoleName::Admin, request).await
    }

    /// kube-apiserver serving certificate
    ///
    /// SANs cover the node, loopback, the first Service IP and every
    /// in-cluster DNS alias of the `kubernetes` Service.
    pub async fn issue_kube_apiserver(
        &self,
        node: &Node,
        service_subnet: &str,
        domain: &str,
    ) -> Result<IssuedCertificate> {
        let service_ip = first_address(service_subnet).map_err(Error::validation)?;
        self.issue(
            CaKind::Server,
            RoleName::System,
            IssueRequest {
                common_name: "kubernetes".to_string(),
                alt_names: apiserver_dns_names(domain),
                ip_sans: vec![
                    "127.0.0.1".to_string(),
                    node.address.clone(),
                    service_ip.to_string(),
                ],
                ..Default::default()
            },
        )
        .await
    }

    /// kubelet certificate, usable both as API client and as server
    pub async fn issue_kubelet(&self, node: &Node) -> Result<IssuedCertificate> {
        self.issue(
            CaKind::Kubernetes,
            RoleName::Kubelet,
            IssueRequest {
                common_name: format!("system:node:{}", node.nodename()),
                alt_names: vec![node.nodename().to_string()],
                ip_sans: vec![node.address.clone()],
                ..Default::default()
            },
        )
        .await
    }

    /// Client certificate for a control plane component (`system:<name>`)
    pub async fn issue_kube_component(&self, name: &str) -> Result<IssuedCertificate> {
        let mut request = IssueRequest::new(format!("system:{name}"));
        request.exclude_cn_from_sans = true;
        self.issue(CaKind::Kubernetes, RoleName::System, request).await
    }

    /// Short-lived cluster-admin client certificate
    pub async fn issue_admin(&self, ttl: &str) -> Result<IssuedCertificate> {
        let mut request = IssueRequest::new("admin");
        request.exclude_cn_from_sans = true;
        request.ttl = Some(ttl.to_string());
        self.issue(CaKind::Kubernetes, RoleName::Admin, request).await
    }

    /// Client certificate of the aggregation front proxy
    pub async fn issue_aggregation_proxy(&self) -> Result<IssuedCertificate> {
        let mut request = IssueRequest::new("front-proxy-client");
        request.exclude_cn_from_sans = true;
        self.issue(CaKind::KubernetesAggregation, RoleName::System, request)
            .await
    }
}

/// DNS names of the `kubernetes` Service within `domain`
pub fn apiserver_dns_names(domain: &str) -> Vec<String> {
    vec![
        "localhost".to_string(),
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{domain}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MockSecretsBackend;
    use mockall::predicate::*;

    fn node() -> Node {
        Node {
            address: "10.0.0.1".to_string(),
            hostname: "cp1".to_string(),
            user: "kestrel".to_string(),
            control_plane: true,
            ..Default::default()
        }
    }

    fn issued() -> IssuedCertificate {
        IssuedCertificate {
            certificate: "CERT".to_string(),
            private_key: "KEY".to_string(),
            issuing_ca: "CA".to_string(),
        }
    }

    #[tokio::test]
    async fn role_is_created_once_then_cached() {
        let mut backend = MockSecretsBackend::new();
        backend
            .expect_role_exists()
            .with(eq("kestrel/ca-kubernetes"), eq("system"))
            .times(1)
            .returning(|_, _| Ok(false));
        backend
            .expect_write_role()
            .withf(|mount, role, policy| {
                mount == "kestrel/ca-kubernetes" && role == "system" && policy.client_flag
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        backend
            .expect_issue()
            .times(2)
            .returning(|_, _, _| Ok(issued()));

        let pki = Pki::new(Arc::new(backend));
        pki.issue_kube_component("kube-scheduler").await.unwrap();
        pki.issue_kube_component("kube-controller-manager").await.unwrap();
    }

    #[tokio::test]
    async fn existing_role_is_not_rewritten() {
        let mut backend = MockSecretsBackend::new();
        backend.expect_role_exists().returning(|_, _| Ok(true));
        backend.expect_write_role().never();
        backend.expect_issue().returning(|_, _, _| Ok(issued()));

        let pki = Pki::new(Arc::new(backend));
        pki.issue_etcd_client("kube-apiserver").await.unwrap();
    }

    #[tokio::test]
    async fn apiserver_certificate_covers_service_aliases() {
        let mut backend = MockSecretsBackend::new();
        backend.expect_role_exists().returning(|_, _| Ok(true));
        backend
            .expect_issue()
            .withf(|mount, role, req| {
                mount == "kestrel/ca-server"
                    && role == "system"
                    && req.alt_names.contains(&"kubernetes.default.svc.example.local".to_string())
                    && req.ip_sans == vec!["127.0.0.1", "10.0.0.1", "10.68.0.1"]
            })
            .times(1)
            .returning(|_, _, _| Ok(issued()));

        let pki = Pki::new(Arc::new(backend));
        pki.issue_kube_apiserver(&node(), "10.68.0.0/16", "example.local")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn kubelet_subject_identifies_the_node() {
        let mut backend = MockSecretsBackend::new();
        backend.expect_role_exists().returning(|_, _| Ok(true));
        backend
            .expect_issue()
            .withf(|_, role, req| role == "kubelet" && req.common_name == "system:node:cp1")
            .times(1)
            .returning(|_, _, _| Ok(issued()));

        let pki = Pki::new(Arc::new(backend));
        pki.issue_kubelet(&node()).await.unwrap();
    }

    #[tokio::test]
    async fn backend_failure_fails_issuance() {
        let mut backend = MockSecretsBackend::new();
        backend
            .expect_role_exists()
            .returning(|_, _| Err(Error::secrets("kestrel/ca-kubernetes/roles/admin", "HTTP 503")));

        let pki = Pki::new(Arc::new(backend));
        let err = pki.issue_admin(ADMIN_TTL).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn initialize_mounts_only_when_missing() {
        let mut backend = MockSecretsBackend::new();
        backend
            .expect_mount_exists()
            .with(eq("kestrel/ca-etcd-peer"))
            .returning(|_| Ok(false));
        backend
            .expect_enable_pki()
            .with(eq("kestrel/ca-etcd-peer"), eq(MOUNT_MAX_TTL))
            .times(1)
            .returning(|_, _| Ok(()));
        backend
            .expect_generate_root()
            .returning(|_, _, _| Ok("ROOT".to_string()));

        let pki = Pki::new(Arc::new(backend));
        assert_eq!(pki.initialize_ca(CaKind::EtcdPeer).await.unwrap(), "ROOT");
    }

    #[tokio::test]
    async fn ssh_keys_fall_back_to_default() {
        let mut backend = MockSecretsBackend::new();
        backend
            .expect_read_kv()
            .with(eq(SSH_SECRET_PATH))
            .returning(|_| {
                let mut keys = BTreeMap::new();
                keys.insert(String::new(), "DEFAULT".to_string());
                keys.insert("10.0.0.2".to_string(), "NODE2".to_string());
                Ok(Some(keys))
            });

        let pki = Pki::new(Arc::new(backend));
        let keys = pki.ssh_keys().await.unwrap();
        assert_eq!(keys.for_node("10.0.0.2"), Some("NODE2"));
        assert_eq!(keys.for_node("10.0.0.3"), Some("DEFAULT"));
        assert!(!format!("{keys:?}").contains("DEFAULT"));
    }

    #[test]
    fn admin_role_is_short_lived_cluster_admin() {
        let policy = role_policy(CaKind::Kubernetes, RoleName::Admin);
        assert_eq!(policy.ttl, ADMIN_TTL);
        assert_eq!(policy.organization, vec!["system:masters"]);
        assert!(!policy.server_flag);

        let kubelet = role_policy(CaKind::Kubernetes, RoleName::Kubelet);
        assert!(kubelet.server_flag && kubelet.client_flag);
        assert_eq!(kubelet.organization, vec!["system:nodes"]);

        assert!(!role_policy(CaKind::EtcdClient, RoleName::System).server_flag);
    }

    #[test]
    fn mounts_are_namespaced() {
        let mounts: HashSet<String> = CaKind::ALL.iter().map(|c| c.mount()).collect();
        assert_eq!(mounts.len(), 5);
        assert!(mounts.contains("kestrel/ca-kubernetes-aggregation"));
    }
}

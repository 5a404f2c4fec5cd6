//! Kubeconfig rendering
//!
//! The engine renders two flavours: one with inline credentials used by its
//! own API client, and one referencing certificate files used by components
//! running on the nodes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use kestrel_common::{Error, Result};

/// Kubeconfig structure
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterEntry,
}

/// Cluster configuration
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// Path of the CA bundle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    /// CA bundle (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// User entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserEntry,
}

/// Client certificate credentials
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    /// Path of the client certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    /// Path of the client key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// Client certificate (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    /// Client key (base64 encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}

/// Context entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextEntry,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

impl Kubeconfig {
    fn single(cluster_name: &str, user_name: &str, cluster: ClusterEntry, user: UserEntry) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster,
            }],
            users: vec![NamedUser {
                name: user_name.to_string(),
                user,
            }],
            contexts: vec![NamedContext {
                name: cluster_name.to_string(),
                context: ContextEntry {
                    cluster: cluster_name.to_string(),
                    user: user_name.to_string(),
                },
            }],
            current_context: cluster_name.to_string(),
        }
    }

    /// Kubeconfig carrying PEM material inline
    pub fn embedded(
        cluster_name: &str,
        server: &str,
        ca_pem: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Self {
        Self::single(
            cluster_name,
            "admin",
            ClusterEntry {
                server: server.to_string(),
                certificate_authority_data: Some(STANDARD.encode(ca_pem)),
                ..Default::default()
            },
            UserEntry {
                client_certificate_data: Some(STANDARD.encode(cert_pem)),
                client_key_data: Some(STANDARD.encode(key_pem)),
                ..Default::default()
            },
        )
    }

    /// Kubeconfig referencing files on a node
    pub fn with_files(
        cluster_name: &str,
        user_name: &str,
        server: &str,
        ca_path: &str,
        cert_path: &str,
        key_path: &str,
    ) -> Self {
        Self::single(
            cluster_name,
            user_name,
            ClusterEntry {
                server: server.to_string(),
                certificate_authority: Some(ca_path.to_string()),
                ..Default::default()
            },
            UserEntry {
                client_certificate: Some(cert_path.to_string()),
                client_key: Some(key_path.to_string()),
                ..Default::default()
            },
        )
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization(format!("failed to render kubeconfig: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_config_parses_as_kube_kubeconfig() {
        let yaml = Kubeconfig::embedded("prod", "https://10.0.0.1:6443", "CA", "CERT", "KEY")
            .to_yaml()
            .unwrap();
        let parsed: kube::config::Kubeconfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.current_context.as_deref(), Some("prod"));
        let cluster = parsed.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some(STANDARD.encode("CA").as_str())
        );
    }

    #[test]
    fn file_config_references_paths() {
        let yaml = Kubeconfig::with_files(
            "prod",
            "system:kube-scheduler",
            "https://127.0.0.1:16443",
            "/etc/kestrel/kubernetes/ca-server.crt",
            "/etc/kestrel/kubernetes/kube-scheduler.crt",
            "/etc/kestrel/kubernetes/kube-scheduler.key",
        )
        .to_yaml()
        .unwrap();
        assert!(yaml.contains("client-certificate: /etc/kestrel/kubernetes/kube-scheduler.crt"));
        assert!(yaml.contains("certificate-authority: /etc/kestrel/kubernetes/ca-server.crt"));
        assert!(!yaml.contains("-data"));
    }
}

//! Locations of certificates, keys and kubeconfigs on nodes

use kestrel_common::NODE_CONFIG_DIR;

/// Directory holding etcd TLS material
pub fn etcd_dir() -> String {
    format!("{NODE_CONFIG_DIR}/etcd")
}

/// Directory holding Kubernetes TLS material and kubeconfigs
pub fn kubernetes_dir() -> String {
    format!("{NODE_CONFIG_DIR}/kubernetes")
}

/// File in the etcd directory
pub fn etcd(file: &str) -> String {
    format!("{}/{file}", etcd_dir())
}

/// File in the Kubernetes directory
pub fn kubernetes(file: &str) -> String {
    format!("{}/{file}", kubernetes_dir())
}

/// Certificate, key and kubeconfig of one Kubernetes client component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentFiles {
    /// PEM certificate
    pub cert: String,
    /// PEM private key
    pub key: String,
    /// kubeconfig referencing the two files above
    pub kubeconfig: String,
}

impl ComponentFiles {
    /// Files for `name` (`kubelet`, `kube-proxy`, ...)
    pub fn new(name: &str) -> Self {
        Self {
            cert: kubernetes(&format!("{name}.crt")),
            key: kubernetes(&format!("{name}.key")),
            kubeconfig: kubernetes(&format!("{name}.kubeconfig")),
        }
    }
}

/// etcd serving certificate
pub const ETCD_SERVER_CERT: &str = "server.crt";
/// etcd serving key
pub const ETCD_SERVER_KEY: &str = "server.key";
/// etcd peer certificate
pub const ETCD_PEER_CERT: &str = "peer.crt";
/// etcd peer key
pub const ETCD_PEER_KEY: &str = "peer.key";
/// CA verifying etcd clients
pub const ETCD_CLIENT_CA: &str = "ca-etcd-client.crt";
/// CA verifying etcd peers
pub const ETCD_PEER_CA: &str = "ca-etcd-peer.crt";

/// CA of serving certificates
pub const SERVER_CA: &str = "ca-server.crt";
/// CA of Kubernetes client certificates
pub const KUBERNETES_CA: &str = "ca-kubernetes.crt";
/// CA of the aggregation front proxy
pub const AGGREGATION_CA: &str = "ca-kubernetes-aggregation.crt";
/// kube-apiserver serving certificate
pub const APISERVER_CERT: &str = "apiserver.crt";
/// kube-apiserver serving key
pub const APISERVER_KEY: &str = "apiserver.key";
/// kube-apiserver etcd client certificate
pub const APISERVER_ETCD_CERT: &str = "apiserver-etcd.crt";
/// kube-apiserver etcd client key
pub const APISERVER_ETCD_KEY: &str = "apiserver-etcd.key";
/// kube-apiserver kubelet client certificate
pub const APISERVER_KUBELET_CERT: &str = "apiserver-kubelet.crt";
/// kube-apiserver kubelet client key
pub const APISERVER_KUBELET_KEY: &str = "apiserver-kubelet.key";
/// Front proxy client certificate
pub const FRONT_PROXY_CERT: &str = "front-proxy.crt";
/// Front proxy client key
pub const FRONT_PROXY_KEY: &str = "front-proxy.key";
/// Service account token verification certificate
pub const SERVICE_ACCOUNT_CERT: &str = "service-account.crt";
/// Service account token signing key
pub const SERVICE_ACCOUNT_KEY: &str = "service-account.key";

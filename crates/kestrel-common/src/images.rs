//! Container images and system service names

/// etcd server image
pub const ETCD: &str = "registry.k8s.io/etcd:3.5.12-0";

/// Hyperkube-style image carrying every Kubernetes component binary
pub const KUBERNETES: &str = "ghcr.io/kestrel-io/kubernetes:1.30.2";

/// Utility image used for ephemeral helper containers (rivers, etcdctl, openssl)
pub const TOOLS: &str = "ghcr.io/kestrel-io/tools:1.0.0";

/// Names of the long-lived containers run on each node
pub mod service {
    /// Local TCP proxy to the API servers, on every node
    pub const RIVERS: &str = "rivers";
    /// etcd member, on control plane nodes
    pub const ETCD: &str = "etcd";
    /// API server, on control plane nodes
    pub const KUBE_APISERVER: &str = "kube-apiserver";
    /// Controller manager, on control plane nodes
    pub const KUBE_CONTROLLER_MANAGER: &str = "kube-controller-manager";
    /// Scheduler, on control plane nodes
    pub const KUBE_SCHEDULER: &str = "kube-scheduler";
    /// kubelet, on every node
    pub const KUBELET: &str = "kubelet";
    /// kube-proxy, on every node
    pub const KUBE_PROXY: &str = "kube-proxy";

    /// Control plane services in start order
    pub const CONTROL_PLANE: [&str; 3] = [KUBE_APISERVER, KUBE_CONTROLLER_MANAGER, KUBE_SCHEDULER];

    /// Services run on every node in start order
    pub const NODE: [&str; 2] = [KUBELET, KUBE_PROXY];

    /// Every service name, probed on each tick
    pub const ALL: [&str; 7] = [
        RIVERS,
        ETCD,
        KUBE_APISERVER,
        KUBE_CONTROLLER_MANAGER,
        KUBE_SCHEDULER,
        KUBELET,
        KUBE_PROXY,
    ];
}

/// Image run for a given service
pub fn image_for(service_name: &str) -> &'static str {
    match service_name {
        service::ETCD => ETCD,
        service::RIVERS => TOOLS,
        _ => KUBERNETES,
    }
}

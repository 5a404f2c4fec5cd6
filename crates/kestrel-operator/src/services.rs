//! Built-in container definitions for every system service
//!
//! The built-in parameters are derived from the cluster definition alone so
//! that the same cluster always yields the same parameters. Extra
//! parameters come straight from the cluster options. A running container
//! whose recorded parameters differ from these is restarted.

use kestrel_common::cluster::first_address;
use kestrel_common::config::EngineConfig;
use kestrel_common::images::{image_for, service};
use kestrel_common::{Cluster, Error, Mount, Node, Result, ServiceParams, ServiceStatus};
use kestrel_infra::{SystemContainer, ETCD_CLIENT_PORT, ETCD_PEER_PORT};

use crate::paths::{self, ComponentFiles};

/// Mount point of the etcd data volume inside the container
const ETCD_DATA_DIR: &str = "/var/lib/etcd";

/// Arguments only passed when a member is first started
const INITIAL_CLUSTER_FLAG: &str = "--initial-cluster";

/// State an etcd member joins with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitialState {
    /// Part of a brand-new cluster
    New,
    /// Joining a running cluster
    Existing,
}

impl InitialState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Existing => "existing",
        }
    }
}

/// Membership an etcd member is started with the first time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitialCluster {
    /// Addresses of every member, including the starting one
    pub members: Vec<String>,
    /// new or existing
    pub state: InitialState,
}

fn peer_url(address: &str) -> String {
    format!("https://{address}:{ETCD_PEER_PORT}")
}

fn client_url(address: &str) -> String {
    format!("https://{address}:{ETCD_CLIENT_PORT}")
}

fn container(name: &str, built_in: ServiceParams, extra: &ServiceParams) -> SystemContainer {
    SystemContainer {
        name: name.to_string(),
        image: image_for(name).to_string(),
        built_in,
        extra: extra.clone(),
        privileged: false,
    }
}

/// Local proxy forwarding to every API server
pub fn rivers(cluster: &Cluster, config: &EngineConfig) -> SystemContainer {
    let upstreams: Vec<String> = cluster
        .control_plane_nodes()
        .map(|n| format!("{}:{}", n.address, config.apiserver_port))
        .collect();
    container(
        service::RIVERS,
        ServiceParams::args([
            "rivers".to_string(),
            format!("--listen=127.0.0.1:{}", config.rivers_port),
            format!("--upstreams={}", upstreams.join(",")),
        ]),
        &cluster.options.rivers,
    )
}

/// etcd member on a control plane node
pub fn etcd(cluster: &Cluster, node: &Node, initial: Option<&InitialCluster>) -> SystemContainer {
    let mut args = vec![
        "etcd".to_string(),
        format!("--name={}", node.address),
        format!("--data-dir={ETCD_DATA_DIR}"),
        format!("--listen-client-urls={},https://127.0.0.1:{ETCD_CLIENT_PORT}", client_url(&node.address)),
        format!("--advertise-client-urls={}", client_url(&node.address)),
        format!("--listen-peer-urls={}", peer_url(&node.address)),
        format!("--initial-advertise-peer-urls={}", peer_url(&node.address)),
        format!("--cert-file={}", paths::etcd(paths::ETCD_SERVER_CERT)),
        format!("--key-file={}", paths::etcd(paths::ETCD_SERVER_KEY)),
        "--client-cert-auth=true".to_string(),
        format!("--trusted-ca-file={}", paths::etcd(paths::ETCD_CLIENT_CA)),
        format!("--peer-cert-file={}", paths::etcd(paths::ETCD_PEER_CERT)),
        format!("--peer-key-file={}", paths::etcd(paths::ETCD_PEER_KEY)),
        "--peer-client-cert-auth=true".to_string(),
        format!("--peer-trusted-ca-file={}", paths::etcd(paths::ETCD_PEER_CA)),
    ];
    if let Some(initial) = initial {
        let members: Vec<String> = initial
            .members
            .iter()
            .map(|a| format!("{a}={}", peer_url(a)))
            .collect();
        args.push(format!("{INITIAL_CLUSTER_FLAG}={}", members.join(",")));
        args.push(format!("{INITIAL_CLUSTER_FLAG}-state={}", initial.state.as_str()));
    }

    let data = Mount {
        source: cluster.options.etcd.volume_name.clone(),
        destination: ETCD_DATA_DIR.to_string(),
        read_only: false,
    };
    container(
        service::ETCD,
        ServiceParams::args(args).with_binds([Mount::ro(&paths::etcd_dir()), data]),
        &cluster.options.etcd.params,
    )
}

/// kube-apiserver on a control plane node
pub fn kube_apiserver(cluster: &Cluster, node: &Node, config: &EngineConfig) -> SystemContainer {
    let etcd_servers: Vec<String> = cluster
        .control_plane_nodes()
        .map(|n| client_url(&n.address))
        .collect();
    let k = paths::kubernetes;
    container(
        service::KUBE_APISERVER,
        ServiceParams::args([
            "kube-apiserver".to_string(),
            format!("--advertise-address={}", node.address),
            format!("--secure-port={}", config.apiserver_port),
            "--allow-privileged=true".to_string(),
            "--authorization-mode=Node,RBAC".to_string(),
            "--enable-admission-plugins=NodeRestriction".to_string(),
            format!("--service-cluster-ip-range={}", cluster.service_subnet),
            format!("--etcd-servers={}", etcd_servers.join(",")),
            format!("--etcd-cafile={}", k(paths::SERVER_CA)),
            format!("--etcd-certfile={}", k(paths::APISERVER_ETCD_CERT)),
            format!("--etcd-keyfile={}", k(paths::APISERVER_ETCD_KEY)),
            format!("--tls-cert-file={}", k(paths::APISERVER_CERT)),
            format!("--tls-private-key-file={}", k(paths::APISERVER_KEY)),
            format!("--client-ca-file={}", k(paths::KUBERNETES_CA)),
            format!("--kubelet-certificate-authority={}", k(paths::KUBERNETES_CA)),
            format!("--kubelet-client-certificate={}", k(paths::APISERVER_KUBELET_CERT)),
            format!("--kubelet-client-key={}", k(paths::APISERVER_KUBELET_KEY)),
            format!("--requestheader-client-ca-file={}", k(paths::AGGREGATION_CA)),
            "--requestheader-allowed-names=front-proxy-client".to_string(),
            "--requestheader-username-headers=X-Remote-User".to_string(),
            "--requestheader-group-headers=X-Remote-Group".to_string(),
            "--requestheader-extra-headers-prefix=X-Remote-Extra-".to_string(),
            format!("--proxy-client-cert-file={}", k(paths::FRONT_PROXY_CERT)),
            format!("--proxy-client-key-file={}", k(paths::FRONT_PROXY_KEY)),
            format!("--service-account-key-file={}", k(paths::SERVICE_ACCOUNT_CERT)),
            format!("--service-account-signing-key-file={}", k(paths::SERVICE_ACCOUNT_KEY)),
            format!(
                "--service-account-issuer=https://kubernetes.default.svc.{}",
                cluster.domain()
            ),
        ])
        .with_binds([Mount::ro(&paths::kubernetes_dir())]),
        &cluster.options.kube_api,
    )
}

/// kube-controller-manager on a control plane node
pub fn kube_controller_manager(cluster: &Cluster) -> SystemContainer {
    let files = ComponentFiles::new(service::KUBE_CONTROLLER_MANAGER);
    let k = paths::kubernetes;
    let mut args = vec![
        "kube-controller-manager".to_string(),
        format!("--kubeconfig={}", files.kubeconfig),
        format!("--authentication-kubeconfig={}", files.kubeconfig),
        format!("--authorization-kubeconfig={}", files.kubeconfig),
        "--leader-elect=true".to_string(),
        "--use-service-account-credentials=true".to_string(),
        format!("--root-ca-file={}", k(paths::SERVER_CA)),
        format!("--service-account-private-key-file={}", k(paths::SERVICE_ACCOUNT_KEY)),
        format!("--service-cluster-ip-range={}", cluster.service_subnet),
    ];
    if !cluster.pod_subnet.is_empty() {
        args.push("--allocate-node-cidrs=true".to_string());
        args.push(format!("--cluster-cidr={}", cluster.pod_subnet));
    }
    container(
        service::KUBE_CONTROLLER_MANAGER,
        ServiceParams::args(args).with_binds([Mount::ro(&paths::kubernetes_dir())]),
        &cluster.options.kube_controller_manager,
    )
}

/// kube-scheduler on a control plane node
pub fn kube_scheduler(cluster: &Cluster) -> SystemContainer {
    let files = ComponentFiles::new(service::KUBE_SCHEDULER);
    container(
        service::KUBE_SCHEDULER,
        ServiceParams::args([
            "kube-scheduler".to_string(),
            format!("--kubeconfig={}", files.kubeconfig),
            format!("--authentication-kubeconfig={}", files.kubeconfig),
            format!("--authorization-kubeconfig={}", files.kubeconfig),
            "--leader-elect=true".to_string(),
        ])
        .with_binds([Mount::ro(&paths::kubernetes_dir())]),
        &cluster.options.kube_scheduler,
    )
}

/// Cluster DNS address: the tenth address of the service network
pub fn cluster_dns(cluster: &Cluster) -> Result<String> {
    let first = first_address(&cluster.service_subnet).map_err(Error::validation)?;
    let dns = u32::from(first) + 9;
    Ok(std::net::Ipv4Addr::from(dns).to_string())
}

/// kubelet on any node
pub fn kubelet(cluster: &Cluster, node: &Node) -> Result<SystemContainer> {
    let files = ComponentFiles::new(service::KUBELET);
    let mut spec = container(
        service::KUBELET,
        ServiceParams::args([
            "kubelet".to_string(),
            format!("--hostname-override={}", node.nodename()),
            format!("--node-ip={}", node.address),
            format!("--kubeconfig={}", files.kubeconfig),
            format!("--client-ca-file={}", paths::kubernetes(paths::KUBERNETES_CA)),
            format!("--tls-cert-file={}", files.cert),
            format!("--tls-private-key-file={}", files.key),
            format!("--cluster-dns={}", cluster_dns(cluster)?),
            format!("--cluster-domain={}", cluster.domain()),
            "--authentication-token-webhook=true".to_string(),
            "--authorization-mode=Webhook".to_string(),
            "--cgroup-driver=systemd".to_string(),
            "--container-runtime-endpoint=unix:///run/containerd/containerd.sock".to_string(),
        ])
        .with_binds([
            Mount::ro(&paths::kubernetes_dir()),
            Mount::rw("/var/lib/kubelet"),
            Mount::rw("/var/log"),
            Mount::rw("/run"),
            Mount::ro("/sys"),
            Mount::rw("/dev"),
        ]),
        &cluster.options.kubelet.params,
    );
    spec.privileged = true;
    Ok(spec)
}

/// kube-proxy on any node
pub fn kube_proxy(cluster: &Cluster, node: &Node) -> SystemContainer {
    let files = ComponentFiles::new(service::KUBE_PROXY);
    let mut args = vec![
        "kube-proxy".to_string(),
        format!("--hostname-override={}", node.nodename()),
        format!("--kubeconfig={}", files.kubeconfig),
        "--proxy-mode=iptables".to_string(),
    ];
    if !cluster.pod_subnet.is_empty() {
        args.push(format!("--cluster-cidr={}", cluster.pod_subnet));
    }
    let mut spec = container(
        service::KUBE_PROXY,
        ServiceParams::args(args).with_binds([
            Mount::ro(&paths::kubernetes_dir()),
            Mount::ro("/lib/modules"),
            Mount::rw("/run/xtables.lock"),
        ]),
        &cluster.options.kube_proxy,
    );
    spec.privileged = true;
    spec
}

/// Spec of a named service as it should currently run on `node`
///
/// etcd is described without its initial membership, which only matters
/// when a member is first started.
pub fn desired(
    name: &str,
    cluster: &Cluster,
    node: &Node,
    config: &EngineConfig,
) -> Result<SystemContainer> {
    match name {
        service::RIVERS => Ok(rivers(cluster, config)),
        service::ETCD => Ok(etcd(cluster, node, None)),
        service::KUBE_APISERVER => Ok(kube_apiserver(cluster, node, config)),
        service::KUBE_CONTROLLER_MANAGER => Ok(kube_controller_manager(cluster)),
        service::KUBE_SCHEDULER => Ok(kube_scheduler(cluster)),
        service::KUBELET => kubelet(cluster, node),
        service::KUBE_PROXY => Ok(kube_proxy(cluster, node)),
        other => Err(Error::internal(format!("unknown service {other}"))),
    }
}

fn without_initial_cluster(params: &ServiceParams) -> ServiceParams {
    let mut params = params.clone();
    params
        .extra_args
        .retain(|a| !a.starts_with(INITIAL_CLUSTER_FLAG));
    params
}

/// True when `status` shows the service running exactly as `spec` describes
pub fn is_current(status: Option<&ServiceStatus>, spec: &SystemContainer) -> bool {
    let Some(status) = status else {
        return false;
    };
    if spec.name == service::ETCD {
        let running = ServiceStatus {
            built_in_params: without_initial_cluster(&status.built_in_params),
            ..status.clone()
        };
        return running.matches(&spec.image, &without_initial_cluster(&spec.built_in), &spec.extra);
    }
    status.matches(&spec.image, &spec.built_in, &spec.extra)
}

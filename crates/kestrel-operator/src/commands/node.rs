//! Commanders acting on one node through its agent

use async_trait::async_trait;
use tracing::info;

use kestrel_common::images::service;
use kestrel_common::{Command, Node, Result};
use kestrel_infra::{install_file, Agent, Infrastructure, Kubeconfig, SystemContainer};
use kestrel_pki::{CaKind, IssuedCertificate};

use crate::operator::Commander;
use crate::paths::{self, ComponentFiles};

const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;

/// Pull an image unless present
#[derive(Debug)]
pub struct PullImage {
    /// Node address
    pub node: String,
    /// Image reference
    pub image: String,
}

#[async_trait]
impl Commander for PullImage {
    fn command(&self) -> Command {
        Command::new("image-pull", &self.node).with_detail(&self.image)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        infra.engine(&self.node)?.pull_image(&self.image).await
    }
}

/// (Re)create a system container
#[derive(Debug)]
pub struct RunContainer {
    /// Node address
    pub node: String,
    /// Container to run
    pub spec: SystemContainer,
}

#[async_trait]
impl Commander for RunContainer {
    fn command(&self) -> Command {
        Command::new("container-run", &self.node).with_detail(&self.spec.name)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        infra.engine(&self.node)?.run_system(&self.spec).await
    }
}

/// Remove a system container
#[derive(Debug)]
pub struct StopContainer {
    /// Node address
    pub node: String,
    /// Container name
    pub name: String,
}

#[async_trait]
impl Commander for StopContainer {
    fn command(&self) -> Command {
        Command::new("container-stop", &self.node).with_detail(&self.name)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        infra.engine(&self.node)?.stop(&self.name).await
    }
}

/// Create a named volume
#[derive(Debug)]
pub struct CreateVolume {
    /// Node address
    pub node: String,
    /// Volume name
    pub name: String,
}

#[async_trait]
impl Commander for CreateVolume {
    fn command(&self) -> Command {
        Command::new("volume-create", &self.node).with_detail(&self.name)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        infra.engine(&self.node)?.volume_create(&self.name).await
    }
}

/// Remove a named volume
#[derive(Debug)]
pub struct RemoveVolume {
    /// Node address
    pub node: String,
    /// Volume name
    pub name: String,
}

#[async_trait]
impl Commander for RemoveVolume {
    fn command(&self) -> Command {
        Command::new("volume-remove", &self.node).with_detail(&self.name)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        infra.engine(&self.node)?.volume_remove(&self.name).await
    }
}

async fn install_pair(agent: &dyn Agent, cert_path: &str, key_path: &str, issued: &IssuedCertificate) -> Result<()> {
    install_file(agent, cert_path, issued.certificate.as_bytes(), CERT_MODE).await?;
    install_file(agent, key_path, issued.private_key.as_bytes(), KEY_MODE).await
}

async fn install_ca(infra: &Infrastructure, agent: &dyn Agent, ca: CaKind, path: &str) -> Result<()> {
    let pem = infra.storage().get_ca_certificate(ca.name()).await?;
    install_file(agent, path, pem.as_bytes(), CERT_MODE).await
}

/// Issue a client certificate for a component and write it with a kubeconfig
async fn install_component(
    infra: &Infrastructure,
    agent: &dyn Agent,
    name: &str,
    issued: &IssuedCertificate,
) -> Result<()> {
    let files = ComponentFiles::new(name);
    install_pair(agent, &files.cert, &files.key, issued).await?;
    let kubeconfig = Kubeconfig::with_files(
        &infra.cluster().name,
        name,
        &format!("https://127.0.0.1:{}", infra.config().rivers_port),
        &paths::kubernetes(paths::SERVER_CA),
        &files.cert,
        &files.key,
    )
    .to_yaml()?;
    install_file(agent, &files.kubeconfig, kubeconfig.as_bytes(), KEY_MODE).await
}

/// Write etcd certificates and CAs to a control plane node
#[derive(Debug)]
pub struct InstallEtcdFiles {
    /// Control plane node
    pub node: Node,
}

#[async_trait]
impl Commander for InstallEtcdFiles {
    fn command(&self) -> Command {
        Command::new("etcd-files", &self.node.address)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let agent = infra.agent(&self.node.address)?;
        let agent = agent.as_ref();
        let pki = infra.pki();

        install_ca(infra, agent, CaKind::EtcdClient, &paths::etcd(paths::ETCD_CLIENT_CA)).await?;
        install_ca(infra, agent, CaKind::EtcdPeer, &paths::etcd(paths::ETCD_PEER_CA)).await?;

        let server = pki.issue_etcd_server(&self.node).await?;
        install_pair(
            agent,
            &paths::etcd(paths::ETCD_SERVER_CERT),
            &paths::etcd(paths::ETCD_SERVER_KEY),
            &server,
        )
        .await?;
        let peer = pki.issue_etcd_peer(&self.node).await?;
        install_pair(
            agent,
            &paths::etcd(paths::ETCD_PEER_CERT),
            &paths::etcd(paths::ETCD_PEER_KEY),
            &peer,
        )
        .await?;

        info!(node = %self.node.address, "etcd certificates installed");
        Ok(())
    }
}

/// Write control plane certificates, keys and kubeconfigs
#[derive(Debug)]
pub struct InstallControlPlaneFiles {
    /// Control plane node
    pub node: Node,
}

#[async_trait]
impl Commander for InstallControlPlaneFiles {
    fn command(&self) -> Command {
        Command::new("control-plane-files", &self.node.address)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let agent = infra.agent(&self.node.address)?;
        let agent = agent.as_ref();
        let pki = infra.pki();
        let cluster = infra.cluster();
        let k = paths::kubernetes;

        install_ca(infra, agent, CaKind::Server, &k(paths::SERVER_CA)).await?;
        install_ca(infra, agent, CaKind::Kubernetes, &k(paths::KUBERNETES_CA)).await?;
        install_ca(infra, agent, CaKind::KubernetesAggregation, &k(paths::AGGREGATION_CA)).await?;

        let apiserver = pki
            .issue_kube_apiserver(&self.node, &cluster.service_subnet, cluster.domain())
            .await?;
        install_pair(agent, &k(paths::APISERVER_CERT), &k(paths::APISERVER_KEY), &apiserver).await?;

        let etcd = pki.issue_etcd_client(service::KUBE_APISERVER).await?;
        install_pair(agent, &k(paths::APISERVER_ETCD_CERT), &k(paths::APISERVER_ETCD_KEY), &etcd).await?;

        let kubelet_client = pki.issue_kube_component("kube-apiserver-kubelet-client").await?;
        install_pair(
            agent,
            &k(paths::APISERVER_KUBELET_CERT),
            &k(paths::APISERVER_KUBELET_KEY),
            &kubelet_client,
        )
        .await?;

        let proxy = pki.issue_aggregation_proxy().await?;
        install_pair(agent, &k(paths::FRONT_PROXY_CERT), &k(paths::FRONT_PROXY_KEY), &proxy).await?;

        let storage = infra.storage();
        let sa_cert = storage.get_service_account_cert().await?;
        let sa_key = storage.get_service_account_key().await?;
        install_file(agent, &k(paths::SERVICE_ACCOUNT_CERT), sa_cert.as_bytes(), CERT_MODE).await?;
        install_file(agent, &k(paths::SERVICE_ACCOUNT_KEY), sa_key.as_bytes(), KEY_MODE).await?;

        for name in [service::KUBE_CONTROLLER_MANAGER, service::KUBE_SCHEDULER] {
            let issued = pki.issue_kube_component(name).await?;
            install_component(infra, agent, name, &issued).await?;
        }

        info!(node = %self.node.address, "control plane files installed");
        Ok(())
    }
}

/// Write kubelet and kube-proxy certificates and kubeconfigs
#[derive(Debug)]
pub struct InstallNodeFiles {
    /// Any node
    pub node: Node,
}

#[async_trait]
impl Commander for InstallNodeFiles {
    fn command(&self) -> Command {
        Command::new("node-files", &self.node.address)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let agent = infra.agent(&self.node.address)?;
        let agent = agent.as_ref();
        let pki = infra.pki();

        install_ca(infra, agent, CaKind::Server, &paths::kubernetes(paths::SERVER_CA)).await?;
        install_ca(infra, agent, CaKind::Kubernetes, &paths::kubernetes(paths::KUBERNETES_CA)).await?;

        let kubelet = pki.issue_kubelet(&self.node).await?;
        install_component(infra, agent, service::KUBELET, &kubelet).await?;
        let proxy = pki.issue_kube_component(service::KUBE_PROXY).await?;
        install_component(infra, agent, service::KUBE_PROXY, &proxy).await?;

        info!(node = %self.node.address, "node files installed");
        Ok(())
    }
}

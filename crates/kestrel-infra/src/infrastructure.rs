//! Per-tick aggregate of everything a command needs
//!
//! Built at the start of each tick: one connected [`Agent`] per node, the
//! certificate authorities, storage and the leader key that guards writes.
//! Construction is all-or-nothing. If any node cannot be reached the agents
//! already connected are closed and the tick fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use kube::config::{KubeConfigOptions, Kubeconfig as KubeKubeconfig};
use kube::{Client, Config};
use tracing::{debug, info, warn};

use kestrel_common::config::EngineConfig;
use kestrel_common::{Cluster, Error, Result};
use kestrel_pki::ca::ADMIN_TTL;
use kestrel_pki::{CaKind, IssuedCertificate, Pki};
use kestrel_storage::{EtcdKv, EtcdTls, Storage};

use crate::agent::{Agent, SshAgent};
use crate::engine::ContainerEngine;
use crate::kubeconfig::Kubeconfig;
use crate::session::Session;

/// etcd client port on control plane nodes
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// etcd peer port on control plane nodes
pub const ETCD_PEER_PORT: u16 = 2380;

/// Connections and clients for one tick
pub struct Infrastructure {
    session: Arc<Session>,
    cluster: Cluster,
    storage: Storage,
    pki: Arc<Pki>,
    leader_key: String,
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl Infrastructure {
    /// Connect to every node of `cluster` concurrently
    pub async fn new(
        session: Arc<Session>,
        cluster: Cluster,
        storage: Storage,
        leader_key: impl Into<String>,
    ) -> Result<Self> {
        let pki = session.pki(&storage).await?;
        let keys = pki.ssh_keys().await?;
        let config = session.config();

        let attempts = cluster.nodes.iter().map(|node| {
            let key = keys.for_node(&node.address).map(str::to_string);
            async move {
                let key = key.ok_or_else(|| Error::transport(&node.address, "no SSH key for node"))?;
                let agent = SshAgent::connect(
                    node,
                    &key,
                    config.ssh_connect_timeout,
                    config.command_timeout,
                )
                .await?;
                Ok::<_, Error>((node.address.clone(), Arc::new(agent) as Arc<dyn Agent>))
            }
        });

        let mut agents = BTreeMap::new();
        let mut first_error = None;
        for result in join_all(attempts).await {
            match result {
                Ok((address, agent)) => {
                    agents.insert(address, agent);
                }
                Err(e) => {
                    warn!(error = %e, "failed to connect to node");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            close_agents(&agents).await;
            return Err(e);
        }

        info!(cluster = %cluster.name, nodes = agents.len(), "infrastructure ready");
        Ok(Self::from_parts(session, cluster, storage, pki, leader_key, agents))
    }

    /// Assemble from already connected parts
    pub fn from_parts(
        session: Arc<Session>,
        cluster: Cluster,
        storage: Storage,
        pki: Arc<Pki>,
        leader_key: impl Into<String>,
        agents: BTreeMap<String, Arc<dyn Agent>>,
    ) -> Self {
        Self {
            session,
            cluster,
            storage,
            pki,
            leader_key: leader_key.into(),
            agents,
        }
    }

    /// The desired cluster this tick works towards
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Engine storage
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Certificate authorities
    pub fn pki(&self) -> &Arc<Pki> {
        &self.pki
    }

    /// Key passed to every guarded storage write
    pub fn leader_key(&self) -> &str {
        &self.leader_key
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        self.session.config()
    }

    /// Agent for a node
    pub fn agent(&self, address: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(address)
            .cloned()
            .ok_or_else(|| Error::transport(address, "node is not part of this infrastructure"))
    }

    /// Container engine for a node
    pub fn engine(&self, address: &str) -> Result<ContainerEngine> {
        Ok(ContainerEngine::new(self.agent(address)?, address))
    }

    /// Cluster-admin Kubernetes client certificate, cached across ticks
    pub async fn admin_certificate(&self) -> Result<IssuedCertificate> {
        self.session
            .admin_kube_cert()
            .get_or_issue(|| self.pki.issue_admin(ADMIN_TTL))
            .await
    }

    fn api_server(&self) -> Result<String> {
        let node = self
            .cluster
            .control_plane_nodes()
            .next()
            .ok_or_else(|| Error::validation_for(&self.cluster.name, "no control plane node"))?;
        Ok(format!("https://{}:{}", node.address, self.config().apiserver_port))
    }

    /// Client for the managed Kubernetes API
    pub async fn kube_client(&self) -> Result<Client> {
        let server = self.api_server()?;
        let ca = self.storage.get_ca_certificate(CaKind::Server.name()).await?;
        let cert = self.admin_certificate().await?;

        let yaml = Kubeconfig::embedded(
            &self.cluster.name,
            &server,
            &ca,
            &cert.certificate,
            &cert.private_key,
        )
        .to_yaml()?;
        let kubeconfig: KubeKubeconfig = serde_yaml::from_str(&yaml)
            .map_err(|e| Error::serialization(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::internal_with_context("kube_client", e.to_string()))?;

        debug!(server = %server, "created kubernetes client");
        Ok(Client::try_from(config)?)
    }

    /// Client for the managed etcd cluster, authenticated as root
    pub async fn etcd_client(&self) -> Result<etcd_client::Client> {
        let endpoints: Vec<String> = self
            .cluster
            .control_plane_nodes()
            .map(|n| etcd_endpoint(&n.address))
            .collect();
        self.etcd_client_for(&endpoints).await
    }

    /// Client pinned to the etcd member on one node
    pub async fn etcd_member_client(&self, address: &str) -> Result<etcd_client::Client> {
        self.etcd_client_for(&[etcd_endpoint(address)]).await
    }

    async fn etcd_client_for(&self, endpoints: &[String]) -> Result<etcd_client::Client> {
        let ca = self.storage.get_ca_certificate(CaKind::Server.name()).await?;
        let cert = self
            .session
            .admin_etcd_cert()
            .get_or_issue(|| self.pki.issue_etcd_admin(ADMIN_TTL))
            .await?;

        let kv = EtcdKv::connect(
            endpoints,
            Some(EtcdTls {
                ca,
                cert: cert.certificate,
                key: cert.private_key,
            }),
        )
        .await?;
        Ok(kv.client())
    }

    /// Close every agent; failures are logged
    pub async fn close(&self) {
        close_agents(&self.agents).await;
    }
}

fn etcd_endpoint(address: &str) -> String {
    format!("https://{address}:{ETCD_CLIENT_PORT}")
}

async fn close_agents(agents: &BTreeMap<String, Arc<dyn Agent>>) {
    let closing = agents.iter().map(|(address, agent)| async move {
        if let Err(e) = agent.close().await {
            warn!(node = %address, error = %e, "failed to close agent");
        }
    });
    join_all(closing).await;
}

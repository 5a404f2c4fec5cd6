//! Shared fixture for command and tick tests

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::config::EngineConfig;
use kestrel_common::{Cluster, Node};
use kestrel_infra::testing::{RecordingAgent, StaticSecrets};
use kestrel_infra::{Agent, Infrastructure, Session};
use kestrel_pki::Pki;
use kestrel_storage::{LeaderElector, LeaderGuard, MemoryKv, Storage};

pub(crate) const PREFIX: &str = "/kestrel/";

pub(crate) fn node(address: &str, control_plane: bool) -> Node {
    Node {
        address: address.to_string(),
        hostname: format!("host-{}", address.rsplit('.').next().unwrap_or(address)),
        user: "core".to_string(),
        control_plane,
        ..Default::default()
    }
}

pub(crate) fn cluster() -> Cluster {
    Cluster {
        name: "test".to_string(),
        nodes: vec![
            node("10.0.0.1", true),
            node("10.0.0.2", true),
            node("10.0.0.3", true),
            node("10.0.0.4", false),
        ],
        service_subnet: "10.96.0.0/16".to_string(),
        pod_subnet: "10.244.0.0/16".to_string(),
        ..Default::default()
    }
}

/// Storage with an elected leader, fake secrets and one recording agent per node
pub(crate) struct Fixture {
    pub storage: Storage,
    pub secrets: Arc<StaticSecrets>,
    pub agents: BTreeMap<String, Arc<RecordingAgent>>,
    pub guard: LeaderGuard,
}

impl Fixture {
    pub async fn new(cluster: &Cluster) -> Self {
        Self::with_agents(cluster, |_| RecordingAgent::default()).await
    }

    pub async fn with_agents(cluster: &Cluster, agent: impl Fn(&str) -> RecordingAgent) -> Self {
        let kv = MemoryKv::new();
        let storage = Storage::new(Arc::new(kv.clone()), PREFIX);
        let elector = Arc::new(
            LeaderElector::new(Arc::new(kv.clone()), PREFIX, "test-host", 60)
                .with_intervals(Duration::from_secs(60), Duration::from_millis(10)),
        );
        let guard = elector.campaign().await.unwrap();
        let agents = cluster
            .nodes
            .iter()
            .map(|n| (n.address.clone(), Arc::new(agent(&n.address))))
            .collect();
        Self {
            storage,
            secrets: StaticSecrets::default().shared(),
            agents,
            guard,
        }
    }

    pub fn infra(&self, cluster: &Cluster) -> Infrastructure {
        let session = Arc::new(Session::with_secrets(
            EngineConfig::default(),
            self.secrets.clone(),
        ));
        let agents: BTreeMap<String, Arc<dyn Agent>> = self
            .agents
            .iter()
            .map(|(a, agent)| (a.clone(), agent.clone() as Arc<dyn Agent>))
            .collect();
        Infrastructure::from_parts(
            session,
            cluster.clone(),
            self.storage.clone(),
            Arc::new(Pki::new(self.secrets.clone())),
            self.guard.key().to_string(),
            agents,
        )
    }

    pub fn commands(&self, address: &str) -> Vec<String> {
        self.agents[address].commands()
    }
}

//! Commanders changing etcd membership

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use kestrel_common::{Command, Error, Result};
use kestrel_infra::{Infrastructure, ETCD_PEER_PORT};
use kestrel_storage::etcd::etcd_err;

use crate::operator::Commander;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Announce a new member to the running cluster
///
/// The member must be started with `--initial-cluster-state=existing`
/// afterwards. Adding an address that is already a member is a no-op.
#[derive(Debug)]
pub struct AddEtcdMember {
    /// Address of the new member
    pub node: String,
}

#[async_trait]
impl Commander for AddEtcdMember {
    fn command(&self) -> Command {
        Command::new("etcd-member-add", &self.node)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let peer_url = format!("https://{}:{ETCD_PEER_PORT}", self.node);
        let mut client = infra.etcd_client().await?;

        let members = client.member_list().await.map_err(etcd_err)?;
        if members
            .members()
            .iter()
            .any(|m| m.peer_urls().iter().any(|u| u == &peer_url))
        {
            debug!(node = %self.node, "already an etcd member");
            return Ok(());
        }

        let resp = client
            .member_add(vec![peer_url], None)
            .await
            .map_err(etcd_err)?;
        info!(
            node = %self.node,
            member = resp.member().map(|m| m.id()).unwrap_or_default(),
            "etcd member added"
        );
        Ok(())
    }
}

/// Remove a member from the cluster
#[derive(Debug)]
pub struct RemoveEtcdMember {
    /// Address the member was running on, for the record
    pub node: String,
    /// Member ID
    pub id: u64,
}

#[async_trait]
impl Commander for RemoveEtcdMember {
    fn command(&self) -> Command {
        Command::new("etcd-member-remove", &self.node).with_detail(format!("{:x}", self.id))
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let mut client = infra.etcd_client().await?;
        client.member_remove(self.id).await.map_err(etcd_err)?;
        warn!(node = %self.node, member = self.id, "etcd member removed");
        Ok(())
    }
}

/// Poll until etcd answers a status query or the deadline passes
#[derive(Debug)]
pub struct WaitEtcdHealthy {
    /// Deadline for the whole wait
    pub timeout: Duration,
}

#[async_trait]
impl Commander for WaitEtcdHealthy {
    fn command(&self) -> Command {
        Command::new("etcd-wait", "").with_detail(format!("{}s", self.timeout.as_secs()))
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let poll = async {
            loop {
                match infra.etcd_client().await {
                    Ok(mut client) => match client.status().await {
                        Ok(status) => {
                            debug!(leader = status.leader(), "etcd is healthy");
                            return;
                        }
                        Err(e) => debug!(error = %e, "etcd not healthy yet"),
                    },
                    Err(e) => debug!(error = %e, "etcd not reachable yet"),
                }
                tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(self.timeout, poll)
            .await
            .map_err(|_| Error::Timeout {
                node: "etcd".to_string(),
                timeout: self.timeout,
            })
    }
}

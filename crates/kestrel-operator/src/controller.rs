//! Leader-elected reconciliation loop
//!
//! The controller campaigns for leadership, then ticks until told to stop or
//! until leadership is lost. A lost lease aborts the in-flight tick at its
//! next await point and sends the controller back to campaigning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kestrel_common::Result;
use kestrel_infra::{Infrastructure, Session};
use kestrel_storage::{LeaderElector, LeaderGuard, Storage};

use crate::phase::Phase;
use crate::tick::{run_tick, TickOutcome};

/// How a leadership term ended
enum Term {
    Stopped,
    Lost,
}

/// Runs ticks for one cluster while holding leadership
pub struct Controller {
    session: Arc<Session>,
    storage: Storage,
    identity: String,
}

impl Controller {
    /// Controller identified by `identity` (normally the host name)
    pub fn new(session: Arc<Session>, storage: Storage, identity: impl Into<String>) -> Self {
        Self {
            session,
            storage,
            identity: identity.into(),
        }
    }

    /// Run until `stop` turns true or its sender is dropped
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let config = self.session.config();
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            let elector = Arc::new(LeaderElector::new(
                self.storage.backend(),
                self.storage.prefix(),
                &self.identity,
                config.leader_lease_ttl,
            ));

            let campaign = tokio::select! {
                guard = elector.campaign() => guard,
                _ = stop.changed() => return Ok(()),
            };
            let mut guard = match campaign {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "campaign failed, retrying");
                    if wait(config.tick_interval, &mut stop).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            match self.lead(&mut guard, &mut stop).await {
                Term::Stopped => {
                    guard.resign().await?;
                    return Ok(());
                }
                Term::Lost => warn!(identity = %self.identity, "leadership lost, campaigning again"),
            }
        }
    }

    async fn lead(&self, guard: &mut LeaderGuard, stop: &mut watch::Receiver<bool>) -> Term {
        let interval = self.session.config().tick_interval;
        let key = guard.key().to_string();
        let mut phase = Phase::Upgrade;

        loop {
            if *stop.borrow() {
                return Term::Stopped;
            }
            let tick = tokio::select! {
                result = self.tick(&key, phase, stop) => result,
                _ = guard.lost() => return Term::Lost,
            };

            let pause = match tick {
                Ok(Some(outcome)) if outcome.is_completed() => {
                    debug!("cluster converged, restarting at upgrade after the interval");
                    phase = Phase::Upgrade;
                    Some(interval)
                }
                Ok(Some(outcome)) => {
                    phase = outcome.phase;
                    None
                }
                Ok(None) => Some(interval),
                Err(e) if e.is_lost_leadership() => return Term::Lost,
                Err(e) => {
                    error!(phase = %phase, error = %e, "tick failed");
                    Some(interval)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    stopped = wait(pause, stop) => if stopped { return Term::Stopped },
                    _ = guard.lost() => return Term::Lost,
                }
            }
        }
    }

    /// One tick against the stored cluster; `None` when no cluster is defined
    async fn tick(
        &self,
        leader_key: &str,
        phase: Phase,
        stop: &watch::Receiver<bool>,
    ) -> Result<Option<TickOutcome>> {
        let cluster = match self.storage.get_cluster().await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                debug!("no cluster defined");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!(cluster = %cluster.name, phase = %phase, "tick");
        let infra = Infrastructure::new(
            self.session.clone(),
            cluster,
            self.storage.clone(),
            leader_key,
        )
        .await?;
        let outcome = run_tick(&infra, phase, stop).await;
        infra.close().await;
        outcome.map(Some)
    }
}

/// Sleep for `duration`; true if a stop was signalled meanwhile
async fn wait(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::config::EngineConfig;
    use kestrel_infra::testing::StaticSecrets;
    use kestrel_storage::MemoryKv;

    fn controller(kv: &MemoryKv) -> Controller {
        let config = EngineConfig {
            tick_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let session = Arc::new(Session::with_secrets(config, StaticSecrets::default().shared()));
        Controller::new(session, Storage::new(Arc::new(kv.clone()), "/kestrel/"), "host-a")
    }

    #[tokio::test]
    async fn idles_without_a_cluster_and_resigns_on_stop() {
        let kv = MemoryKv::new();
        let storage = Storage::new(Arc::new(kv.clone()), "/kestrel/");
        let (tx, stop) = watch::channel(false);
        let c = controller(&kv);
        let running = tokio::spawn(async move { c.run(stop).await });

        let mut leader = None;
        for _ in 0..50 {
            if let Ok(name) = storage.get_leader_hostname().await {
                leader = Some(name);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(leader.as_deref(), Some("host-a"));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(storage.get_leader_hostname().await.is_err());
    }

    #[tokio::test]
    async fn wait_returns_early_on_stop() {
        let (tx, mut stop) = watch::channel(false);
        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(
            Duration::from_secs(1),
            wait(Duration::from_secs(60), &mut stop),
        )
        .await
        .unwrap();
        assert!(stopped);
    }
}

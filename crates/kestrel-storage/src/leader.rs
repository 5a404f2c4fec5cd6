//! Leader election over the key-value backend
//!
//! Each candidate writes `leader/<lease-id>` bound to its own lease. The key
//! with the lowest create revision is the leader; the others wait for it to
//! disappear. The leader passes its key to every guarded [`Storage`] write,
//! so once the lease is gone no further mutation can succeed.
//!
//! [`Storage`]: crate::Storage

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kestrel_common::{Error, Result};

use crate::keys;
use crate::kv::{Compare, KvBackend, RangeOptions, Txn, TxnOp};

const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Campaigns for leadership of one key prefix
pub struct LeaderElector {
    kv: Arc<dyn KvBackend>,
    prefix: String,
    identity: String,
    lease_ttl: i64,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector; `identity` (normally the host name) is stored as
    /// the leader key's value
    pub fn new(kv: Arc<dyn KvBackend>, prefix: &str, identity: &str, lease_ttl: i64) -> Self {
        Self {
            kv,
            prefix: prefix.to_string(),
            identity: identity.to_string(),
            lease_ttl,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override renewal and retry intervals
    pub fn with_intervals(mut self, renew: Duration, retry: Duration) -> Self {
        self.renew_interval = renew;
        self.retry_interval = retry;
        self
    }

    /// True while a guard from this elector holds leadership
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired
    pub async fn campaign(self: Arc<Self>) -> Result<LeaderGuard> {
        let lease = self.kv.grant_lease(self.lease_ttl).await?;
        let key = format!("{}{}{lease:x}", self.prefix, keys::LEADER_PREFIX);

        let created = self
            .kv
            .txn(Txn::when(vec![Compare::Absent(key.clone())]).then(vec![TxnOp::Put {
                key: key.clone(),
                value: self.identity.clone().into_bytes(),
                lease: Some(lease),
            }]))
            .await?;
        if !created.succeeded {
            return Err(Error::etcd(format!("leader key {key} already exists")));
        }

        info!(identity = %self.identity, key = %key, "campaigning for leadership");

        loop {
            match self.leader_key().await {
                Ok(Some(current)) if current == key => break,
                Ok(Some(current)) => {
                    debug!(identity = %self.identity, leader = %current, "waiting for leader to step down");
                }
                Ok(None) => {
                    self.kv.revoke_lease(lease).await.ok();
                    return Err(Error::etcd("own leader key vanished while campaigning"));
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "failed to read leader keys, retrying");
                }
            }
            self.kv.keep_alive(lease).await?;
            tokio::time::sleep(self.retry_interval).await;
        }

        info!(identity = %self.identity, "leadership acquired");
        self.is_leader.store(true, Ordering::SeqCst);

        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(&self);
        let renew_key = key.clone();
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lease, renew_key, lost_tx).await;
        });

        Ok(LeaderGuard {
            elector: self,
            key,
            lease,
            renewal_task,
            lost_rx: Some(lost_rx),
        })
    }

    /// Key of the current leader (lowest create revision)
    async fn leader_key(&self) -> Result<Option<String>> {
        let resp = self
            .kv
            .range(
                &format!("{}{}", self.prefix, keys::LEADER_PREFIX),
                RangeOptions::keys(),
            )
            .await?;
        Ok(resp
            .kvs
            .into_iter()
            .min_by_key(|kv| kv.create_revision)
            .map(|kv| kv.key))
    }

    async fn renewal_loop(&self, lease: i64, key: String, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            let alive = match self.kv.keep_alive(lease).await {
                Ok(()) => matches!(self.kv.get(&key).await, Ok(Some(_))),
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease keep-alive failed");
                    false
                }
            };
            if !alive {
                warn!(identity = %self.identity, "leadership lost");
                self.is_leader.store(false, Ordering::SeqCst);
                let _ = lost_tx.send(());
                return;
            }
        }
    }
}

/// Held by the leader for as long as it leads
///
/// The lease is renewed in the background. Use [`LeaderGuard::lost`] to wait
/// for leadership loss and [`LeaderGuard::resign`] to step down.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    key: String,
    lease: i64,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// The leader key to pass to guarded storage writes
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait until leadership is lost
    ///
    /// Safe to use in `select!`: dropping the future keeps the signal armed.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.as_mut() {
            let _ = rx.await;
            self.lost_rx = None;
        }
    }

    /// Step down by revoking the lease so a standby can take over at once
    pub async fn resign(self) -> Result<()> {
        self.renewal_task.abort();
        self.elector.kv.revoke_lease(self.lease).await?;
        info!(identity = %self.elector.identity, "resigned leadership");
        Ok(())
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use crate::Storage;

    fn elector(kv: &MemoryKv, identity: &str) -> Arc<LeaderElector> {
        Arc::new(
            LeaderElector::new(Arc::new(kv.clone()), "/kestrel/", identity, 60)
                .with_intervals(Duration::from_millis(10), Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn first_candidate_wins_and_second_waits() {
        let kv = MemoryKv::new();
        let a = elector(&kv, "host-a");
        let guard = Arc::clone(&a).campaign().await.unwrap();
        assert!(a.is_leader());

        let b = elector(&kv, "host-b");
        let pending = tokio::spawn(Arc::clone(&b).campaign());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let storage = Storage::new(Arc::new(kv.clone()), "/kestrel/");
        assert_eq!(storage.get_leader_hostname().await.unwrap(), "host-a");

        guard.resign().await.unwrap();
        let guard_b = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(b.is_leader());
        assert_eq!(storage.get_leader_hostname().await.unwrap(), "host-b");
        assert!(guard_b.key().starts_with("/kestrel/leader/"));
    }

    #[tokio::test]
    async fn revoked_lease_signals_loss() {
        let kv = MemoryKv::new();
        let a = elector(&kv, "host-a");
        let mut guard = Arc::clone(&a).campaign().await.unwrap();

        let lease = guard.lease;
        kv.revoke_lease(lease).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), guard.lost())
            .await
            .unwrap();
        assert!(!a.is_leader());
    }
}

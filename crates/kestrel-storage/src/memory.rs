//! In-process key-value backend
//!
//! A transactional stand-in for etcd with the same revision semantics: one
//! store revision per applied transaction, per-key mod and create revisions,
//! leases that own keys, and prefix watches that can start in the past.
//! Leases never expire on their own; revoke them to simulate expiry.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use kestrel_common::{Error, Result};

use crate::kv::{
    Compare, KeyValue, KvBackend, RangeOptions, RangeResponse, Txn, TxnOp, TxnResult, WatchEvent,
    WatchEventKind,
};

const WATCH_CHANNEL_CAPACITY: usize = 4096;

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    mod_revision: i64,
    create_revision: i64,
    lease: Option<i64>,
}

#[derive(Default)]
struct State {
    data: BTreeMap<String, Entry>,
    revision: i64,
    leases: HashSet<i64>,
    next_lease: i64,
    history: Vec<WatchEvent>,
}

impl State {
    fn kv(&self, key: &str, entry: &Entry) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            mod_revision: entry.mod_revision,
            create_revision: entry.create_revision,
        }
    }

    fn holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::Exists(key) => self.data.contains_key(key),
            Compare::Absent(key) => !self.data.contains_key(key),
            Compare::Value(key, value) => self.data.get(key).is_some_and(|e| &e.value == value),
            Compare::ModRevision(key, rev) => {
                self.data.get(key).map(|e| e.mod_revision).unwrap_or(0) == *rev
            }
        }
    }
}

/// Thread-safe in-memory [`KvBackend`]
#[derive(Clone)]
pub struct MemoryKv {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Create an empty store at revision 0
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
        }
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, state: &mut State, events: Vec<WatchEvent>) {
        for event in events {
            state.history.push(event.clone());
            // No receivers is fine; history covers late watchers.
            let _ = self.events.send(event);
        }
    }

    fn delete_locked(state: &mut State, key: &str, revision: i64) -> Option<WatchEvent> {
        let entry = state.data.remove(key)?;
        Some(WatchEvent {
            kind: WatchEventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                mod_revision: revision,
                create_revision: entry.create_revision,
            },
        })
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let state = self.state.lock();
        Ok(state.data.get(key).map(|e| state.kv(key, e)))
    }

    async fn range(&self, prefix: &str, options: RangeOptions) -> Result<RangeResponse> {
        let state = self.state.lock();
        let matching = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix));
        let mut kvs: Vec<KeyValue> = matching.map(|(k, e)| state.kv(k, e)).collect();
        if options.descending {
            kvs.reverse();
        }
        if options.limit > 0 {
            kvs.truncate(options.limit);
        }
        if options.keys_only {
            for kv in &mut kvs {
                kv.value.clear();
            }
        }
        Ok(RangeResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        let mut state = self.state.lock();
        if !txn.compares.iter().all(|c| state.holds(c)) {
            return Ok(TxnResult {
                succeeded: false,
                revision: state.revision,
            });
        }

        for op in &txn.ops {
            if let TxnOp::Put {
                lease: Some(lease), ..
            } = op
            {
                if !state.leases.contains(lease) {
                    return Err(Error::etcd(format!("lease {lease:x} not found")));
                }
            }
        }

        let revision = state.revision + 1;
        let mut events = Vec::new();
        for op in txn.ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    let create_revision = state
                        .data
                        .get(&key)
                        .map(|e| e.create_revision)
                        .unwrap_or(revision);
                    let entry = Entry {
                        value,
                        mod_revision: revision,
                        create_revision,
                        lease,
                    };
                    events.push(WatchEvent {
                        kind: WatchEventKind::Put,
                        kv: state.kv(&key, &entry),
                    });
                    state.data.insert(key, entry);
                }
                TxnOp::Delete { key } => {
                    if let Some(event) = Self::delete_locked(&mut state, &key, revision) {
                        events.push(event);
                    }
                }
            }
        }
        if !events.is_empty() {
            state.revision = revision;
        }
        self.publish(&mut state, events);

        Ok(TxnResult {
            succeeded: true,
            revision: state.revision,
        })
    }

    async fn grant_lease(&self, _ttl: i64) -> Result<i64> {
        let mut state = self.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(id);
        Ok(id)
    }

    async fn keep_alive(&self, lease: i64) -> Result<()> {
        if self.state.lock().leases.contains(&lease) {
            Ok(())
        } else {
            Err(Error::etcd(format!("lease {lease:x} expired or revoked")))
        }
    }

    async fn revoke_lease(&self, lease: i64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.leases.remove(&lease) {
            return Err(Error::etcd(format!("lease {lease:x} not found")));
        }
        let owned: Vec<String> = state
            .data
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        if owned.is_empty() {
            return Ok(());
        }
        let revision = state.revision + 1;
        let events: Vec<WatchEvent> = owned
            .iter()
            .filter_map(|k| Self::delete_locked(&mut state, k, revision))
            .collect();
        state.revision = revision;
        self.publish(&mut state, events);
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        // Replay and subscribe under one lock so no event is lost or repeated.
        let (replay, receiver) = {
            let state = self.state.lock();
            let replay: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|e| e.kv.key.starts_with(prefix) && e.kv.mod_revision >= start_revision)
                .cloned()
                .collect();
            (replay, self.events.subscribe())
        };

        let prefix = prefix.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |event| {
            let item = match event {
                Ok(e) if e.kv.key.starts_with(&prefix) && e.kv.mod_revision >= start_revision => {
                    Some(Ok(e))
                }
                Ok(_) => None,
                Err(e) => Some(Err(Error::etcd(format!("watch fell behind: {e}")))),
            };
            futures::future::ready(item)
        });

        Ok(stream::iter(replay.into_iter().map(Ok)).chain(live).boxed())
    }
}

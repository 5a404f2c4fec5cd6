//! Key-value backend abstraction
//!
//! The subset of the etcd v3 API the engine relies on: point reads, prefix
//! ranges, multi-key transactions with compare guards, leases and prefix
//! watches. Keys handed to a backend are absolute (prefix included).

use async_trait::async_trait;
use futures::stream::BoxStream;

use kestrel_common::Result;

/// A stored key and its revisions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// Absolute key
    pub key: String,
    /// Stored bytes (empty when fetched keys-only)
    pub value: Vec<u8>,
    /// Revision of the last write to this key
    pub mod_revision: i64,
    /// Revision at which this key was created
    pub create_revision: i64,
}

/// Options for a prefix range
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeOptions {
    /// Maximum number of keys; 0 means no limit
    pub limit: usize,
    /// Sort by key descending instead of ascending
    pub descending: bool,
    /// Return keys and revisions without values
    pub keys_only: bool,
}

impl RangeOptions {
    /// The `limit` highest keys, highest first
    pub fn newest(limit: usize) -> Self {
        Self {
            limit,
            descending: true,
            keys_only: false,
        }
    }

    /// All keys ascending without values
    pub fn keys() -> Self {
        Self {
            keys_only: true,
            ..Default::default()
        }
    }
}

/// Result of a prefix range
#[derive(Clone, Debug, Default)]
pub struct RangeResponse {
    /// Matching keys in the requested order
    pub kvs: Vec<KeyValue>,
    /// Store revision the range was served at
    pub revision: i64,
}

/// Guard evaluated at the start of a transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compare {
    /// The key exists
    Exists(String),
    /// The key does not exist
    Absent(String),
    /// The key holds exactly these bytes
    Value(String, Vec<u8>),
    /// The key was last written at this revision
    ModRevision(String, i64),
}

/// Write performed by a successful transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    /// Store a value, optionally bound to a lease
    Put {
        /// Absolute key
        key: String,
        /// Bytes to store
        value: Vec<u8>,
        /// Lease the key is attached to
        lease: Option<i64>,
    },
    /// Delete a key
    Delete {
        /// Absolute key
        key: String,
    },
}

impl TxnOp {
    /// Put without a lease
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    /// Delete a key
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// An all-or-nothing conditional write
///
/// `ops` are applied only when every compare holds; otherwise nothing
/// changes and the result reports `succeeded == false`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Txn {
    /// Guards
    pub compares: Vec<Compare>,
    /// Writes applied when all guards hold
    pub ops: Vec<TxnOp>,
}

impl Txn {
    /// Start a transaction with guards
    pub fn when(compares: Vec<Compare>) -> Self {
        Self {
            compares,
            ops: Vec::new(),
        }
    }

    /// Set the writes
    pub fn then(mut self, ops: Vec<TxnOp>) -> Self {
        self.ops = ops;
        self
    }
}

/// Outcome of a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnResult {
    /// All guards held and the writes were applied
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: i64,
}

/// Kind of change seen by a watch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Created or updated
    Put,
    /// Deleted
    Delete,
}

/// One change seen by a watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    /// Change kind
    pub kind: WatchEventKind,
    /// Key state after the change (value empty for deletes)
    pub kv: KeyValue,
}

/// Transactional key-value store with leases and watches
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read one key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Read every key starting with `prefix`
    async fn range(&self, prefix: &str, options: RangeOptions) -> Result<RangeResponse>;

    /// Run a conditional multi-key write
    async fn txn(&self, txn: Txn) -> Result<TxnResult>;

    /// Create a lease with a TTL in seconds
    async fn grant_lease(&self, ttl: i64) -> Result<i64>;

    /// Refresh a lease once; fails when the lease no longer exists
    async fn keep_alive(&self, lease: i64) -> Result<()>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, lease: i64) -> Result<()>;

    /// Stream changes under `prefix` starting at `start_revision`
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>>;
}

//! Persistence for the kestrel engine
//!
//! All engine state lives in an etcd key space under a cluster-specific
//! prefix. [`Storage`] is the typed view over that key space; it talks to
//! etcd through the [`KvBackend`] trait so the same code runs against a real
//! cluster ([`EtcdKv`]) or the in-process [`MemoryKv`].

#![deny(missing_docs)]

pub mod etcd;
pub mod keys;
pub mod kv;
pub mod leader;
pub mod memory;
pub mod storage;

pub use etcd::{EtcdKv, EtcdTls};
pub use kv::{
    Compare, KeyValue, KvBackend, RangeOptions, RangeResponse, Txn, TxnOp, TxnResult, WatchEvent,
    WatchEventKind,
};
pub use leader::{LeaderElector, LeaderGuard};
pub use memory::MemoryKv;
pub use storage::Storage;

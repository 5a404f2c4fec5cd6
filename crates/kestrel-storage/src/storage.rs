//! Typed access to the engine key space
//!
//! Reads never require leadership. Every write takes the caller's leader key
//! and runs in a transaction guarded by that key's existence, so a process
//! that lost its lease cannot change shared state; such writes fail as a
//! whole with [`Error::LostLeadership`].

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use kestrel_common::config::{EngineConfig, DEFAULT_MAX_RECORDS, DEFAULT_WATCH_REPLAY};
use kestrel_common::resource::sort_resources;
use kestrel_common::{
    Cluster, Constraints, Error, Record, ResourceDefinition, Result, VaultConfig,
};

use crate::keys;
use crate::kv::{Compare, KeyValue, KvBackend, RangeOptions, Txn, TxnOp, TxnResult, WatchEventKind};

/// Attempts for compare-and-swap loops on counters
const MAX_CAS_ATTEMPTS: usize = 8;

/// Typed view over the engine's etcd key space
#[derive(Clone)]
pub struct Storage {
    kv: Arc<dyn KvBackend>,
    prefix: String,
    max_records: usize,
    watch_replay: usize,
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::serialization(format!("decoding {key}: {e}")))
}

fn parse_counter(key: &str, bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| Error::serialization(format!("{key} is not a decimal counter")))
}

fn into_string(key: &str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| Error::serialization(format!("{key} is not UTF-8")))
}

impl Storage {
    /// Create a storage view rooted at `prefix` (which should end with '/')
    pub fn new(kv: Arc<dyn KvBackend>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            max_records: DEFAULT_MAX_RECORDS,
            watch_replay: DEFAULT_WATCH_REPLAY,
        }
    }

    /// Create a storage view using the prefix, retention cap and watch
    /// replay depth of `config`
    pub fn from_config(kv: Arc<dyn KvBackend>, config: &EngineConfig) -> Self {
        let mut storage =
            Self::new(kv, config.key_prefix.clone()).with_max_records(config.max_records);
        storage.watch_replay = config.watch_replay;
        storage
    }

    /// Override the record retention cap
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    fn key(&self, relative: &str) -> String {
        format!("{}{}", self.prefix, relative)
    }

    /// The key prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The underlying backend
    pub fn backend(&self) -> Arc<dyn KvBackend> {
        Arc::clone(&self.kv)
    }

    async fn get_raw(&self, relative: &str) -> Result<Option<KeyValue>> {
        self.kv.get(&self.key(relative)).await
    }

    async fn get_required(&self, relative: &str) -> Result<KeyValue> {
        self.get_raw(relative)
            .await?
            .ok_or_else(|| Error::not_found(relative))
    }

    async fn get_json<T: DeserializeOwned>(&self, relative: &str) -> Result<T> {
        let kv = self.get_required(relative).await?;
        decode(relative, &kv.value)
    }

    async fn get_string(&self, relative: &str) -> Result<String> {
        let kv = self.get_required(relative).await?;
        into_string(relative, kv.value)
    }

    /// Run `ops` only if the leader key and every extra guard hold.
    ///
    /// A failed transaction is attributed to leadership loss when the leader
    /// key is gone, otherwise to the extra guards.
    async fn guarded(
        &self,
        leader_key: &str,
        compares: Vec<Compare>,
        ops: Vec<TxnOp>,
    ) -> Result<TxnResult> {
        let conflict_key = compares.first().map(|c| match c {
            Compare::Exists(k) | Compare::Absent(k) => k.clone(),
            Compare::Value(k, _) | Compare::ModRevision(k, _) => k.clone(),
        });

        let mut guards = Vec::with_capacity(compares.len() + 1);
        guards.push(Compare::Exists(leader_key.to_string()));
        guards.extend(compares);

        let result = self.kv.txn(Txn::when(guards).then(ops)).await?;
        if result.succeeded {
            return Ok(result);
        }
        if self.kv.get(leader_key).await?.is_none() {
            return Err(Error::LostLeadership);
        }
        Err(Error::conflict(
            conflict_key.unwrap_or_else(|| leader_key.to_string()),
            "stored value changed concurrently",
        ))
    }

    async fn put_guarded(&self, leader_key: &str, relative: &str, value: Vec<u8>) -> Result<()> {
        self.guarded(leader_key, vec![], vec![TxnOp::put(self.key(relative), value)])
            .await?;
        Ok(())
    }

    async fn put_json<T: Serialize>(&self, leader_key: &str, relative: &str, value: &T) -> Result<()> {
        self.put_guarded(leader_key, relative, serde_json::to_vec(value)?)
            .await
    }

    // -- cluster ---------------------------------------------------------

    /// Read the desired cluster
    pub async fn get_cluster(&self) -> Result<Cluster> {
        self.get_json(keys::CLUSTER).await
    }

    /// Read the desired cluster together with its `cluster-revision` counter
    ///
    /// The counter is 0 when no cluster was ever stored.
    pub async fn get_cluster_with_revision(&self) -> Result<(Cluster, i64)> {
        let cluster = self.get_cluster().await?;
        Ok((cluster, self.cluster_revision().await?))
    }

    async fn cluster_revision(&self) -> Result<i64> {
        match self.get_raw(keys::CLUSTER_REVISION).await? {
            Some(kv) => parse_counter(keys::CLUSTER_REVISION, &kv.value),
            None => Ok(0),
        }
    }

    /// Validate and store the desired cluster, bumping `cluster-revision`
    pub async fn put_cluster(&self, leader_key: &str, cluster: &Cluster) -> Result<i64> {
        let current = self.cluster_revision().await?;
        self.put_cluster_if_unchanged(leader_key, cluster, current)
            .await
    }

    /// Store the cluster only if `cluster-revision` still equals `expected`
    ///
    /// Returns the new revision, or [`Error::Conflict`] when another writer
    /// stored a cluster since `expected` was read.
    pub async fn put_cluster_if_unchanged(
        &self,
        leader_key: &str,
        cluster: &Cluster,
        expected: i64,
    ) -> Result<i64> {
        cluster.validate()?;

        let revision_key = self.key(keys::CLUSTER_REVISION);
        let guard = if expected == 0 {
            Compare::Absent(revision_key.clone())
        } else {
            Compare::Value(revision_key.clone(), expected.to_string().into_bytes())
        };
        let next = expected + 1;
        self.guarded(
            leader_key,
            vec![guard],
            vec![
                TxnOp::put(self.key(keys::CLUSTER), serde_json::to_vec(cluster)?),
                TxnOp::put(revision_key, next.to_string()),
            ],
        )
        .await?;
        info!(cluster = %cluster.name, revision = next, "stored cluster definition");
        Ok(next)
    }

    // -- constraints -----------------------------------------------------

    /// Read the constraints
    pub async fn get_constraints(&self) -> Result<Constraints> {
        self.get_json(keys::CONSTRAINTS).await
    }

    /// Validate and store the constraints
    pub async fn put_constraints(&self, leader_key: &str, constraints: &Constraints) -> Result<()> {
        constraints.validate()?;
        self.put_json(leader_key, keys::CONSTRAINTS, constraints).await
    }

    // -- configuration version and markers -------------------------------

    /// Stored configuration layout version, `None` before the first upgrade
    pub async fn get_config_version(&self) -> Result<Option<String>> {
        match self.get_string(keys::CONFIG_VERSION).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Record the configuration layout version
    pub async fn put_config_version(&self, leader_key: &str, version: &str) -> Result<()> {
        self.put_guarded(leader_key, keys::CONFIG_VERSION, version.as_bytes().to_vec())
            .await
    }

    /// Whether a previous etcd bootstrap ran to completion
    pub async fn is_etcd_bootstrapped(&self) -> Result<bool> {
        Ok(self.get_raw(keys::ETCD_BOOTSTRAPPED).await?.is_some())
    }

    /// Mark etcd bootstrap as complete
    pub async fn set_etcd_bootstrapped(&self, leader_key: &str) -> Result<()> {
        self.put_guarded(leader_key, keys::ETCD_BOOTSTRAPPED, b"true".to_vec())
            .await
    }

    // -- certificate authorities and secrets -----------------------------

    /// Read the PEM root certificate of a CA
    pub async fn get_ca_certificate(&self, name: &str) -> Result<String> {
        self.get_string(&keys::ca(name)).await
    }

    /// Store the PEM root certificate of a CA
    pub async fn put_ca_certificate(&self, leader_key: &str, name: &str, pem: &str) -> Result<()> {
        self.put_guarded(leader_key, &keys::ca(name), pem.as_bytes().to_vec())
            .await
    }

    /// Read the secrets backend settings
    pub async fn get_vault_config(&self) -> Result<VaultConfig> {
        self.get_json(keys::VAULT).await
    }

    /// Validate and store the secrets backend settings
    pub async fn put_vault_config(&self, leader_key: &str, config: &VaultConfig) -> Result<()> {
        config.validate()?;
        self.put_json(leader_key, keys::VAULT, config).await
    }

    /// Read the service-account signing certificate
    pub async fn get_service_account_cert(&self) -> Result<String> {
        self.get_string(keys::SERVICE_ACCOUNT_CERT).await
    }

    /// Read the service-account signing key
    pub async fn get_service_account_key(&self) -> Result<String> {
        self.get_string(keys::SERVICE_ACCOUNT_KEY).await
    }

    /// Store the service-account certificate and key together
    pub async fn put_service_account_data(
        &self,
        leader_key: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<()> {
        self.guarded(
            leader_key,
            vec![],
            vec![
                TxnOp::put(self.key(keys::SERVICE_ACCOUNT_CERT), cert_pem),
                TxnOp::put(self.key(keys::SERVICE_ACCOUNT_KEY), key_pem),
            ],
        )
        .await?;
        Ok(())
    }

    // -- records ---------------------------------------------------------

    /// Allocate the next record ID
    pub async fn next_record_id(&self, leader_key: &str) -> Result<i64> {
        let counter = self.key(keys::RECORDS);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (next, guard) = match self.kv.get(&counter).await? {
                None => (1, Compare::Absent(counter.clone())),
                Some(kv) => (
                    parse_counter(keys::RECORDS, &kv.value)? + 1,
                    Compare::ModRevision(counter.clone(), kv.mod_revision),
                ),
            };
            match self
                .guarded(leader_key, vec![guard], vec![TxnOp::put(&counter, next.to_string())])
                .await
            {
                Ok(_) => return Ok(next),
                Err(Error::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(counter, "record counter kept moving"))
    }

    /// Append a record, dropping the oldest beyond the retention cap
    ///
    /// The append and the deletions happen in one leader-guarded transaction.
    pub async fn register_record(&self, leader_key: &str, record: &Record) -> Result<()> {
        let new_key = self.key(&keys::record(record.id));
        let existing = self
            .kv
            .range(&self.key(keys::RECORD_PREFIX), RangeOptions::keys())
            .await?;

        let is_new = !existing.kvs.iter().any(|kv| kv.key == new_key);
        let total = existing.kvs.len() + usize::from(is_new);
        let excess = total.saturating_sub(self.max_records);

        let mut ops = vec![TxnOp::put(new_key, serde_json::to_vec(record)?)];
        ops.extend(
            existing
                .kvs
                .iter()
                .take(excess)
                .map(|kv| TxnOp::delete(kv.key.clone())),
        );
        self.guarded(leader_key, vec![], ops).await?;

        if excess > 0 {
            debug!(id = record.id, dropped = excess, "record log trimmed");
        }
        Ok(())
    }

    /// Overwrite an existing record
    ///
    /// Fails with [`Error::Conflict`] when the record is no longer stored,
    /// so a record trimmed by retention is never written back.
    pub async fn update_record(&self, leader_key: &str, record: &Record) -> Result<()> {
        let key = self.key(&keys::record(record.id));
        let ops = vec![TxnOp::put(key.clone(), serde_json::to_vec(record)?)];
        self.guarded(leader_key, vec![Compare::Exists(key)], ops).await?;
        Ok(())
    }

    /// Read one record
    pub async fn get_record(&self, id: i64) -> Result<Record> {
        self.get_json(&keys::record(id)).await
    }

    /// The `count` most recent records, newest first
    pub async fn get_records(&self, count: usize) -> Result<Vec<Record>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let resp = self
            .kv
            .range(&self.key(keys::RECORD_PREFIX), RangeOptions::newest(count))
            .await?;
        resp.kvs
            .iter()
            .map(|kv| decode(&kv.key, &kv.value))
            .collect()
    }

    /// Replay the `initial` most recent records oldest first, then follow
    /// new and updated records as they are written
    ///
    /// `None` replays the configured depth. Deletions from retention
    /// trimming are not reported.
    pub async fn watch_records(
        &self,
        initial: Option<usize>,
    ) -> Result<BoxStream<'static, Result<Record>>> {
        let initial = initial.unwrap_or(self.watch_replay);
        let prefix = self.key(keys::RECORD_PREFIX);
        let resp = self
            .kv
            .range(&prefix, RangeOptions::newest(initial.max(1)))
            .await?;

        let mut replay: Vec<Result<Record>> = if initial == 0 {
            Vec::new()
        } else {
            resp.kvs
                .iter()
                .map(|kv| decode(&kv.key, &kv.value))
                .collect()
        };
        replay.reverse();

        let live = self
            .kv
            .watch_prefix(&prefix, resp.revision + 1)
            .await?
            .filter_map(|event| {
                let item = match event {
                    Ok(e) if e.kind == WatchEventKind::Put => Some(decode(&e.kv.key, &e.kv.value)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(item)
            });

        Ok(stream::iter(replay).chain(live).boxed())
    }

    // -- user resources --------------------------------------------------

    /// Read one resource definition
    pub async fn get_resource(&self, key: &str) -> Result<ResourceDefinition> {
        let kv = self.get_required(&keys::resource(key)).await?;
        ResourceDefinition::from_stored(key, kv.value, kv.mod_revision)
    }

    /// Store a resource definition, returning its new revision
    pub async fn set_resource(&self, leader_key: &str, key: &str, definition: &[u8]) -> Result<i64> {
        ResourceDefinition::parse_key(key)?;
        let result = self
            .guarded(
                leader_key,
                vec![],
                vec![TxnOp::put(self.key(&keys::resource(key)), definition)],
            )
            .await?;
        Ok(result.revision)
    }

    /// Delete a resource definition
    pub async fn delete_resource(&self, leader_key: &str, key: &str) -> Result<()> {
        self.guarded(
            leader_key,
            vec![],
            vec![TxnOp::delete(self.key(&keys::resource(key)))],
        )
        .await?;
        Ok(())
    }

    /// Every resource definition, in creation order
    pub async fn list_resources(&self) -> Result<Vec<ResourceDefinition>> {
        let prefix = self.key(keys::RESOURCE_PREFIX);
        let resp = self.kv.range(&prefix, RangeOptions::default()).await?;
        let mut resources = resp
            .kvs
            .into_iter()
            .map(|kv| {
                let key = kv.key[prefix.len()..].to_string();
                ResourceDefinition::from_stored(&key, kv.value, kv.mod_revision)
            })
            .collect::<Result<Vec<_>>>()?;
        sort_resources(&mut resources);
        Ok(resources)
    }

    // -- inventory integration -------------------------------------------

    /// Inventory service URL
    pub async fn get_inventory_url(&self) -> Result<String> {
        self.get_string(keys::INVENTORY_URL).await
    }

    /// Set the inventory service URL
    pub async fn put_inventory_url(&self, leader_key: &str, url: &str) -> Result<()> {
        self.put_guarded(leader_key, keys::INVENTORY_URL, url.as_bytes().to_vec())
            .await
    }

    /// Cluster template used to generate clusters from the inventory
    pub async fn get_inventory_template(&self) -> Result<(Cluster, i64)> {
        let kv = self.get_required(keys::INVENTORY_TEMPLATE).await?;
        Ok((decode(keys::INVENTORY_TEMPLATE, &kv.value)?, kv.mod_revision))
    }

    /// Store the cluster template
    pub async fn put_inventory_template(&self, leader_key: &str, template: &Cluster) -> Result<()> {
        self.put_json(leader_key, keys::INVENTORY_TEMPLATE, template)
            .await
    }

    /// Whether inventory integration is switched off
    pub async fn is_inventory_disabled(&self) -> Result<bool> {
        match self.get_raw(keys::INVENTORY_DISABLED).await? {
            Some(kv) => Ok(kv.value == b"true"),
            None => Ok(false),
        }
    }

    /// Switch inventory integration on or off
    pub async fn set_inventory_disabled(&self, leader_key: &str, disabled: bool) -> Result<()> {
        let value = if disabled { "true" } else { "false" };
        self.put_guarded(leader_key, keys::INVENTORY_DISABLED, value.as_bytes().to_vec())
            .await
    }

    // -- leadership ------------------------------------------------------

    /// Host name of the current leader
    pub async fn get_leader_hostname(&self) -> Result<String> {
        let resp = self
            .kv
            .range(&self.key(keys::LEADER_PREFIX), RangeOptions::default())
            .await?;
        let leader = resp
            .kvs
            .into_iter()
            .min_by_key(|kv| kv.create_revision)
            .ok_or_else(|| Error::not_found(keys::LEADER_PREFIX))?;
        into_string(&leader.key, leader.value)
    }
}

//! [`KvBackend`] over a real etcd cluster

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, CompareOp, ConnectOptions, EventType, GetOptions, Identity, PutOptions,
    SortOrder, SortTarget, TlsOptions, WatchOptions,
};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use kestrel_common::config::EngineConfig;
use kestrel_common::{Error, Result};

use crate::kv::{
    Compare, KeyValue, KvBackend, RangeOptions, RangeResponse, Txn, TxnOp, TxnResult, WatchEvent,
    WatchEventKind,
};

/// Client TLS material for etcd
#[derive(Clone)]
pub struct EtcdTls {
    /// PEM CA certificate
    pub ca: String,
    /// PEM client certificate
    pub cert: String,
    /// PEM client private key
    pub key: String,
}

/// etcd v3 backend
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

/// Map an etcd client failure into [`Error::Etcd`]
pub fn etcd_err(e: etcd_client::Error) -> Error {
    Error::etcd(e.to_string())
}

fn to_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
        create_revision: kv.create_revision(),
    }
}

impl EtcdKv {
    /// Connect to the given endpoints
    pub async fn connect(endpoints: &[String], tls: Option<EtcdTls>) -> Result<Self> {
        let mut options = ConnectOptions::new();
        if let Some(tls) = tls {
            options = options.with_tls(
                TlsOptions::new()
                    .ca_certificate(Certificate::from_pem(tls.ca))
                    .identity(Identity::from_pem(tls.cert, tls.key)),
            );
        }
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(etcd_err)?;
        debug!(endpoints = ?endpoints, "connected to etcd");
        Ok(Self { client })
    }

    /// Connect to the engine's own state store named by `config`
    pub async fn from_config(config: &EngineConfig, tls: Option<EtcdTls>) -> Result<Self> {
        if config.storage_endpoints.is_empty() {
            return Err(Error::validation("no storage endpoints configured"));
        }
        Self::connect(&config.storage_endpoints, tls).await
    }

    /// The underlying client, for member management
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn to_compare(compare: Compare) -> etcd_client::Compare {
    match compare {
        Compare::Exists(key) => etcd_client::Compare::version(key, CompareOp::Greater, 0),
        Compare::Absent(key) => etcd_client::Compare::version(key, CompareOp::Equal, 0),
        Compare::Value(key, value) => etcd_client::Compare::value(key, CompareOp::Equal, value),
        Compare::ModRevision(key, rev) => {
            etcd_client::Compare::mod_revision(key, CompareOp::Equal, rev)
        }
    }
}

fn to_op(op: TxnOp) -> etcd_client::TxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            etcd_client::TxnOp::put(key, value, options)
        }
        TxnOp::Delete { key } => etcd_client::TxnOp::delete(key, None),
    }
}

#[async_trait]
impl KvBackend for EtcdKv {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(etcd_err)?;
        Ok(resp.kvs().first().map(to_kv))
    }

    async fn range(&self, prefix: &str, options: RangeOptions) -> Result<RangeResponse> {
        let order = if options.descending {
            SortOrder::Descend
        } else {
            SortOrder::Ascend
        };
        let mut get = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, order);
        if options.limit > 0 {
            get = get.with_limit(options.limit as i64);
        }
        if options.keys_only {
            get = get.with_keys_only();
        }

        let mut client = self.client.clone();
        let resp = client.get(prefix, Some(get)).await.map_err(etcd_err)?;
        Ok(RangeResponse {
            kvs: resp.kvs().iter().map(to_kv).collect(),
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        let request = etcd_client::Txn::new()
            .when(txn.compares.into_iter().map(to_compare).collect::<Vec<_>>())
            .and_then(txn.ops.into_iter().map(to_op).collect::<Vec<_>>());

        let mut client = self.client.clone();
        let resp = client.txn(request).await.map_err(etcd_err)?;
        Ok(TxnResult {
            succeeded: resp.succeeded(),
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn grant_lease(&self, ttl: i64) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await.map_err(etcd_err)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: i64) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease).await.map_err(etcd_err)?;
        keeper.keep_alive().await.map_err(etcd_err)?;
        match responses.message().await.map_err(etcd_err)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(Error::etcd(format!("lease {lease:x} expired"))),
        }
    }

    async fn revoke_lease(&self, lease: i64) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await.map_err(etcd_err)?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, watch_stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(etcd_err)?;

        // The watcher must outlive the stream or etcd cancels the watch.
        let responses = stream::unfold(
            (watcher, watch_stream),
            |(watcher, mut watch_stream)| async move {
                match watch_stream.message().await {
                    Ok(Some(resp)) => Some((Ok(resp), (watcher, watch_stream))),
                    Ok(None) => None,
                    Err(e) => Some((Err(etcd_err(e)), (watcher, watch_stream))),
                }
            },
        );

        let events = responses.flat_map(|resp| {
            let items: Vec<Result<WatchEvent>> = match resp {
                Ok(resp) => resp
                    .events()
                    .iter()
                    .filter_map(|event| {
                        let kind = match event.event_type() {
                            EventType::Put => WatchEventKind::Put,
                            EventType::Delete => WatchEventKind::Delete,
                        };
                        event.kv().map(|kv| {
                            Ok(WatchEvent {
                                kind,
                                kv: to_kv(kv),
                            })
                        })
                    })
                    .collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        });

        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_storage_endpoints_are_rejected_before_connecting() {
        let config = EngineConfig {
            storage_endpoints: vec![],
            ..EngineConfig::default()
        };
        let err = EtcdKv::from_config(&config, None).await.err().unwrap();
        assert!(matches!(err, Error::Validation { .. }));
    }
}

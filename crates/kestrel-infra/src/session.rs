//! Process-lifetime state shared by every tick
//!
//! A [`Session`] is built once per process. It owns the logged-in secrets
//! client, the [`Pki`] with its record of ensured roles, and the caches of
//! short-lived admin certificates. [`Infrastructure`] is rebuilt every tick
//! and borrows all of these from the session.
//!
//! [`Infrastructure`]: crate::Infrastructure

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use kestrel_common::config::EngineConfig;
use kestrel_common::Result;
use kestrel_pki::{IssuedCertificate, Pki, SecretsBackend, VaultClient};
use kestrel_storage::Storage;

/// Single-entry certificate cache
///
/// The cached certificate is handed out until `lifetime` has elapsed since
/// it was issued, then reissued on the next request.
pub struct CertCache {
    lifetime: Duration,
    entry: RwLock<Option<(Instant, IssuedCertificate)>>,
}

impl CertCache {
    /// Empty cache reusing entries for `lifetime`
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            entry: RwLock::new(None),
        }
    }

    fn fresh(&self) -> Option<IssuedCertificate> {
        self.entry
            .read()
            .as_ref()
            .filter(|(issued_at, _)| issued_at.elapsed() < self.lifetime)
            .map(|(_, cert)| cert.clone())
    }

    /// Return the cached certificate or issue a new one with `issue`
    pub async fn get_or_issue<F, Fut>(&self, issue: F) -> Result<IssuedCertificate>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IssuedCertificate>>,
    {
        if let Some(cert) = self.fresh() {
            return Ok(cert);
        }
        let cert = issue().await?;
        debug!("issued admin certificate, caching for {:?}", self.lifetime);
        *self.entry.write() = Some((Instant::now(), cert.clone()));
        Ok(cert)
    }

    /// Drop the cached entry
    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }
}

/// Long-lived state of one engine process
pub struct Session {
    config: EngineConfig,
    secrets: OnceCell<Arc<dyn SecretsBackend>>,
    pki: OnceCell<Arc<Pki>>,
    admin_kube_cert: CertCache,
    admin_etcd_cert: CertCache,
}

impl Session {
    /// New session; the secrets client is created on first use
    pub fn new(config: EngineConfig) -> Self {
        let lifetime = config.admin_cert_lifetime;
        Self {
            config,
            secrets: OnceCell::new(),
            pki: OnceCell::new(),
            admin_kube_cert: CertCache::new(lifetime),
            admin_etcd_cert: CertCache::new(lifetime),
        }
    }

    /// Session with a ready secrets backend instead of logging in
    pub fn with_secrets(config: EngineConfig, secrets: Arc<dyn SecretsBackend>) -> Self {
        let session = Self::new(config);
        let _ = session.secrets.set(secrets);
        session
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The secrets client, logging in with the stored config on first use
    pub async fn secrets(&self, storage: &Storage) -> Result<Arc<dyn SecretsBackend>> {
        self.secrets
            .get_or_try_init(|| async {
                let vault = storage.get_vault_config().await?;
                let client = VaultClient::login(&vault).await?;
                info!(endpoint = %vault.endpoint, "logged in to secrets backend");
                Ok::<Arc<dyn SecretsBackend>, kestrel_common::Error>(client)
            })
            .await
            .cloned()
    }

    /// The certificate authorities
    pub async fn pki(&self, storage: &Storage) -> Result<Arc<Pki>> {
        self.pki
            .get_or_try_init(|| async {
                let secrets = self.secrets(storage).await?;
                Ok::<_, kestrel_common::Error>(Arc::new(Pki::new(secrets)))
            })
            .await
            .cloned()
    }

    /// Cache of the Kubernetes cluster-admin client certificate
    pub fn admin_kube_cert(&self) -> &CertCache {
        &self.admin_kube_cert
    }

    /// Cache of the etcd root client certificate
    pub fn admin_etcd_cert(&self) -> &CertCache {
        &self.admin_etcd_cert
    }
}

//! Commanders that bring stored configuration up to date

use async_trait::async_trait;
use tracing::info;

use kestrel_common::{Command, Result, CONFIG_VERSION};
use kestrel_infra::Infrastructure;
use kestrel_pki::{generate_service_account_key, CaKind};

use crate::operator::Commander;

/// Mount a CA in the secrets backend and store its root certificate
#[derive(Debug)]
pub struct InitializeCa {
    /// CA to initialize
    pub ca: CaKind,
}

#[async_trait]
impl Commander for InitializeCa {
    fn command(&self) -> Command {
        Command::new("ca-init", self.ca.name())
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let pem = infra.pki().initialize_ca(self.ca).await?;
        infra
            .storage()
            .put_ca_certificate(infra.leader_key(), self.ca.name(), &pem)
            .await?;
        info!(ca = %self.ca, "certificate authority initialized");
        Ok(())
    }
}

/// Generate and store the service-account signing key pair
#[derive(Debug)]
pub struct GenerateServiceAccountKey;

#[async_trait]
impl Commander for GenerateServiceAccountKey {
    fn command(&self) -> Command {
        Command::new("service-account-key", "")
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let (cert, key) = generate_service_account_key()?;
        infra
            .storage()
            .put_service_account_data(infra.leader_key(), &cert, &key)
            .await
    }
}

/// Record that stored configuration matches this build
#[derive(Debug)]
pub struct SetConfigVersion;

#[async_trait]
impl Commander for SetConfigVersion {
    fn command(&self) -> Command {
        Command::new("config-version", CONFIG_VERSION)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        infra
            .storage()
            .put_config_version(infra.leader_key(), CONFIG_VERSION)
            .await
    }
}

/// Mark etcd bootstrap as finished
#[derive(Debug)]
pub struct MarkEtcdBootstrapped;

#[async_trait]
impl Commander for MarkEtcdBootstrapped {
    fn command(&self) -> Command {
        Command::new("etcd-mark-bootstrapped", "")
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        infra
            .storage()
            .set_etcd_bootstrapped(infra.leader_key())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cluster, Fixture};

    #[tokio::test]
    async fn ca_init_stores_root_certificate() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        let infra = fx.infra(&c);

        InitializeCa { ca: CaKind::EtcdPeer }.run(&infra).await.unwrap();
        assert_eq!(
            fx.storage.get_ca_certificate("etcd-peer").await.unwrap(),
            "ROOT kestrel/ca-etcd-peer"
        );
    }

    #[tokio::test]
    async fn markers_are_written_under_leadership() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        let infra = fx.infra(&c);

        SetConfigVersion.run(&infra).await.unwrap();
        MarkEtcdBootstrapped.run(&infra).await.unwrap();
        assert_eq!(
            fx.storage.get_config_version().await.unwrap().as_deref(),
            Some(CONFIG_VERSION)
        );
        assert!(fx.storage.is_etcd_bootstrapped().await.unwrap());
    }

    #[tokio::test]
    async fn writes_fail_once_leadership_is_gone() {
        let c = cluster();
        let fx = Fixture::new(&c).await;
        let infra = fx.infra(&c);
        fx.guard.resign().await.unwrap();

        let err = SetConfigVersion.run(&infra).await.unwrap_err();
        assert!(err.is_lost_leadership());
        assert_eq!(fx.storage.get_config_version().await.unwrap(), None);
    }
}

//! Connection settings for the secrets backend

use serde::{Deserialize, Serialize};

use crate::Error;

/// How to reach and authenticate against the Vault-compatible secrets backend
///
/// Stored once by an administrator; every certificate and SSH key the engine
/// uses is obtained through it.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct VaultConfig {
    /// Base URL, e.g. `https://vault.example.com:8200`
    pub endpoint: String,
    /// PEM CA certificate used to verify the endpoint; system roots when empty
    #[serde(default, rename = "ca-cert")]
    pub ca_cert: String,
    /// AppRole role ID
    #[serde(rename = "role-id")]
    pub role_id: String,
    /// AppRole secret ID
    #[serde(rename = "secret-id")]
    pub secret_id: String,
}

impl VaultConfig {
    /// Check that all required fields are present
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.endpoint.starts_with("https://") || self.endpoint.starts_with("http://")) {
            return Err(Error::validation(format!(
                "vault endpoint must be an http(s) URL, got {:?}",
                self.endpoint
            )));
        }
        if self.role_id.is_empty() {
            return Err(Error::validation("vault role-id is empty"));
        }
        if self.secret_id.is_empty() {
            return Err(Error::validation("vault secret-id is empty"));
        }
        Ok(())
    }
}

// Keep the secret ID out of logs and panics.
impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("endpoint", &self.endpoint)
            .field("role_id", &self.role_id)
            .field("secret_id", &"<redacted>")
            .finish()
    }
}

//! Vault-compatible secrets backend client
//!
//! Authenticates with AppRole and keeps the token alive from a background
//! task for the life of the client. Only the handful of endpoints the engine
//! needs are wrapped: KV reads, PKI mounts, root generation, roles and issue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kestrel_common::{Error, Result, VaultConfig};

const LOGIN_PATH: &str = "auth/approle/login";
const RENEW_PATH: &str = "auth/token/renew-self";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed policy of a PKI role
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct RolePolicy {
    /// Default TTL of issued certificates
    pub ttl: String,
    /// Maximum TTL a request may ask for
    pub max_ttl: String,
    /// Permit any common name
    pub allow_any_name: bool,
    /// Require common names and DNS SANs to be valid host names
    pub enforce_hostnames: bool,
    /// Permit IP SANs
    pub allow_ip_sans: bool,
    /// Set the serverAuth extended key usage
    pub server_flag: bool,
    /// Set the clientAuth extended key usage
    pub client_flag: bool,
    /// Organization of the subject
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,
    /// Key algorithm of generated keys
    pub key_type: String,
    /// Key size of generated keys
    pub key_bits: u32,
}

/// Parameters of one issuance
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct IssueRequest {
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    #[serde(serialize_with = "comma_list", skip_serializing_if = "Vec::is_empty")]
    pub alt_names: Vec<String>,
    /// IP subject alternative names
    #[serde(serialize_with = "comma_list", skip_serializing_if = "Vec::is_empty")]
    pub ip_sans: Vec<String>,
    /// Requested TTL; the role default when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    /// Do not add the common name to the SAN list
    pub exclude_cn_from_sans: bool,
}

fn comma_list<S: serde::Serializer>(values: &[String], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&values.join(","))
}

impl IssueRequest {
    /// Request for a common name with no SANs
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }
}

/// A signed certificate and its private key
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM leaf certificate
    pub certificate: String,
    /// PEM private key
    pub private_key: String,
    /// PEM certificate of the issuing CA
    #[serde(default)]
    pub issuing_ca: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Operations the engine performs against the secrets backend
///
/// Mount and role names are paths relative to the API root (`/v1/`).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    /// Read a KV (version 1) secret; `None` when absent
    async fn read_kv(&self, path: &str) -> Result<Option<BTreeMap<String, String>>>;

    /// Whether a role exists on a PKI mount
    async fn role_exists(&self, mount: &str, role: &str) -> Result<bool>;

    /// Create or replace a role on a PKI mount
    async fn write_role(&self, mount: &str, role: &str, policy: &RolePolicy) -> Result<()>;

    /// Issue a certificate and key from a role
    async fn issue(&self, mount: &str, role: &str, request: &IssueRequest) -> Result<IssuedCertificate>;

    /// Whether a secrets engine is mounted at `mount`
    async fn mount_exists(&self, mount: &str) -> Result<bool>;

    /// Mount the PKI secrets engine at `mount`
    async fn enable_pki(&self, mount: &str, max_ttl: &str) -> Result<()>;

    /// Generate an internal root on a PKI mount, returning its PEM certificate
    async fn generate_root(&self, mount: &str, common_name: &str, ttl: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: AuthInfo,
}

#[derive(Deserialize)]
struct AuthInfo {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

#[derive(Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct RootResponse {
    certificate: String,
}

/// AppRole-authenticated HTTP client for a Vault-compatible server
pub struct VaultClient {
    http: reqwest::Client,
    endpoint: String,
    config: VaultConfig,
    token: RwLock<String>,
    renewer: Mutex<Option<JoinHandle<()>>>,
}

impl VaultClient {
    /// Log in and start the token renewer
    pub async fn login(config: &VaultConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
        if !config.ca_cert.is_empty() {
            let ca = reqwest::Certificate::from_pem(config.ca_cert.as_bytes())
                .map_err(|e| Error::secrets("ca-cert", format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        let http = builder
            .build()
            .map_err(|e| Error::secrets("client", format!("failed to build HTTP client: {e}")))?;

        let client = Arc::new(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            config: config.clone(),
            token: RwLock::new(String::new()),
            renewer: Mutex::new(None),
        });

        let auth = client.authenticate().await?;
        info!(endpoint = %client.endpoint, renewable = auth.renewable, "logged in to secrets backend");

        if auth.renewable && auth.lease_duration > 0 {
            let weak = Arc::downgrade(&client);
            let initial = Duration::from_secs(auth.lease_duration);
            let handle = tokio::spawn(async move {
                let mut lease = initial;
                loop {
                    tokio::time::sleep((lease / 2).max(MIN_RENEW_INTERVAL)).await;
                    let Some(client) = weak.upgrade() else {
                        return;
                    };
                    lease = match client.renew().await {
                        Ok(next) => next,
                        Err(e) => {
                            warn!(error = %e, "token renewal failed, logging in again");
                            match client.authenticate().await {
                                Ok(auth) => Duration::from_secs(auth.lease_duration.max(1)),
                                Err(e) => {
                                    warn!(error = %e, "re-login failed");
                                    MIN_RENEW_INTERVAL * 2
                                }
                            }
                        }
                    };
                }
            });
            *client.renewer.lock() = Some(handle);
        }

        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.endpoint, path.trim_start_matches('/'))
    }

    async fn authenticate(&self) -> Result<AuthInfo> {
        let resp = self
            .http
            .post(self.url(LOGIN_PATH))
            .json(&json!({
                "role_id": self.config.role_id,
                "secret_id": self.config.secret_id,
            }))
            .send()
            .await
            .map_err(|e| Error::secrets(LOGIN_PATH, format!("request failed: {e}")))?;
        let resp = check_status(LOGIN_PATH, resp).await?;
        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| Error::secrets(LOGIN_PATH, format!("invalid response: {e}")))?;
        *self.token.write() = login.auth.client_token.clone();
        Ok(login.auth)
    }

    async fn renew(&self) -> Result<Duration> {
        let resp = self.request(reqwest::Method::POST, RENEW_PATH, Some(json!({}))).await?;
        let login: LoginResponse = match resp {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| Error::secrets(RENEW_PATH, format!("invalid response: {e}")))?,
            None => return Err(Error::secrets(RENEW_PATH, "empty response")),
        };
        debug!(lease_secs = login.auth.lease_duration, "renewed secrets backend token");
        Ok(Duration::from_secs(login.auth.lease_duration.max(1)))
    }

    /// Send an authenticated request; `Ok(None)` for 404 and empty bodies
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let token = self.token.read().clone();
        let mut req = self
            .http
            .request(method, self.url(path))
            .header("X-Vault-Token", token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::secrets(path, format!("request failed: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(path, resp).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| Error::secrets(path, format!("failed to read body: {e}")))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::secrets(path, format!("invalid JSON: {e}")))
    }
}

impl Drop for VaultClient {
    fn drop(&mut self) {
        if let Some(handle) = self.renewer.lock().take() {
            handle.abort();
        }
    }
}

async fn check_status(path: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::secrets(path, format!("HTTP {status}: {body}")))
}

fn data<T: serde::de::DeserializeOwned>(path: &str, value: Value) -> Result<T> {
    serde_json::from_value::<DataResponse<T>>(value)
        .map(|r| r.data)
        .map_err(|e| Error::secrets(path, format!("unexpected response: {e}")))
}

#[async_trait]
impl SecretsBackend for VaultClient {
    async fn read_kv(&self, path: &str) -> Result<Option<BTreeMap<String, String>>> {
        match self.request(reqwest::Method::GET, path, None).await? {
            Some(v) => data(path, v).map(Some),
            None => Ok(None),
        }
    }

    async fn role_exists(&self, mount: &str, role: &str) -> Result<bool> {
        let path = format!("{mount}/roles/{role}");
        Ok(self
            .request(reqwest::Method::GET, &path, None)
            .await?
            .is_some())
    }

    async fn write_role(&self, mount: &str, role: &str, policy: &RolePolicy) -> Result<()> {
        let path = format!("{mount}/roles/{role}");
        let body = serde_json::to_value(policy)?;
        self.request(reqwest::Method::POST, &path, Some(body)).await?;
        info!(mount = %mount, role = %role, "created PKI role");
        Ok(())
    }

    async fn issue(&self, mount: &str, role: &str, request: &IssueRequest) -> Result<IssuedCertificate> {
        let path = format!("{mount}/issue/{role}");
        let body = serde_json::to_value(request)?;
        let resp = self
            .request(reqwest::Method::POST, &path, Some(body))
            .await?
            .ok_or_else(|| Error::secrets(&path, "role or mount not found"))?;
        debug!(mount = %mount, role = %role, cn = %request.common_name, "issued certificate");
        data(&path, resp)
    }

    async fn mount_exists(&self, mount: &str) -> Result<bool> {
        let mounts = self
            .request(reqwest::Method::GET, "sys/mounts", None)
            .await?
            .unwrap_or_default();
        // Newer servers nest the table under "data".
        let table = mounts.get("data").unwrap_or(&mounts);
        Ok(table.get(format!("{mount}/")).is_some())
    }

    async fn enable_pki(&self, mount: &str, max_ttl: &str) -> Result<()> {
        let path = format!("sys/mounts/{mount}");
        let body = json!({
            "type": "pki",
            "config": { "max_lease_ttl": max_ttl },
        });
        self.request(reqwest::Method::POST, &path, Some(body)).await?;
        info!(mount = %mount, "mounted PKI secrets engine");
        Ok(())
    }

    async fn generate_root(&self, mount: &str, common_name: &str, ttl: &str) -> Result<String> {
        let path = format!("{mount}/root/generate/internal");
        let body = json!({
            "common_name": common_name,
            "ttl": ttl,
            "format": "pem",
        });
        let resp = self
            .request(reqwest::Method::POST, &path, Some(body))
            .await?
            .ok_or_else(|| Error::secrets(&path, "empty response"))?;
        let root: RootResponse = data(&path, resp)?;
        Ok(root.certificate)
    }
}

//! Engine configuration
//!
//! Tunables have compiled-in defaults and can be overridden through
//! `KESTREL_*` environment variables. Environment access goes through the
//! [`EnvConfig`] trait so tests never touch process-global state.

use std::time::Duration;

use crate::Error;

/// Default retention cap for the operation record log
pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// Default number of records replayed before a record watch turns live
pub const DEFAULT_WATCH_REPLAY: usize = 10;

/// Trait for reading configuration from the environment
#[cfg_attr(test, mockall::automock)]
pub trait EnvConfig: Send + Sync {
    /// Look up a variable by name
    fn var(&self, name: &str) -> Option<String>;
}

/// Default implementation that reads process environment variables
#[derive(Clone, Default)]
pub struct OsEnvConfig;

impl EnvConfig for OsEnvConfig {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Tunables for one engine process
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Prefix under which every storage key lives (ends with '/')
    pub key_prefix: String,
    /// Endpoints of the etcd cluster holding engine state
    pub storage_endpoints: Vec<String>,
    /// Interval between ticks
    pub tick_interval: Duration,
    /// Ceiling applied to remote commands without an explicit timeout
    pub command_timeout: Duration,
    /// Timeout for establishing the SSH transport
    pub ssh_connect_timeout: Duration,
    /// Retention cap for the record log
    pub max_records: usize,
    /// Number of records replayed before a watch turns live
    pub watch_replay: usize,
    /// How long an issued admin client certificate is reused
    pub admin_cert_lifetime: Duration,
    /// TTL (seconds) of the lease bound to the leader key
    pub leader_lease_ttl: i64,
    /// Secure port of kube-apiserver
    pub apiserver_port: u16,
    /// Local port where rivers proxies to the API servers
    pub rivers_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: "/kestrel/".to_string(),
            storage_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            tick_interval: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            ssh_connect_timeout: Duration::from_secs(10),
            max_records: DEFAULT_MAX_RECORDS,
            watch_replay: DEFAULT_WATCH_REPLAY,
            admin_cert_lifetime: Duration::from_secs(3600),
            leader_lease_ttl: 60,
            apiserver_port: 6443,
            rivers_port: 16443,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overlaid with environment variables
    pub fn from_env(env: &dyn EnvConfig) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(prefix) = env.var("KESTREL_PREFIX") {
            config.key_prefix = normalize_prefix(&prefix)?;
        }
        if let Some(endpoints) = env.var("KESTREL_ETCD_ENDPOINTS") {
            let parsed: Vec<String> = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if parsed.is_empty() {
                return Err(Error::validation("KESTREL_ETCD_ENDPOINTS is empty"));
            }
            config.storage_endpoints = parsed;
        }
        if let Some(v) = env.var("KESTREL_TICK_INTERVAL_SECS") {
            config.tick_interval = Duration::from_secs(parse_number(&v, "KESTREL_TICK_INTERVAL_SECS")?);
        }
        if let Some(v) = env.var("KESTREL_COMMAND_TIMEOUT_SECS") {
            config.command_timeout =
                Duration::from_secs(parse_number(&v, "KESTREL_COMMAND_TIMEOUT_SECS")?);
        }
        if let Some(v) = env.var("KESTREL_MAX_RECORDS") {
            let cap = parse_number(&v, "KESTREL_MAX_RECORDS")?;
            if cap == 0 {
                return Err(Error::validation("KESTREL_MAX_RECORDS must be positive"));
            }
            config.max_records = cap as usize;
        }
        if let Some(v) = env.var("KESTREL_WATCH_REPLAY") {
            config.watch_replay = parse_number(&v, "KESTREL_WATCH_REPLAY")? as usize;
        }
        if let Some(v) = env.var("KESTREL_LEADER_LEASE_TTL") {
            config.leader_lease_ttl = parse_number(&v, "KESTREL_LEADER_LEASE_TTL")? as i64;
        }

        Ok(config)
    }
}

fn normalize_prefix(prefix: &str) -> Result<String, Error> {
    if !prefix.starts_with('/') {
        return Err(Error::validation(format!(
            "KESTREL_PREFIX must be absolute, got {prefix:?}"
        )));
    }
    if prefix.ends_with('/') {
        Ok(prefix.to_string())
    } else {
        Ok(format!("{prefix}/"))
    }
}

fn parse_number(value: &str, name: &str) -> Result<u64, Error> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::validation(format!("{name}: invalid number {value:?}: {e}")))
}

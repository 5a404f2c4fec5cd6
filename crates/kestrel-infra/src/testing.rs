//! In-process fakes for the agent and secrets seams
//!
//! These are shared with downstream crates' tests, which cannot see the
//! `mockall` mocks generated under `cfg(test)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use kestrel_common::Result;
use kestrel_pki::{IssueRequest, IssuedCertificate, RolePolicy, SecretsBackend};

use crate::agent::{Agent, CommandOutput};

type Responder = dyn Fn(&str) -> Result<CommandOutput> + Send + Sync;

/// Agent that records commands and answers them with a responder
pub struct RecordingAgent {
    commands: Mutex<Vec<String>>,
    inputs: Mutex<Vec<(String, usize)>>,
    responder: Box<Responder>,
}

impl Default for RecordingAgent {
    fn default() -> Self {
        Self::with_responder(|_| Ok(CommandOutput::default()))
    }
}

impl RecordingAgent {
    /// Agent answering every command with `responder`
    pub fn with_responder(
        responder: impl Fn(&str) -> Result<CommandOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Every command run so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Commands that received stdin, with the input length
    pub fn inputs(&self) -> Vec<(String, usize)> {
        self.inputs.lock().clone()
    }

    fn answer(&self, command: &str) -> Result<CommandOutput> {
        self.commands.lock().push(command.to_string());
        (self.responder)(command)
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.answer(command)
    }

    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<CommandOutput> {
        self.inputs.lock().push((command.to_string(), input.len()));
        self.answer(command)
    }

    async fn run_with_timeout(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.answer(command)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Secrets backend issuing placeholder certificates
#[derive(Default)]
pub struct StaticSecrets {
    kv: BTreeMap<String, BTreeMap<String, String>>,
    issued: Mutex<Vec<(String, String)>>,
    roles: Mutex<Vec<(String, String)>>,
}

impl StaticSecrets {
    /// Backend holding one KV secret
    pub fn with_kv(path: &str, data: BTreeMap<String, String>) -> Self {
        let mut kv = BTreeMap::new();
        kv.insert(path.to_string(), data);
        Self {
            kv,
            ..Default::default()
        }
    }

    /// `(mount, common name)` of every issued certificate
    pub fn issued(&self) -> Vec<(String, String)> {
        self.issued.lock().clone()
    }

    /// `(mount, role)` of every role written
    pub fn roles(&self) -> Vec<(String, String)> {
        self.roles.lock().clone()
    }

    /// Shared handle
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl SecretsBackend for StaticSecrets {
    async fn read_kv(&self, path: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.kv.get(path).cloned())
    }

    async fn role_exists(&self, mount: &str, role: &str) -> Result<bool> {
        Ok(self
            .roles
            .lock()
            .iter()
            .any(|(m, r)| m == mount && r == role))
    }

    async fn write_role(&self, mount: &str, role: &str, _policy: &RolePolicy) -> Result<()> {
        self.roles.lock().push((mount.to_string(), role.to_string()));
        Ok(())
    }

    async fn issue(
        &self,
        mount: &str,
        _role: &str,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate> {
        self.issued
            .lock()
            .push((mount.to_string(), request.common_name.clone()));
        Ok(IssuedCertificate {
            certificate: format!("CERT {}", request.common_name),
            private_key: format!("KEY {}", request.common_name),
            issuing_ca: format!("CA {mount}"),
        })
    }

    async fn mount_exists(&self, _mount: &str) -> Result<bool> {
        Ok(true)
    }

    async fn enable_pki(&self, _mount: &str, _max_ttl: &str) -> Result<()> {
        Ok(())
    }

    async fn generate_root(&self, mount: &str, _common_name: &str, _ttl: &str) -> Result<String> {
        Ok(format!("ROOT {mount}"))
    }
}

//! Container engine driven through an [`Agent`]
//!
//! System containers are recreated whenever their image or parameters drift.
//! The parameters a container was started with are written to a small JSON
//! record under [`NODE_PARAMS_DIR`] by the same remote invocation that starts
//! the container, and read back by [`ContainerEngine::inspect`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kestrel_common::retry::{retry_with_backoff, RetryConfig};
use kestrel_common::{Error, Result, ServiceParams, ServiceStatus, NODE_PARAMS_DIR};

use crate::agent::Agent;

/// Attempts for the batched inspect call
const INSPECT_ATTEMPTS: u32 = 3;

/// A long-lived container to (re)create
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SystemContainer {
    /// Container name, also the service name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Parameters the engine always passes
    pub built_in: ServiceParams,
    /// Administrator-supplied parameters from the cluster options
    pub extra: ServiceParams,
    /// Run privileged in the host PID namespace
    pub privileged: bool,
}

/// Parameters a running system container was started with
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ParamsRecord {
    /// Image the container was started from
    pub image: String,
    /// Built-in parameters
    #[serde(default)]
    pub built_in_params: ServiceParams,
    /// Extra parameters
    #[serde(default)]
    pub extra_params: ServiceParams,
}

/// Docker-compatible engine on one node
#[derive(Clone)]
pub struct ContainerEngine {
    agent: Arc<dyn Agent>,
    node: String,
    retry: RetryConfig,
}

fn params_path(name: &str) -> String {
    format!("{NODE_PARAMS_DIR}/{name}.json")
}

fn quote(s: &str) -> String {
    shell_words::quote(s).into_owned()
}

impl ContainerEngine {
    /// Engine on the node reached by `agent`
    pub fn new(agent: Arc<dyn Agent>, node: impl Into<String>) -> Self {
        Self {
            agent,
            node: node.into(),
            retry: RetryConfig::with_max_attempts(INSPECT_ATTEMPTS),
        }
    }

    /// Override the backoff used by [`ContainerEngine::inspect`]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Pull `image` unless a local image with that name already exists
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        let inspect = format!("docker image inspect --format '{{{{.Id}}}}' {}", quote(image));
        match self.agent.run(&inspect).await {
            Ok(_) => {
                debug!(node = %self.node, image = %image, "image already present");
                return Ok(());
            }
            Err(Error::CommandFailed { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(node = %self.node, image = %image, "pulling image");
        self.agent
            .run(&format!("docker pull {}", quote(image)))
            .await
            .map(|_| ())
    }

    /// Replace any same-named container with a fresh one started from `spec`
    pub async fn run_system(&self, spec: &SystemContainer) -> Result<()> {
        let record = serde_json::to_string(&ParamsRecord {
            image: spec.image.clone(),
            built_in_params: spec.built_in.clone(),
            extra_params: spec.extra.clone(),
        })?;

        let mut run = vec![
            "docker".to_string(),
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--network=host".to_string(),
            "--restart=unless-stopped".to_string(),
        ];
        if spec.privileged {
            run.push("--privileged".to_string());
            run.push("--pid=host".to_string());
        }
        for bind in spec.built_in.extra_binds.iter().chain(&spec.extra.extra_binds) {
            run.push("-v".to_string());
            run.push(bind.to_volume_arg());
        }
        let mut env = spec.built_in.extra_env.clone();
        env.extend(spec.extra.extra_env.clone());
        for (key, value) in &env {
            run.push("-e".to_string());
            run.push(format!("{key}={value}"));
        }
        run.push(spec.image.clone());
        run.extend(spec.built_in.extra_args.iter().cloned());
        run.extend(spec.extra.extra_args.iter().cloned());

        let command = format!(
            "docker rm -f {name} >/dev/null 2>&1; mkdir -p {dir} && printf '%s\\n' {record} > {path} && {run}",
            name = quote(&spec.name),
            dir = quote(NODE_PARAMS_DIR),
            record = quote(&record),
            path = quote(&params_path(&spec.name)),
            run = shell_words::join(&run),
        );

        info!(node = %self.node, container = %spec.name, image = %spec.image, "starting system container");
        self.agent.run(&command).await.map(|_| ())
    }

    /// Remove a system container and its parameter record; absent is fine
    pub async fn stop(&self, name: &str) -> Result<()> {
        info!(node = %self.node, container = %name, "stopping system container");
        let command = format!(
            "docker rm -f {} >/dev/null 2>&1 || true; rm -f {}",
            quote(name),
            quote(&params_path(name))
        );
        self.agent.run(&command).await.map(|_| ())
    }

    /// Create a named volume
    pub async fn volume_create(&self, name: &str) -> Result<()> {
        self.agent
            .run(&format!("docker volume create {}", quote(name)))
            .await
            .map(|_| ())
    }

    /// Remove a named volume if it exists
    pub async fn volume_remove(&self, name: &str) -> Result<()> {
        warn!(node = %self.node, volume = %name, "removing volume");
        self.agent
            .run(&format!("docker volume rm -f {}", quote(name)))
            .await
            .map(|_| ())
    }

    /// Whether a named volume exists
    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self
            .agent
            .run(&format!("docker volume inspect {} >/dev/null", quote(name)))
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// State of the named containers, batched into one remote call
    ///
    /// Containers that do not exist are absent from the result. A container
    /// removed between listing and inspection fails the call, which is retried.
    pub async fn inspect(&self, names: &[&str]) -> Result<BTreeMap<String, ServiceStatus>> {
        if names.is_empty() {
            return Ok(BTreeMap::new());
        }
        let script = inspect_script(names);
        let agent = &self.agent;
        let script = script.as_str();
        let output =
            retry_with_backoff(&self.retry, "container inspect", move || agent.run(script)).await?;
        Ok(parse_inspect(&output.stdout))
    }
}

fn inspect_script(names: &[&str]) -> String {
    format!(
        "set -e; names=$(docker ps -a --format '{{{{.Names}}}}'); \
         for n in {list}; do \
           if printf '%s\\n' \"$names\" | grep -qx \"$n\"; then \
             state=$(docker inspect --format '{{{{.State.Running}}}} {{{{.Config.Image}}}}' \"$n\"); \
           else state='false -'; fi; \
           params=$(cat {dir}/\"$n\".json 2>/dev/null || echo '{{}}'); \
           echo \"$n $state $params\"; \
         done",
        list = shell_words::join(names),
        dir = quote(NODE_PARAMS_DIR),
    )
}

fn parse_inspect(stdout: &str) -> BTreeMap<String, ServiceStatus> {
    let mut services = BTreeMap::new();
    for line in stdout.lines() {
        let mut fields = line.splitn(4, ' ');
        let (Some(name), Some(running), Some(image)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if image == "-" {
            continue;
        }
        let record: ParamsRecord = fields
            .next()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();
        services.insert(
            name.to_string(),
            ServiceStatus {
                running: running == "true",
                image: image.to_string(),
                built_in_params: record.built_in_params,
                extra_params: record.extra_params,
            },
        );
    }
    services
}

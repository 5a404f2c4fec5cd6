//! Remote command execution on one node
//!
//! [`SshAgent`] multiplexes every command over a single SSH control master
//! established at construction, so a failed connection surfaces before any
//! work is attempted. Nothing here retries: a failed command fails the step
//! that issued it and the step is attempted again on the next tick.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use kestrel_common::{Error, Node, Result};

#[cfg(test)]
use mockall::automock;

/// Exit status ssh itself uses for connection failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Captured output of a successful remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

/// Runs shell commands on one remote node
///
/// A non-zero exit status is reported as [`Error::CommandFailed`] carrying
/// stderr; exceeding the deadline as [`Error::Timeout`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run under the default execution ceiling
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Run with `input` streamed to stdin; the input is never logged
    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<CommandOutput>;

    /// Run with an explicit deadline
    async fn run_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Release the transport
    async fn close(&self) -> Result<()>;
}

/// [`Agent`] over the system `ssh` binary
pub struct SshAgent {
    address: String,
    destination: String,
    control_path: PathBuf,
    command_timeout: Duration,
    // Holds the private key and control socket; removed on drop
    _workdir: TempDir,
}

impl SshAgent {
    /// Authenticate to `node` with `private_key` and start the control master
    pub async fn connect(
        node: &Node,
        private_key: &str,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        let address = node.address.clone();
        let workdir = tempfile::Builder::new()
            .prefix("kestrel-ssh-")
            .tempdir()
            .map_err(|e| Error::transport(&address, format!("failed to create work dir: {e}")))?;

        let key_path = workdir.path().join("id");
        write_private_key(&key_path, private_key)
            .await
            .map_err(|e| Error::transport(&address, format!("failed to write private key: {e}")))?;

        let control_path = workdir.path().join("control");
        let destination = format!("{}@{}", node.user, node.address);

        let mut cmd = Command::new("ssh");
        cmd.arg("-M")
            .arg("-S")
            .arg(&control_path)
            .arg("-fN")
            .arg("-i")
            .arg(&key_path)
            .args(common_options(connect_timeout))
            .arg("-o")
            .arg("ControlPersist=600")
            .arg(&destination)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(connect_timeout * 2, cmd.output())
            .await
            .map_err(|_| {
                warn!(node = %address, "ssh connection timed out");
                Error::Timeout {
                    node: address.clone(),
                    timeout: connect_timeout * 2,
                }
            })?
            .map_err(|e| Error::transport(&address, format!("failed to execute ssh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(node = %address, error = %stderr, "ssh connection failed");
            return Err(Error::transport(&address, stderr));
        }

        debug!(node = %address, user = %node.user, "ssh control master established");
        Ok(Self {
            address,
            destination,
            control_path,
            command_timeout,
            _workdir: workdir,
        })
    }

    /// Address of the node this agent talks to
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn execute(
        &self,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let program = command.split_whitespace().next().unwrap_or_default();
        debug!(
            node = %self.address,
            program = %program,
            input_bytes = input.map(<[u8]>::len).unwrap_or(0),
            "running remote command"
        );

        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.control_path)
            .args(["-o", "BatchMode=yes"])
            .arg(&self.destination)
            .arg("--")
            .arg(command);
        run_process(&self.address, program, cmd, input, timeout).await
    }
}

/// Run `cmd` to completion under `timeout`, mapping its exit status the way
/// ssh reports remote results
async fn run_process(
    address: &str,
    program: &str,
    mut cmd: Command,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::transport(address, format!("failed to execute ssh: {e}")))?;
    let stdin = child.stdin.take();

    let run = async move {
        if let (Some(data), Some(mut stdin)) = (input, stdin) {
            stdin.write_all(data).await?;
            stdin.shutdown().await?;
        }
        child.wait_with_output().await
    };

    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| {
            warn!(node = %address, program = %program, "remote command timed out after {:?}", timeout);
            Error::Timeout {
                node: address.to_string(),
                timeout,
            }
        })?
        .map_err(|e| Error::transport(address, format!("ssh i/o failed: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    match output.status.code() {
        Some(0) => Ok(CommandOutput { stdout, stderr }),
        Some(SSH_TRANSPORT_FAILURE) => Err(Error::transport(address, stderr.trim())),
        code => {
            debug!(node = %address, program = %program, code = ?code, "remote command failed");
            Err(Error::CommandFailed {
                node: address.to_string(),
                code,
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Agent for SshAgent {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.execute(command, None, self.command_timeout).await
    }

    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<CommandOutput> {
        self.execute(command, Some(input), self.command_timeout).await
    }

    async fn run_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.execute(command, None, timeout).await
    }

    async fn close(&self) -> Result<()> {
        let output = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::transport(&self.address, format!("failed to execute ssh: {e}")))?;
        if !output.status.success() {
            debug!(
                node = %self.address,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "control master already gone"
            );
        }
        Ok(())
    }
}

fn common_options(connect_timeout: Duration) -> Vec<String> {
    [
        "BatchMode=yes".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "LogLevel=ERROR".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "ServerAliveInterval=15".to_string(),
    ]
    .into_iter()
    .flat_map(|opt| ["-o".to_string(), opt])
    .collect()
}

async fn write_private_key(path: &Path, key: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut contents = key.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

/// Atomically write `data` to `path` on the node with the given file mode
///
/// Parent directories are created as needed. The data travels over stdin.
pub async fn install_file(agent: &dyn Agent, path: &str, data: &[u8], mode: u32) -> Result<()> {
    let dir = Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    let tmp = format!("{path}.tmp");
    let command = format!(
        "mkdir -p {dir} && cat > {tmp} && chmod {mode:o} {tmp} && mv -f {tmp} {path}",
        dir = shell_words::quote(&dir),
        tmp = shell_words::quote(&tmp),
        path = shell_words::quote(path),
    );
    agent.run_with_input(&command, data).await.map(|_| ())
}

/// Remove files on the node, ignoring ones that do not exist
pub async fn remove_files(agent: &dyn Agent, paths: &[&str]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let command = format!("rm -f {}", shell_words::join(paths));
    agent.run(&command).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_file_streams_data_over_stdin() {
        let mut agent = MockAgent::new();
        agent
            .expect_run_with_input()
            .withf(|cmd, input| {
                cmd.to_string() == "mkdir -p /etc/kestrel/etcd && cat > /etc/kestrel/etcd/server.key.tmp \
                        && chmod 600 /etc/kestrel/etcd/server.key.tmp \
                        && mv -f /etc/kestrel/etcd/server.key.tmp /etc/kestrel/etcd/server.key"
                    && input.to_vec() == b"secret"
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::default()));

        install_file(&agent, "/etc/kestrel/etcd/server.key", b"secret", 0o600)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn install_file_quotes_unusual_paths() {
        let mut agent = MockAgent::new();
        agent
            .expect_run_with_input()
            .withf(|cmd, _| cmd.contains("'/tmp/a dir'") && cmd.ends_with("'/tmp/a dir/f'"))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::default()));

        install_file(&agent, "/tmp/a dir/f", b"x", 0o644).await.unwrap();
    }

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run_process("10.0.0.1", "sleep", shell("sleep 5"), None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout { ref node, timeout } if node == "10.0.0.1" && timeout == Duration::from_millis(50)
        ));
    }

    #[tokio::test]
    async fn exit_status_maps_to_failure_kind() {
        let timeout = Duration::from_secs(10);
        let err = run_process("n", "sh", shell("echo boom >&2; exit 3"), None, timeout)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CommandFailed { code: Some(3), ref stderr, .. } if stderr == "boom"
        ));

        let err = run_process("n", "sh", shell("exit 255"), None, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn input_reaches_stdin() {
        let out = run_process("n", "cat", shell("cat"), Some(b"hello"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn remove_files_skips_empty_lists() {
        let agent = MockAgent::new();
        remove_files(&agent, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn command_failures_propagate() {
        let mut agent = MockAgent::new();
        agent.expect_run().returning(|_| {
            Err(Error::CommandFailed {
                node: "10.0.0.1".to_string(),
                code: Some(1),
                stderr: "rm: permission denied".to_string(),
            })
        });

        let err = remove_files(&agent, &["/etc/kestrel/a"]).await.unwrap_err();
        assert_eq!(err.node(), Some("10.0.0.1"));
    }

    #[test]
    fn ssh_options_disable_interactive_prompts() {
        let opts = common_options(Duration::from_secs(7));
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"ConnectTimeout=7".to_string()));
        assert_eq!(opts.len() % 2, 0);
    }
}

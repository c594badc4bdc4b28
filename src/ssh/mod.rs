//! OpenSSH-backed remote shell.
//!
//! Each session owns a `ControlMaster` process bound to a private control
//! socket. Connecting starts the master and waits until it answers
//! `-O check`; running a command multiplexes over the socket and streams
//! both output channels into the executor's sink. Dropping a session kills
//! its processes and removes its socket, which is how cancelled and unused
//! preheated connections are released.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::debug;
use uuid::Uuid;

use crate::exec::{
    DEFAULT_PORT, DEFAULT_USER, ExecOptions, OutputChannel, OutputSink, RemoteShell, ShellError,
    ShellFuture, ShellSession, ShellTarget,
};
use crate::payload::expand_tilde;

/// Interval between control socket readiness checks.
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// SSH client settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "ARMADA",
    discovery(
        app_name = "armada",
        env_var = "ARMADA_CONFIG_PATH",
        config_file_name = "armada.toml",
        dotfile_name = ".armada.toml",
        project_file_name = "armada.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = DEFAULT_USER.to_owned())]
    pub ssh_user: String,
    /// Remote SSH port.
    #[ortho_config(default = DEFAULT_PORT)]
    pub ssh_port: u16,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; off by default for
    /// replaceable fleet hosts.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key used for authentication. Supports `~/` expansion; when
    /// unset SSH falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// Seconds to wait for a connection before giving up.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
}

/// Errors raised when loading or validating [`SshConfig`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SshConfigError {
    /// A field is empty or out of range.
    #[error(
        "invalid ssh configuration: {field} must be set (ARMADA_{} or {field} in armada.toml)",
        .field.to_ascii_uppercase()
    )]
    InvalidConfig {
        /// Offending field.
        field: String,
    },
    /// Parsing or merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Loads configuration from defaults, files, and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigError> {
        Self::load_from_iter([OsString::from("armada")])
            .map_err(|err| SshConfigError::Parse(err.to_string()))
    }

    /// Ensures configuration values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), SshConfigError> {
        Self::require_value(Some(&self.ssh_bin), "ssh_bin")?;
        Self::require_value(Some(&self.ssh_user), "ssh_user")?;
        Self::require_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        if self.ssh_port == 0 {
            return Err(Self::invalid("ssh_port"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Self::invalid("connect_timeout_secs"));
        }
        Ok(())
    }

    /// Execution options seeded with the configured login details.
    #[must_use]
    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity_file: self.ssh_identity_file.clone(),
            ..ExecOptions::default()
        }
    }

    fn require_value(value: Option<&str>, field: &str) -> Result<(), SshConfigError> {
        match value {
            Some(set) if set.trim().is_empty() => Err(Self::invalid(field)),
            _ => Ok(()),
        }
    }

    fn invalid(field: &str) -> SshConfigError {
        SshConfigError::InvalidConfig {
            field: field.to_owned(),
        }
    }

    fn common_ssh_options(&self, target: &ShellTarget) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(target.port.to_string())];

        if let Some(ref identity_file) = target.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.connect_timeout_secs
        )));
        args
    }

    fn master_args(&self, target: &ShellTarget, socket: &Path) -> Vec<OsString> {
        let mut args = self.common_ssh_options(target);
        args.extend([
            OsString::from("-M"),
            OsString::from("-S"),
            socket.as_os_str().to_owned(),
            OsString::from("-N"),
            OsString::from(target.destination()),
        ]);
        args
    }
}

fn control_args(socket: &Path, target: &ShellTarget, operation: &str) -> Vec<OsString> {
    vec![
        OsString::from("-S"),
        socket.as_os_str().to_owned(),
        OsString::from("-O"),
        OsString::from(operation),
        OsString::from(target.destination()),
    ]
}

fn exec_args(socket: &Path, target: &ShellTarget, command: String) -> Vec<OsString> {
    vec![
        OsString::from("-S"),
        socket.as_os_str().to_owned(),
        OsString::from(target.destination()),
        OsString::from(command),
    ]
}

/// Remote shell that drives the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshShell {
    config: Arc<SshConfig>,
}

impl SshShell {
    /// Creates a shell from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::InvalidConfig`] when validation fails.
    pub fn new(config: SshConfig) -> Result<Self, SshConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl RemoteShell for SshShell {
    type Session = SshSession;

    fn connect(&self, target: ShellTarget) -> ShellFuture<Self::Session> {
        let config = Arc::clone(&self.config);
        Box::pin(async move { open_master(config, target).await })
    }
}

/// Control socket path, removed from disk on drop.
#[derive(Debug)]
pub(crate) struct ControlSocket(PathBuf);

impl ControlSocket {
    fn fresh() -> Self {
        Self(std::env::temp_dir().join(format!("armada-{}.sock", Uuid::new_v4().simple())))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => debug!(socket = %self.0.display(), error = %err, "failed to remove control socket"),
        }
    }
}

async fn open_master(config: Arc<SshConfig>, target: ShellTarget) -> Result<SshSession, ShellError> {
    let socket = ControlSocket::fresh();
    debug!(host = %target.host, socket = %socket.path().display(), "starting ssh control master");

    let mut master = Command::new(&config.ssh_bin)
        .args(config.master_args(&target, socket.path()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| spawn_error(&config.ssh_bin, &err))?;
    let stderr = collect_stderr(master.stderr.take());

    let deadline = Instant::now() + Duration::from_secs(config.connect_timeout_secs.saturating_add(5));
    loop {
        let exited = master.try_wait().map_err(|err| ShellError::Connect {
            host: target.host.clone(),
            message: err.to_string(),
        })?;
        if let Some(status) = exited {
            let collected = stderr.await.unwrap_or_default();
            let message = if collected.is_empty() {
                format!("ssh exited with {status}")
            } else {
                collected
            };
            return Err(ShellError::Connect {
                host: target.host,
                message,
            });
        }

        if control(&config, socket.path(), &target, "check").await? {
            debug!(host = %target.host, "ssh control master ready");
            return Ok(SshSession {
                config,
                target,
                socket,
                master,
            });
        }

        if Instant::now() >= deadline {
            stderr.abort();
            return Err(ShellError::Connect {
                host: target.host,
                message: String::from("timed out waiting for the control master"),
            });
        }
        sleep(CHECK_INTERVAL).await;
    }
}

async fn control(
    config: &SshConfig,
    socket: &Path,
    target: &ShellTarget,
    operation: &str,
) -> Result<bool, ShellError> {
    let status = Command::new(&config.ssh_bin)
        .args(control_args(socket, target, operation))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|err| spawn_error(&config.ssh_bin, &err))?;
    Ok(status.success())
}

/// Reads the master's stderr until it closes so the pipe never fills while
/// the session is alive.
fn collect_stderr(stderr: Option<ChildStderr>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = stderr {
            pipe.read_to_end(&mut buffer).await.ok();
        }
        String::from_utf8_lossy(&buffer).trim().to_owned()
    })
}

fn spawn_error(program: &str, err: &io::Error) -> ShellError {
    ShellError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}

/// An open control master for one host.
#[derive(Debug)]
pub struct SshSession {
    config: Arc<SshConfig>,
    target: ShellTarget,
    socket: ControlSocket,
    master: Child,
}

impl ShellSession for SshSession {
    fn exec(self, command: String, sink: OutputSink) -> ShellFuture<Option<i32>> {
        Box::pin(async move {
            let Self {
                config,
                target,
                socket,
                mut master,
            } = self;

            let mut remote = Command::new(&config.ssh_bin);
            remote.args(exec_args(socket.path(), &target, command));
            let outcome = stream_process(&mut remote, &sink).await;

            if !control(&config, socket.path(), &target, "exit").await.unwrap_or(false) {
                debug!(host = %target.host, "control master did not acknowledge exit");
            }
            master.kill().await.ok();

            outcome.map_err(|err| ShellError::Session {
                host: target.host,
                message: err.to_string(),
            })
        })
    }
}

/// Runs `command`, forwarding stdout and stderr chunks into `sink` as they
/// arrive, and returns the exit code.
pub(crate) async fn stream_process(
    command: &mut Command,
    sink: &OutputSink,
) -> io::Result<Option<i32>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr was not captured"))?;

    tokio::try_join!(
        pump(stdout, sink, OutputChannel::Stdout),
        pump(stderr, sink, OutputChannel::Stderr),
    )?;
    Ok(child.wait().await?.code())
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    sink: &OutputSink,
    channel: OutputChannel,
) -> io::Result<()> {
    let mut buffer = [0_u8; 8192];
    loop {
        let read = reader.read(&mut buffer).await?;
        let Some(chunk) = buffer.get(..read).filter(|chunk| !chunk.is_empty()) else {
            return Ok(());
        };
        sink.write(channel, chunk);
    }
}

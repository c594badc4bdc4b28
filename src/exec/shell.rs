//! Remote shell transport seam.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use super::stream::OutputSink;

/// Future returned by shell operations. Futures own their inputs so
/// connections can be started ahead of time on the runtime.
pub type ShellFuture<T> = Pin<Box<dyn Future<Output = Result<T, ShellError>> + Send + 'static>>;

/// Where and as whom to open a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShellTarget {
    /// Hostname or address.
    pub host: String,
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Private key file, if not the client default.
    pub identity_file: Option<String>,
}

impl ShellTarget {
    /// `user@host` destination string.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Errors raised by remote shells.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ShellError {
    /// The connection could not be established.
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Target host.
        host: String,
        /// Transport message.
        message: String,
    },
    /// A local helper process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program name.
        program: String,
        /// OS error message.
        message: String,
    },
    /// The session failed while running the command.
    #[error("session on {host} failed: {message}")]
    Session {
        /// Target host.
        host: String,
        /// Transport message.
        message: String,
    },
    /// A background connection attempt was cancelled or panicked.
    #[error("connection to {host} was interrupted")]
    Interrupted {
        /// Target host.
        host: String,
    },
}

/// Opens sessions on remote hosts.
pub trait RemoteShell: Send + Sync + 'static {
    /// Connected session type.
    type Session: ShellSession;

    /// Establishes a session with `target`.
    fn connect(&self, target: ShellTarget) -> ShellFuture<Self::Session>;
}

/// An established session able to run one command.
pub trait ShellSession: Send + 'static {
    /// Runs `command`, streaming its output into `sink`, and returns the
    /// remote exit code when one was reported. The session is closed once
    /// the command ends.
    fn exec(self, command: String, sink: OutputSink) -> ShellFuture<Option<i32>>;
}

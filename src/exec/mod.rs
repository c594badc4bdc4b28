//! Fans a command out to the running instances matching a filter.
//!
//! The executor resolves a filter to public addresses, opens a remote shell
//! session per host, and merges every session's output into a single
//! [`OutputStream`]. Hosts run one at a time by default, with up to
//! [`PREHEAT_LIMIT`] upcoming connections opened ahead of the active one;
//! the parallel mode runs every host at once through [`Join`].

mod shell;
mod stream;

use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::InstanceDirectory;
use crate::instance::Filter;
use crate::join::{Join, JoinError};
use crate::provider::{CloudProvider, ProviderError};

pub use shell::{RemoteShell, ShellError, ShellFuture, ShellSession, ShellTarget};
pub use stream::{ExecEvent, OutputChannel, OutputSink, OutputStream, StreamSummary};

use stream::EventSender;

/// Connections opened ahead of the active host in sequential mode.
pub const PREHEAT_LIMIT: usize = 3;

/// Local metadata endpoint serving an instance's own boot payload.
pub const BOOT_PAYLOAD_METADATA_URL: &str = "http://169.254.42.42/user_data/cloud-init";

/// Default login user for fleet instances.
pub const DEFAULT_USER: &str = "root";

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// What to run on each host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandPayload {
    /// A shell command line, sent verbatim.
    Command(String),
    /// A script body run through `bash`.
    Script(String),
    /// Fetch the instance's own boot payload from the metadata service and
    /// run it as root.
    BootPayload,
}

impl CommandPayload {
    /// Renders the remote command line.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Command(command) => command.clone(),
            Self::Script(body) => format!("bash -c {}", escape(body.as_str().into())),
            Self::BootPayload => {
                let fetch = format!("curl -fsS --local-port 1-1024 {BOOT_PAYLOAD_METADATA_URL} | bash");
                format!("sudo sh -c {}", escape(fetch.as_str().into()))
            }
        }
    }
}

/// How failures affect hosts that have not finished.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Stop at the first failure: no further hosts are attempted and, in
    /// parallel mode, running sessions are cancelled.
    #[default]
    CancelRemaining,
    /// Let every host run and report all failures together.
    CollectAll,
}

/// Options for [`Executor::execute`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecOptions {
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Private key file.
    pub identity_file: Option<String>,
    /// Only run on the first matching host.
    pub one: bool,
    /// Run on every host at once.
    pub parallel: bool,
    /// Open upcoming connections early in sequential mode.
    pub preheat: bool,
    /// Failure discipline.
    pub failure: FailurePolicy,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_owned(),
            port: DEFAULT_PORT,
            identity_file: None,
            one: false,
            parallel: false,
            preheat: true,
            failure: FailurePolicy::default(),
        }
    }
}

impl ExecOptions {
    fn target(&self, host: String) -> ShellTarget {
        ShellTarget {
            host,
            user: self.user.clone(),
            port: self.port,
            identity_file: self.identity_file.clone(),
        }
    }
}

/// Errors reported on an [`OutputStream`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// The filter could not be resolved.
    #[error("failed to resolve hosts: {0}")]
    Resolve(#[source] ProviderError),
    /// No running instance with a public address matched.
    #[error("no running instances match `{filter}`")]
    NoHosts {
        /// Filter that matched nothing.
        filter: String,
    },
    /// A session on one host failed.
    #[error("{host}: {source}")]
    Session {
        /// Host the session ran on.
        host: String,
        /// Transport error.
        #[source]
        source: ShellError,
    },
    /// Several hosts failed under [`FailurePolicy::CollectAll`].
    #[error("{} host(s) failed: {}", .0.len(), summarise(.0))]
    Multiple(Vec<ExecError>),
    /// A session task was cancelled or panicked.
    #[error("execution task {index} was interrupted")]
    Interrupted {
        /// Position of the task.
        index: usize,
    },
}

impl ExecError {
    fn from_failures(failures: Vec<Self>) -> Result<(), Self> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self::Multiple(failures))
        }
    }
}

impl From<JoinError<Self>> for ExecError {
    fn from(value: JoinError<Self>) -> Self {
        match value {
            JoinError::Failed(err) => err,
            JoinError::Abandoned { index } => Self::Interrupted { index },
        }
    }
}

fn summarise(errors: &[ExecError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runs commands across the hosts selected by a filter.
pub struct Executor<P, S> {
    directory: InstanceDirectory<P>,
    shell: Arc<S>,
}

impl<P, S> Clone for Executor<P, S> {
    fn clone(&self) -> Self {
        Self {
            directory: self.directory.clone(),
            shell: Arc::clone(&self.shell),
        }
    }
}

impl<P: CloudProvider, S: RemoteShell> Executor<P, S> {
    /// Creates an executor over `directory` using `shell` for sessions.
    #[must_use]
    pub const fn new(directory: InstanceDirectory<P>, shell: Arc<S>) -> Self {
        Self { directory, shell }
    }

    /// Starts executing `payload` on the hosts matching `filter` and
    /// returns the merged output stream immediately.
    ///
    /// Resolution failures and empty host sets are reported as
    /// [`ExecEvent::Error`] on the stream. Must be called from within a
    /// Tokio runtime.
    #[must_use]
    pub fn execute(
        &self,
        filter: Filter,
        payload: &CommandPayload,
        options: ExecOptions,
    ) -> OutputStream {
        let (events, stream) = OutputStream::channel();
        let executor = self.clone();
        let command = payload.render();
        tokio::spawn(async move { executor.drive(filter, command, options, events).await });
        stream
    }

    async fn drive(self, filter: Filter, command: String, options: ExecOptions, events: EventSender) {
        let mut hosts = match self.directory.hostnames(&filter).await {
            Ok(hosts) => hosts,
            Err(err) => {
                events.error(ExecError::Resolve(err));
                return;
            }
        };
        if options.one {
            hosts.truncate(1);
        }
        if hosts.is_empty() {
            events.error(ExecError::NoHosts {
                filter: filter.to_string(),
            });
            return;
        }

        info!(
            hosts = hosts.len(),
            parallel = options.parallel,
            "dispatching remote command"
        );
        let targets: Vec<_> = hosts.into_iter().map(|host| options.target(host)).collect();
        let outcome = if options.parallel {
            self.run_parallel(targets, &command, options.failure, &events)
                .await
        } else {
            self.run_sequential(targets, &command, &options, &events)
                .await
        };
        if let Err(err) = outcome {
            events.error(err);
        }
    }

    async fn run_sequential(
        &self,
        targets: Vec<ShellTarget>,
        command: &str,
        options: &ExecOptions,
        events: &EventSender,
    ) -> Result<(), ExecError> {
        let lookahead = if options.preheat { PREHEAT_LIMIT } else { 0 };
        let mut queue: VecDeque<_> = targets
            .into_iter()
            .map(|target| PendingConnection::new(Arc::clone(&self.shell), target))
            .collect();
        let mut failures = Vec::new();

        while let Some(mut current) = queue.pop_front() {
            if events.is_closed() {
                debug!("output stream dropped; not dispatching further hosts");
                break;
            }
            current.start();
            for upcoming in queue.iter_mut().take(lookahead) {
                upcoming.start();
            }

            let sink = events.sink(current.host());
            if let Err(err) = run_session(current.into_session(), command.to_owned(), sink).await
            {
                match options.failure {
                    FailurePolicy::CancelRemaining => return Err(err),
                    FailurePolicy::CollectAll => {
                        warn!(error = %err, "host failed; continuing");
                        failures.push(err);
                    }
                }
            }
        }

        ExecError::from_failures(failures)
    }

    async fn run_parallel(
        &self,
        targets: Vec<ShellTarget>,
        command: &str,
        failure: FailurePolicy,
        events: &EventSender,
    ) -> Result<(), ExecError> {
        match failure {
            FailurePolicy::CancelRemaining => {
                let join = Join::new();
                for target in targets {
                    let sink = events.sink(&target.host);
                    let connect = self.shell.connect(target);
                    join.spawn(run_session(connect, command.to_owned(), sink));
                }
                join.wait().await?;
                Ok(())
            }
            FailurePolicy::CollectAll => {
                let join = Join::<Result<(), ExecError>, Infallible>::new();
                for target in targets {
                    let sink = events.sink(&target.host);
                    let connect = self.shell.connect(target);
                    let session = run_session(connect, command.to_owned(), sink);
                    join.spawn(async move { Ok(session.await) });
                }
                let outcomes = join.wait().await.map_err(|err| match err {
                    JoinError::Failed(never) => match never {},
                    JoinError::Abandoned { index } => ExecError::Interrupted { index },
                })?;
                ExecError::from_failures(outcomes.into_iter().filter_map(Result::err).collect())
            }
        }
    }
}

async fn run_session<T, F>(connect: F, command: String, sink: OutputSink) -> Result<(), ExecError>
where
    T: ShellSession,
    F: Future<Output = Result<T, ShellError>>,
{
    let host = sink.host().to_owned();
    let session = connect.await.map_err(|source| ExecError::Session {
        host: host.clone(),
        source,
    })?;
    debug!(%host, "running remote command");
    let code = session
        .exec(command, sink.clone())
        .await
        .map_err(|source| ExecError::Session { host, source })?;
    sink.exit(code);
    Ok(())
}

/// Connection that is opened on first use or when preheated, and torn down
/// if it is dropped unused.
struct PendingConnection<S: RemoteShell> {
    shell: Arc<S>,
    host: String,
    target: Option<ShellTarget>,
    task: Option<JoinHandle<Result<S::Session, ShellError>>>,
}

impl<S: RemoteShell> PendingConnection<S> {
    fn new(shell: Arc<S>, target: ShellTarget) -> Self {
        Self {
            shell,
            host: target.host.clone(),
            target: Some(target),
            task: None,
        }
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn start(&mut self) {
        if let Some(target) = self.target.take() {
            debug!(host = %self.host, "opening connection");
            self.task = Some(tokio::spawn(self.shell.connect(target)));
        }
    }

    async fn into_session(mut self) -> Result<S::Session, ShellError> {
        self.start();
        let Some(task) = self.task.as_mut() else {
            return Err(ShellError::Interrupted {
                host: self.host.clone(),
            });
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|_| ShellError::Interrupted {
            host: self.host.clone(),
        })?
    }
}

impl<S: RemoteShell> Drop for PendingConnection<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests;

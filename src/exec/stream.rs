//! Merged output stream produced by the executor.

use tokio::sync::mpsc;

use super::ExecError;

/// Which remote stream a chunk came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputChannel {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One item on an [`OutputStream`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecEvent {
    /// A chunk of remote output.
    Output {
        /// Host that produced the chunk.
        host: String,
        /// Stream the chunk was read from.
        channel: OutputChannel,
        /// Raw bytes.
        data: Vec<u8>,
    },
    /// A remote command finished.
    Exit {
        /// Host the command ran on.
        host: String,
        /// Exit code, when the transport reported one.
        code: Option<i32>,
    },
    /// Execution failed; see the error for scope.
    Error(ExecError),
}

/// Everything an [`OutputStream`] produced, gathered in arrival order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamSummary {
    /// Concatenated standard output.
    pub stdout: Vec<u8>,
    /// Concatenated standard error.
    pub stderr: Vec<u8>,
    /// Exit codes per host, in completion order.
    pub exits: Vec<(String, Option<i32>)>,
    /// Errors reported on the stream.
    pub errors: Vec<ExecError>,
}

/// Ordered stream of execution events. The stream ends once every session
/// has finished and the executor has stopped.
#[derive(Debug)]
pub struct OutputStream {
    receiver: mpsc::UnboundedReceiver<ExecEvent>,
}

impl OutputStream {
    pub(crate) fn channel() -> (EventSender, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (EventSender { sender }, Self { receiver })
    }

    /// Receives the next event, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<ExecEvent> {
        self.receiver.recv().await
    }

    /// Drains the stream.
    pub async fn collect(mut self) -> StreamSummary {
        let mut summary = StreamSummary::default();
        while let Some(event) = self.next().await {
            match event {
                ExecEvent::Output {
                    channel: OutputChannel::Stdout,
                    data,
                    ..
                } => summary.stdout.extend_from_slice(&data),
                ExecEvent::Output {
                    channel: OutputChannel::Stderr,
                    data,
                    ..
                } => summary.stderr.extend_from_slice(&data),
                ExecEvent::Exit { host, code } => summary.exits.push((host, code)),
                ExecEvent::Error(err) => summary.errors.push(err),
            }
        }
        summary
    }
}

/// Executor-side handle onto an [`OutputStream`].
#[derive(Clone, Debug)]
pub(crate) struct EventSender {
    sender: mpsc::UnboundedSender<ExecEvent>,
}

impl EventSender {
    pub(crate) fn sink(&self, host: &str) -> OutputSink {
        OutputSink {
            host: host.to_owned(),
            sender: self.sender.clone(),
        }
    }

    pub(crate) fn error(&self, err: ExecError) {
        self.sender.send(ExecEvent::Error(err)).ok();
    }

    /// `true` once the consumer dropped the stream.
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Per-host writer handed to a [`super::ShellSession`].
#[derive(Clone, Debug)]
pub struct OutputSink {
    host: String,
    sender: mpsc::UnboundedSender<ExecEvent>,
}

impl OutputSink {
    /// Host this sink writes for.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Forwards a chunk of output. Chunks sent after the consumer went
    /// away are dropped.
    pub fn write(&self, channel: OutputChannel, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.sender
            .send(ExecEvent::Output {
                host: self.host.clone(),
                channel,
                data: data.to_vec(),
            })
            .ok();
    }

    /// Forwards standard output.
    pub fn stdout(&self, data: &[u8]) {
        self.write(OutputChannel::Stdout, data);
    }

    /// Forwards standard error.
    pub fn stderr(&self, data: &[u8]) {
        self.write(OutputChannel::Stderr, data);
    }

    pub(crate) fn exit(&self, code: Option<i32>) {
        self.sender
            .send(ExecEvent::Exit {
                host: self.host.clone(),
                code,
            })
            .ok();
    }
}

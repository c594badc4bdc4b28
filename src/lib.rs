//! Core library for the `armada` fleet tool.
//!
//! The crate resolves filters over a cloud inventory, launches instances
//! that inherit configuration from existing ones, terminates them, and fans
//! shell commands out over SSH. [`Fleet`] bundles every operation over one
//! [`CloudProvider`] and one [`RemoteShell`]; [`ScalewayProvider`] and
//! [`SshShell`] are the shipped implementations.

pub mod cache;
pub mod config;
pub mod directory;
pub mod exec;
pub mod fleet;
pub mod instance;
pub mod join;
pub mod launch;
pub mod lifecycle;
pub mod payload;
pub mod provider;
pub mod scaleway;
pub mod ssh;
pub mod test_support;

pub use cache::{Cache, CacheError};
pub use config::{ConfigError, ScalewayConfig};
pub use directory::{Capabilities, InstanceDirectory, ResolveOptions};
pub use exec::{
    CommandPayload, ExecError, ExecEvent, ExecOptions, Executor, FailurePolicy, OutputChannel,
    OutputStream, RemoteShell, ShellError, ShellSession, ShellTarget, StreamSummary,
};
pub use fleet::Fleet;
pub use instance::{Filter, Instance, InstanceName, InstanceState};
pub use join::{Join, JoinError, JoinSlot};
pub use launch::{Defaults, LaunchError, LaunchOptions, LaunchOrchestrator, LaunchRequest};
pub use lifecycle::{Lifecycle, LifecycleError};
pub use payload::PayloadError;
pub use provider::{CloudProvider, CreateSpec, LoadBalancerMember, ProviderError, Tag};
pub use scaleway::ScalewayProvider;
pub use ssh::{SshConfig, SshConfigError, SshShell};

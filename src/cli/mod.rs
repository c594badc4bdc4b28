//! Command-line interface definitions for the `armada` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `armada` binary.
#[derive(Debug, Parser)]
#[command(
    name = "armada",
    about = "List, launch, terminate, and run commands across a Scaleway fleet",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log orchestration steps to stderr.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `armada` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Print the instances matching a filter as JSON.
    #[command(name = "list")]
    List(ListCommand),
    /// Print the public addresses of the running instances matching a filter.
    #[command(name = "hostnames")]
    Hostnames(FilterArg),
    /// Print the distinct instance names matching a filter.
    #[command(name = "names")]
    Names(NamesCommand),
    /// Print the zones, keys, groups, roles, and load balancers as JSON.
    #[command(name = "capabilities")]
    Capabilities(RefreshArg),
    /// Launch instances, inheriting defaults from an existing instance.
    #[command(name = "launch")]
    Launch(LaunchCommand),
    /// Terminate the best instance matching a filter.
    #[command(name = "terminate")]
    Terminate(RequiredFilterArg),
    /// Print the boot payload of the best instance matching a filter.
    #[command(name = "script")]
    Script(RequiredFilterArg),
    /// Run a command on every running instance matching a filter.
    #[command(name = "exec")]
    Exec(ExecCommand),
}

/// Optional filter argument.
#[derive(Debug, Args)]
pub(crate) struct FilterArg {
    /// Instance id, address, or `+`-joined name tokens; `*` matches all.
    #[arg(value_name = "FILTER", default_value = "*")]
    pub(crate) filter: String,
}

/// Mandatory filter argument.
#[derive(Debug, Args)]
pub(crate) struct RequiredFilterArg {
    /// Instance id, address, or `+`-joined name tokens.
    #[arg(value_name = "FILTER")]
    pub(crate) filter: String,
}

/// Cache bypass flag.
#[derive(Debug, Args)]
pub(crate) struct RefreshArg {
    /// Ignore cached results and query the provider.
    #[arg(long)]
    pub(crate) refresh: bool,
}

/// Arguments for `armada list`.
#[derive(Debug, Args)]
pub(crate) struct ListCommand {
    #[command(flatten)]
    pub(crate) filter: FilterArg,
    /// Only include running instances.
    #[arg(long)]
    pub(crate) running: bool,
    /// Attribute instances to the load balancers serving them.
    #[arg(long)]
    pub(crate) load_balancers: bool,
}

/// Arguments for `armada names`.
#[derive(Debug, Args)]
pub(crate) struct NamesCommand {
    #[command(flatten)]
    pub(crate) filter: FilterArg,
    #[command(flatten)]
    pub(crate) refresh: RefreshArg,
}

/// Arguments for `armada launch`.
#[derive(Debug, Args)]
pub(crate) struct LaunchCommand {
    /// Name for the new instances, `+`-joined tokens allowed.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
    /// Image identifier or label.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Commercial type.
    #[arg(long = "type", value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Placement zone.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// SSH key name.
    #[arg(long = "key", value_name = "KEY")]
    pub(crate) key_name: Option<String>,
    /// Security group name.
    #[arg(long, value_name = "GROUP")]
    pub(crate) security_group: Option<String>,
    /// Role recorded on the instances.
    #[arg(long, value_name = "ROLE")]
    pub(crate) role: Option<String>,
    /// Load balancer to register the instances with.
    #[arg(long, value_name = "NAME")]
    pub(crate) load_balancer: Option<String>,
    /// Boot payload given inline.
    #[arg(long, value_name = "PAYLOAD", conflicts_with = "boot_payload_file")]
    pub(crate) boot_payload: Option<String>,
    /// Boot payload read from a file.
    #[arg(long, value_name = "PATH", conflicts_with = "boot_payload")]
    pub(crate) boot_payload_file: Option<String>,
    /// Number of instances to create.
    #[arg(long, value_name = "N")]
    pub(crate) count: Option<u32>,
    /// Wait until the first instance is running.
    #[arg(long)]
    pub(crate) wait: bool,
    /// Give up waiting after this many seconds.
    #[arg(long, value_name = "SECONDS", requires = "wait")]
    pub(crate) wait_timeout: Option<u64>,
    /// Do not inherit defaults from an existing instance.
    #[arg(long, conflicts_with = "defaults_from")]
    pub(crate) no_defaults: bool,
    /// Inherit defaults from the best instance matching this filter.
    #[arg(long, value_name = "FILTER")]
    pub(crate) defaults_from: Option<String>,
}

/// Arguments for `armada exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Instance id, address, or `+`-joined name tokens; `*` matches all.
    #[arg(value_name = "FILTER")]
    pub(crate) filter: String,
    /// Run a local script file instead of a command; `-` reads stdin.
    #[arg(long, value_name = "PATH", conflicts_with_all = ["boot_payload", "command"])]
    pub(crate) script: Option<String>,
    /// Re-run each instance's own boot payload.
    #[arg(long, conflicts_with = "command")]
    pub(crate) boot_payload: bool,
    /// Only run on the best matching instance.
    #[arg(long)]
    pub(crate) one: bool,
    /// Run on every instance at once.
    #[arg(long)]
    pub(crate) parallel: bool,
    /// Do not open connections ahead of the active host.
    #[arg(long)]
    pub(crate) no_preheat: bool,
    /// Keep going after a host fails and report every failure.
    #[arg(long)]
    pub(crate) collect_all: bool,
    /// Login user.
    #[arg(long, value_name = "USER")]
    pub(crate) user: Option<String>,
    /// SSH port.
    #[arg(long, value_name = "PORT")]
    pub(crate) port: Option<u16>,
    /// Private key file.
    #[arg(long, value_name = "PATH")]
    pub(crate) identity: Option<String>,
    /// Command to run (use -- to separate flags).
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub(crate) command: Vec<String>,
}

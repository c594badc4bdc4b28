//! Binary entry point for the `armada` CLI.

mod cli;

use std::future::Future;
use std::io::{self, Read, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use armada::{
    Cache, CommandPayload, Defaults, ExecEvent, FailurePolicy, Filter, Fleet, Instance, LaunchError,
    LaunchOptions, LifecycleError, OutputChannel, PayloadError, ProviderError, ResolveOptions,
    ScalewayConfig, ScalewayProvider, SshConfig, SshShell, payload,
};
use cli::{Cli, Command, ExecCommand, LaunchCommand, ListCommand, NamesCommand};

const CAPABILITIES_KEY: &str = "capabilities";
const NAMES_KEY: &str = "names";

type ArmadaFleet = Fleet<ScalewayProvider, SshShell>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("no boot payload found for `{0}`")]
    NoPayload(String),
    #[error("a command, --script, or --boot-payload is required")]
    MissingCommand,
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let exit_code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(command: Command) -> Result<i32, CliError> {
    let profile =
        ScalewayConfig::load_validated().map_err(|err| CliError::Config(err.to_string()))?;
    let cache = open_cache(&profile);
    let ssh_config =
        SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let shell =
        SshShell::new(ssh_config.clone()).map_err(|err| CliError::Config(err.to_string()))?;
    let fleet = Fleet::new(ScalewayProvider::new(profile)?, shell);

    match command {
        Command::List(args) => list(&fleet, &args).await,
        Command::Hostnames(args) => {
            let hosts = fleet.hostnames(&Filter::parse(&args.filter)).await?;
            write_lines(&hosts)
        }
        Command::Names(args) => names(&fleet, cache.as_ref(), &args).await,
        Command::Capabilities(args) => {
            let capabilities = cached(cache.as_ref(), CAPABILITIES_KEY, args.refresh, || {
                fleet.describe_capabilities()
            })
            .await?;
            write_json(&capabilities)
        }
        Command::Launch(args) => {
            let result = launch(fleet, &args).await;
            invalidate(cache.as_ref());
            result
        }
        Command::Terminate(args) => {
            let terminated = fleet.terminate(&Filter::parse(&args.filter)).await;
            invalidate(cache.as_ref());
            write_terminated(&mut io::stdout().lock(), terminated?.as_ref())
        }
        Command::Script(args) => {
            let script = fleet
                .read_boot_payload(&Filter::parse(&args.filter))
                .await?
                .ok_or(CliError::NoPayload(args.filter))?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&script)?;
            stdout.flush()?;
            Ok(0)
        }
        Command::Exec(args) => exec(&fleet, &ssh_config, args).await,
    }
}

async fn list(fleet: &ArmadaFleet, args: &ListCommand) -> Result<i32, CliError> {
    let mut options = if args.running {
        ResolveOptions::running()
    } else {
        ResolveOptions::default()
    };
    if args.load_balancers {
        options = options.with_load_balancers();
    }
    let instances = fleet
        .resolve(&Filter::parse(&args.filter.filter), options)
        .await?;
    write_json(&instances)
}

async fn names(
    fleet: &ArmadaFleet,
    cache: Option<&Cache>,
    args: &NamesCommand,
) -> Result<i32, CliError> {
    let filter = Filter::parse(&args.filter.filter);
    let found = if filter.is_wildcard() {
        cached(cache, NAMES_KEY, args.refresh.refresh, || fleet.names(&filter)).await?
    } else {
        fleet.names(&filter).await?
    };
    write_lines(&found)
}

async fn launch(fleet: ArmadaFleet, args: &LaunchCommand) -> Result<i32, CliError> {
    let boot_payload = payload::resolve_payload(
        args.boot_payload.as_deref(),
        args.boot_payload_file.as_deref(),
    )?;
    let defaults = match (args.no_defaults, args.defaults_from.as_deref()) {
        (true, _) => Defaults::Disabled,
        (false, Some(filter)) => Defaults::From(Filter::parse(filter)),
        (false, None) => Defaults::FromTarget,
    };
    let options = LaunchOptions {
        image: args.image.clone(),
        instance_type: args.instance_type.clone(),
        zone: args.zone.clone(),
        key_name: args.key_name.clone(),
        security_group: args.security_group.clone(),
        iam_role: args.role.clone(),
        load_balancer: args.load_balancer.clone(),
        boot_payload,
        count: args.count,
        wait: args.wait,
        defaults,
    };
    let launcher = match args.wait_timeout {
        Some(seconds) => fleet.with_wait_timeout(Duration::from_secs(seconds)),
        None => fleet,
    };
    let instance = launcher.launch(&args.name, &options).await?;
    write_json(&instance)
}

async fn exec(fleet: &ArmadaFleet, ssh: &SshConfig, args: ExecCommand) -> Result<i32, CliError> {
    let command = exec_payload(&args)?;
    let mut options = ssh.exec_options();
    if let Some(user) = args.user {
        options.user = user;
    }
    if let Some(port) = args.port {
        options.port = port;
    }
    if args.identity.is_some() {
        options.identity_file = args.identity;
    }
    options.one = args.one;
    options.parallel = args.parallel;
    options.preheat = !args.no_preheat;
    if args.collect_all {
        options.failure = FailurePolicy::CollectAll;
    }

    let mut stream = fleet.execute(Filter::parse(&args.filter), &command, options);
    let mut status = 0;
    let mut failed = false;
    while let Some(event) = stream.next().await {
        match event {
            ExecEvent::Output {
                channel: OutputChannel::Stdout,
                data,
                ..
            } => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            ExecEvent::Output {
                channel: OutputChannel::Stderr,
                data,
                ..
            } => io::stderr().write_all(&data)?,
            ExecEvent::Exit { host, code } => {
                debug!(%host, ?code, "remote command finished");
                if status == 0 {
                    status = code.unwrap_or(1);
                }
            }
            ExecEvent::Error(err) => {
                writeln!(io::stderr(), "{err}").ok();
                failed = true;
            }
        }
    }
    Ok(if failed { 1 } else { status })
}

fn exec_payload(args: &ExecCommand) -> Result<CommandPayload, CliError> {
    if args.boot_payload {
        return Ok(CommandPayload::BootPayload);
    }
    if let Some(path) = &args.script {
        return read_script(path).map(CommandPayload::Script);
    }
    if args.command.is_empty() {
        return Err(CliError::MissingCommand);
    }
    validate_command_args(&args.command)?;
    Ok(CommandPayload::Command(render_remote_command(&args.command)))
}

fn read_script(path: &str) -> Result<String, CliError> {
    let body = if path == "-" {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer)?;
        buffer
    } else {
        payload::read_payload_file(path)?
    };
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn open_cache(profile: &ScalewayConfig) -> Option<Cache> {
    let opened = profile
        .cache_ttl()
        .map_err(|err| err.to_string())
        .and_then(|ttl| {
            Cache::for_project(&profile.default_project_id, ttl).map_err(|err| err.to_string())
        });
    match opened {
        Ok(cache) => Some(cache),
        Err(message) => {
            warn!(error = %message, "caching disabled");
            None
        }
    }
}

/// Returns the cached value for `key` unless `refresh` is set, otherwise
/// fetches and stores it. Cache failures only disable caching.
async fn cached<T, F, Fut>(
    cache: Option<&Cache>,
    key: &str,
    refresh: bool,
    fetch: F,
) -> Result<T, CliError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    if !refresh && let Some(store) = cache {
        match store.get(key) {
            Ok(Some(value)) => {
                debug!(key, "cache hit");
                return Ok(value);
            }
            Ok(None) => debug!(key, "cache miss"),
            Err(err) => warn!(key, error = %err, "cache read failed"),
        }
    }
    let value = fetch().await?;
    if let Some(store) = cache
        && let Err(err) = store.put(key, &value)
    {
        warn!(key, error = %err, "cache write failed");
    }
    Ok(value)
}

fn invalidate(cache: Option<&Cache>) {
    if let Some(store) = cache
        && let Err(err) = store.clear()
    {
        warn!(error = %err, "failed to clear cache");
    }
}

fn write_json<T: Serialize + ?Sized>(value: &T) -> Result<i32, CliError> {
    write_json_to(&mut io::stdout().lock(), value)
}

fn write_json_to<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<i32, CliError> {
    serde_json::to_writer_pretty(&mut *out, value).map_err(io::Error::from)?;
    writeln!(out)?;
    Ok(0)
}

/// Terminating nothing is a successful no-op with no output.
fn write_terminated<W: Write>(out: &mut W, instance: Option<&Instance>) -> Result<i32, CliError> {
    let Some(instance) = instance else {
        debug!("no instance matched; nothing terminated");
        return Ok(0);
    };
    write_json_to(out, instance)
}

fn write_lines(lines: &[String]) -> Result<i32, CliError> {
    let mut stdout = io::stdout().lock();
    for line in lines {
        writeln!(stdout, "{line}")?;
    }
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

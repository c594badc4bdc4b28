//! Unit tests for the fan-out executor.

use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::instance::InstanceState;
use crate::test_support::{
    HostBehaviour, ProviderCall, ScriptedProvider, ScriptedShell, ShellCall, instance_record,
};

fn fleet_of(hosts: &[&str]) -> ScriptedProvider {
    let provider = ScriptedProvider::new();
    let newest = i64::try_from(hosts.len()).unwrap_or(i64::MAX);
    for (offset, host) in (0_i64..).zip(hosts) {
        provider.push_instance(
            instance_record(host, "web", InstanceState::Running, newest - offset)
                .with_public_address(host),
        );
    }
    provider
}

fn executor(provider: &ScriptedProvider, shell: &ScriptedShell) -> Executor<ScriptedProvider, ScriptedShell> {
    Executor::new(
        InstanceDirectory::new(Arc::new(provider.clone())),
        Arc::new(shell.clone()),
    )
}

fn command() -> CommandPayload {
    CommandPayload::Command(String::from("hostname"))
}

async fn run(
    provider: &ScriptedProvider,
    shell: &ScriptedShell,
    options: ExecOptions,
) -> StreamSummary {
    let stream = executor(provider, shell).execute(Filter::All, &command(), options);
    tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("output stream should end")
}

#[fixture]
fn shell() -> ScriptedShell {
    ScriptedShell::new()
}

#[rstest]
#[tokio::test]
async fn sequential_output_follows_host_order(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3"]);

    let summary = run(&provider, &shell, ExecOptions::default()).await;

    assert_eq!(summary.stdout, b"h1\nh2\nh3\n");
    assert!(summary.errors.is_empty(), "errors: {:?}", summary.errors);
    assert_eq!(
        summary.exits,
        [
            (String::from("h1"), Some(0)),
            (String::from("h2"), Some(0)),
            (String::from("h3"), Some(0)),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn preheats_upcoming_connections_before_running_the_first_host(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3"]);

    run(&provider, &shell, ExecOptions::default()).await;

    let log = shell.log();
    assert_eq!(
        log.get(..3),
        Some(
            &[
                ShellCall::connect("h1"),
                ShellCall::connect("h2"),
                ShellCall::connect("h3"),
            ][..]
        )
    );
    assert_eq!(shell.executed_hosts(), ["h1", "h2", "h3"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn a_slow_first_connection_does_not_reorder_output(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3"]);
    shell.on_host("h1", HostBehaviour::SlowConnect(Duration::from_millis(500)));

    let summary = run(&provider, &shell, ExecOptions::default()).await;

    assert_eq!(summary.stdout, b"h1\nh2\nh3\n");
    assert_eq!(shell.executed_hosts(), ["h1", "h2", "h3"]);
    assert!(summary.errors.is_empty(), "errors: {:?}", summary.errors);
}

#[rstest]
#[tokio::test]
async fn preheating_is_bounded_to_the_lookahead_window(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3", "h4", "h5", "h6"]);

    let summary = run(&provider, &shell, ExecOptions::default()).await;

    let log = shell.log();
    let first_exec = log
        .iter()
        .position(|call| call.exec_host().is_some())
        .expect("a command should run");
    assert_eq!(first_exec, PREHEAT_LIMIT + 1);
    assert_eq!(summary.stdout, b"h1\nh2\nh3\nh4\nh5\nh6\n");
}

#[rstest]
#[tokio::test]
async fn without_preheat_connections_open_on_demand(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2"]);
    let options = ExecOptions {
        preheat: false,
        ..ExecOptions::default()
    };

    run(&provider, &shell, options).await;

    assert_eq!(
        shell.log(),
        [
            ShellCall::connect("h1"),
            ShellCall::Exec {
                host: String::from("h1"),
                command: String::from("hostname"),
            },
            ShellCall::connect("h2"),
            ShellCall::Exec {
                host: String::from("h2"),
                command: String::from("hostname"),
            },
        ]
    );
}

#[rstest]
#[tokio::test]
async fn sequential_failure_stops_further_hosts(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3"]);
    shell.on_host("h2", HostBehaviour::FailExec);

    let summary = run(&provider, &shell, ExecOptions::default()).await;

    assert_eq!(summary.stdout, b"h1\n");
    assert_eq!(shell.executed_hosts(), ["h1", "h2"]);
    assert!(matches!(
        summary.errors.as_slice(),
        [ExecError::Session { host, .. }] if host == "h2"
    ));
}

#[rstest]
#[tokio::test]
async fn sequential_collect_all_keeps_going(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3"]);
    shell.on_host("h2", HostBehaviour::FailConnect);
    let options = ExecOptions {
        failure: FailurePolicy::CollectAll,
        ..ExecOptions::default()
    };

    let summary = run(&provider, &shell, options).await;

    assert_eq!(summary.stdout, b"h1\nh3\n");
    let [ExecError::Multiple(failures)] = summary.errors.as_slice() else {
        panic!("expected one aggregated error, got {:?}", summary.errors);
    };
    assert!(matches!(
        failures.as_slice(),
        [ExecError::Session { host, source: ShellError::Connect { .. } }] if host == "h2"
    ));
}

#[rstest]
#[tokio::test]
async fn exit_codes_do_not_stop_the_stream(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2"]);
    shell.on_host("h1", HostBehaviour::Exit(3));

    let summary = run(&provider, &shell, ExecOptions::default()).await;

    assert_eq!(summary.stdout, b"h2\n");
    assert_eq!(
        summary.exits,
        [(String::from("h1"), Some(3)), (String::from("h2"), Some(0))]
    );
    assert!(summary.errors.is_empty());
}

#[rstest]
#[tokio::test]
async fn one_limits_execution_to_the_best_match(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3"]);
    let options = ExecOptions {
        one: true,
        ..ExecOptions::default()
    };

    let summary = run(&provider, &shell, options).await;

    assert_eq!(summary.stdout, b"h1\n");
    assert_eq!(shell.log(), [
        ShellCall::connect("h1"),
        ShellCall::Exec {
            host: String::from("h1"),
            command: String::from("hostname"),
        },
    ]);
}

#[rstest]
#[tokio::test]
async fn parallel_runs_every_host(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3"]);
    let options = ExecOptions {
        parallel: true,
        ..ExecOptions::default()
    };

    let summary = run(&provider, &shell, options).await;

    let mut lines: Vec<_> = String::from_utf8(summary.stdout)
        .expect("utf8 output")
        .lines()
        .map(str::to_owned)
        .collect();
    lines.sort();
    assert_eq!(lines, ["h1", "h2", "h3"]);
    assert_eq!(summary.exits.len(), 3);
}

#[rstest]
#[tokio::test]
async fn parallel_failure_cancels_running_sessions(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2"]);
    shell.on_host("h1", HostBehaviour::Hang);
    shell.on_host("h2", HostBehaviour::FailExec);
    let options = ExecOptions {
        parallel: true,
        ..ExecOptions::default()
    };

    let summary = run(&provider, &shell, options).await;

    assert!(matches!(
        summary.errors.as_slice(),
        [ExecError::Session { host, .. }] if host == "h2"
    ));
    assert!(shell.log().contains(&ShellCall::Cancelled(String::from("h1"))));
}

#[rstest]
#[tokio::test]
async fn parallel_collect_all_reports_every_failure(shell: ScriptedShell) {
    let provider = fleet_of(&["h1", "h2", "h3"]);
    shell.on_host("h1", HostBehaviour::FailExec);
    shell.on_host("h3", HostBehaviour::FailConnect);
    let options = ExecOptions {
        parallel: true,
        failure: FailurePolicy::CollectAll,
        ..ExecOptions::default()
    };

    let summary = run(&provider, &shell, options).await;

    assert_eq!(summary.stdout, b"h2\n");
    let [ExecError::Multiple(failures)] = summary.errors.as_slice() else {
        panic!("expected one aggregated error, got {:?}", summary.errors);
    };
    let mut hosts: Vec<_> = failures
        .iter()
        .filter_map(|failure| match failure {
            ExecError::Session { host, .. } => Some(host.as_str()),
            _ => None,
        })
        .collect();
    hosts.sort_unstable();
    assert_eq!(hosts, ["h1", "h3"]);
}

#[rstest]
#[tokio::test]
async fn empty_host_set_is_a_stream_error(shell: ScriptedShell) {
    let provider = ScriptedProvider::new();
    provider.push_instance(instance_record("db", "db", InstanceState::Stopped, 1).with_public_address("h9"));

    let summary = run(&provider, &shell, ExecOptions::default()).await;

    assert_eq!(
        summary.errors,
        [ExecError::NoHosts {
            filter: String::from("*")
        }]
    );
    assert!(shell.log().is_empty());
}

#[rstest]
#[tokio::test]
async fn resolution_failure_is_a_stream_error(shell: ScriptedShell) {
    let provider = fleet_of(&["h1"]);
    provider.fail(
        ProviderCall::ListInstances,
        ProviderError::Api {
            message: String::from("throttled"),
        },
    );

    let summary = run(&provider, &shell, ExecOptions::default()).await;

    assert!(matches!(
        summary.errors.as_slice(),
        [ExecError::Resolve(ProviderError::Api { .. })]
    ));
}

#[test]
fn script_payload_runs_through_bash() {
    let payload = CommandPayload::Script(String::from("echo 'hi'\nuptime\n"));
    assert_eq!(payload.render(), "bash -c 'echo '\\''hi'\\''\nuptime\n'");
}

#[test]
fn boot_payload_fetches_from_metadata_service() {
    let rendered = CommandPayload::BootPayload.render();
    assert!(rendered.starts_with("sudo sh -c "), "rendered: {rendered}");
    assert!(
        rendered.contains(BOOT_PAYLOAD_METADATA_URL),
        "rendered: {rendered}"
    );
}

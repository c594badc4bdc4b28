//! BDD step definitions for fleet behaviour.

use armada::test_support::{HostBehaviour, ProviderCall, instance_record};
use armada::{
    CommandPayload, ExecError, ExecOptions, FailurePolicy, Filter, InstanceState, LaunchOptions,
    ProviderError,
};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{FleetContext, Outcome, block_on};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn outcome(fleet_context: &FleetContext) -> Result<&Outcome, StepError> {
    fleet_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

fn expect(condition: bool, message: impl FnOnce() -> String) -> Result<(), StepError> {
    if condition {
        Ok(())
    } else {
        Err(StepError::Assertion(message()))
    }
}

fn as_len(count: u32) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

#[given("a running template \"{name}\" in zone \"{zone}\" at \"{address}\"")]
fn running_template(
    fleet_context: FleetContext,
    name: String,
    zone: String,
    address: String,
) -> FleetContext {
    let template = name.trim();
    let template_zone = zone.trim();
    fleet_context.provider.push_instance(
        instance_record(
            &format!("{template_zone}/tpl-{template}"),
            template,
            InstanceState::Running,
            100,
        )
        .with_public_address(address.trim())
        .with_type("DEV1-M")
        .with_image(&format!("{template_zone}/img-{template}"))
        .with_key_name("deploy")
        .with_zone(template_zone),
    );
    fleet_context
}

#[given("a second \"{name}\" instance at \"{address}\"")]
fn second_instance(fleet_context: FleetContext, name: String, address: String) -> FleetContext {
    fleet_context.provider.push_instance(
        instance_record("fr-par-1/second", name.trim(), InstanceState::Running, 50)
            .with_public_address(address.trim()),
    );
    fleet_context
}

#[given("a load balancer \"{name}\" serving zone \"{zone}\"")]
fn load_balancer(fleet_context: FleetContext, name: String, zone: String) -> FleetContext {
    fleet_context
        .provider
        .set_load_balancer_zones(name.trim(), &[zone.trim()]);
    fleet_context
}

#[given("new instances report pending, then running")]
fn pending_then_running(fleet_context: FleetContext) -> FleetContext {
    fleet_context
        .provider
        .script_launch_states(&[InstanceState::Pending, InstanceState::Running]);
    fleet_context
}

#[given("host \"{host}\" refuses connections")]
fn host_refuses(fleet_context: FleetContext, host: String) -> FleetContext {
    fleet_context
        .shell
        .on_host(host.trim(), HostBehaviour::FailConnect);
    fleet_context
}

#[given("host \"{host}\" fails while running")]
fn host_fails(fleet_context: FleetContext, host: String) -> FleetContext {
    fleet_context.shell.on_host(host.trim(), HostBehaviour::FailExec);
    fleet_context
}

#[given("listing key pairs fails with \"{message}\"")]
fn key_pairs_fail(fleet_context: FleetContext, message: String) -> FleetContext {
    fleet_context.provider.fail(
        ProviderCall::ListKeyPairs,
        ProviderError::Api {
            message: message.trim().to_owned(),
        },
    );
    fleet_context
}

#[when("I launch {count:u32} instances of \"{name}\" behind \"{load_balancer}\" and wait")]
fn launch_behind(
    mut fleet_context: FleetContext,
    count: u32,
    name: String,
    load_balancer: String,
) -> FleetContext {
    let options = LaunchOptions {
        count: Some(count),
        load_balancer: Some(load_balancer.trim().to_owned()),
        wait: true,
        ..LaunchOptions::default()
    };
    let fleet = fleet_context.fleet();
    fleet_context.outcome = Some(
        match block_on(async { fleet.launch(name.trim(), &options).await }) {
            Ok(instance) => Outcome::Launched(instance),
            Err(err) => Outcome::Failed(err.to_string()),
        },
    );
    fleet_context
}

#[when("I launch {count:u32} instances of \"{name}\"")]
fn launch(mut fleet_context: FleetContext, count: u32, name: String) -> FleetContext {
    let options = LaunchOptions {
        count: Some(count),
        ..LaunchOptions::default()
    };
    let fleet = fleet_context.fleet();
    fleet_context.outcome = Some(
        match block_on(async { fleet.launch(name.trim(), &options).await }) {
            Ok(instance) => Outcome::Launched(instance),
            Err(err) => Outcome::Failed(err.to_string()),
        },
    );
    fleet_context
}

#[when("I run \"{command}\" on \"{filter}\" in parallel, collecting all failures")]
fn run_collecting(mut fleet_context: FleetContext, command: String, filter: String) -> FleetContext {
    let options = ExecOptions {
        parallel: true,
        failure: FailurePolicy::CollectAll,
        ..ExecOptions::default()
    };
    let fleet = fleet_context.fleet();
    let summary = block_on(async {
        fleet
            .execute(
                Filter::parse(filter.trim()),
                &CommandPayload::Command(command.trim().to_owned()),
                options,
            )
            .collect()
            .await
    });
    let failures = summary
        .errors
        .iter()
        .map(|err| match err {
            ExecError::Multiple(inner) => inner.len(),
            _ => 1,
        })
        .sum();
    fleet_context.outcome = Some(Outcome::Executed { failures });
    fleet_context
}

#[when("I terminate \"{filter}\"")]
fn terminate(mut fleet_context: FleetContext, filter: String) -> FleetContext {
    let fleet = fleet_context.fleet();
    fleet_context.outcome = Some(
        match block_on(async { fleet.terminate(&Filter::parse(filter.trim())).await }) {
            Ok(instance) => Outcome::Terminated(instance),
            Err(err) => Outcome::Failed(err.to_string()),
        },
    );
    fleet_context
}

#[when("I describe the fleet's capabilities")]
fn describe(mut fleet_context: FleetContext) -> FleetContext {
    let fleet = fleet_context.fleet();
    fleet_context.outcome = Some(
        match block_on(async { fleet.describe_capabilities().await }) {
            Ok(_) => Outcome::Described,
            Err(err) => Outcome::Failed(err.to_string()),
        },
    );
    fleet_context
}

#[then("the launched instance is running")]
fn launched_running(fleet_context: &FleetContext) -> Result<(), StepError> {
    match outcome(fleet_context)? {
        Outcome::Launched(instance) => expect(instance.state == InstanceState::Running, || {
            format!("expected running, got {}", instance.state)
        }),
        other => Err(StepError::Assertion(format!("expected a launch, got {other:?}"))),
    }
}

#[then("the image was looked up for zone \"{zone}\"")]
fn image_zone(fleet_context: &FleetContext, zone: String) -> Result<(), StepError> {
    let lookups = fleet_context.provider.image_lookups();
    expect(
        lookups
            .iter()
            .all(|(_, looked_up)| looked_up.as_deref() == Some(zone.trim()))
            && !lookups.is_empty(),
        || format!("expected lookups in {zone}, got {lookups:?}"),
    )
}

#[then("the launch used the image \"{image}\"")]
fn launch_image(fleet_context: &FleetContext, image: String) -> Result<(), StepError> {
    let specs = fleet_context.provider.create_specs();
    expect(
        specs.iter().any(|spec| spec.image_id == image.trim()),
        || format!("expected image {image}, got {specs:?} ({:?})", fleet_context.outcome),
    )
}

#[then("{count:u32} instances are registered with \"{name}\"")]
fn registered(fleet_context: &FleetContext, count: u32, name: String) -> Result<(), StepError> {
    let registrations = fleet_context.provider.registrations();
    let registered: usize = registrations
        .iter()
        .filter(|(load_balancer, _)| load_balancer == name.trim())
        .map(|(_, ids)| ids.len())
        .sum();
    expect(registered == as_len(count), || {
        format!("expected {count} registrations, got {registrations:?}")
    })
}

#[then("\"{filter}\" resolves to {count:u32} hostnames")]
fn hostnames(fleet_context: &FleetContext, filter: String, count: u32) -> Result<(), StepError> {
    let fleet = fleet_context.fleet();
    let hosts = block_on(async { fleet.hostnames(&Filter::parse(filter.trim())).await })
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    expect(hosts.len() == as_len(count), || {
        format!("expected {count} hostnames, got {hosts:?}")
    })
}

#[then("{count:u32} host failures are reported")]
fn host_failures(fleet_context: &FleetContext, count: u32) -> Result<(), StepError> {
    match outcome(fleet_context)? {
        Outcome::Executed { failures } => expect(*failures == as_len(count), || {
            format!("expected {count} failures, got {failures}")
        }),
        other => Err(StepError::Assertion(format!("expected an exec, got {other:?}"))),
    }
}

#[then("the terminated instance is shutting down")]
fn shutting_down(fleet_context: &FleetContext) -> Result<(), StepError> {
    match outcome(fleet_context)? {
        Outcome::Terminated(Some(instance)) => {
            expect(instance.state == InstanceState::ShuttingDown, || {
                format!("expected shutting-down, got {}", instance.state)
            })
        }
        other => Err(StepError::Assertion(format!(
            "expected a terminated instance, got {other:?}"
        ))),
    }
}

#[then("the lookup fails with \"{message}\"")]
fn lookup_fails(fleet_context: &FleetContext, message: String) -> Result<(), StepError> {
    match outcome(fleet_context)? {
        Outcome::Failed(actual) => expect(actual == message.trim(), || {
            format!("expected `{message}`, got `{actual}`")
        }),
        other => Err(StepError::Assertion(format!("expected a failure, got {other:?}"))),
    }
}

//! BDD scenarios for fleet operations.

use rstest_bdd_macros::scenario;

use super::test_helpers::{FleetContext, fleet_context};

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Launch clones the template into the load balancer's zone"
)]
fn scenario_launch_behind_load_balancer(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Names shaped like addresses still supply launch defaults"
)]
fn scenario_dotted_template_name(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Collect-all reports every failing host"
)]
fn scenario_collect_all(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Terminate reports the transitional state"
)]
fn scenario_terminate(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "A failed catalogue lookup is surfaced verbatim"
)]
fn scenario_catalogue_failure(fleet_context: FleetContext) {
    let _ = fleet_context;
}

//! Shared fixtures and helpers for fleet scenarios.

use std::future::Future;

use armada::test_support::{ScriptedProvider, ScriptedShell};
use armada::{Fleet, Instance};
use rstest::fixture;

/// What the last `when` step produced.
#[derive(Clone, Debug)]
pub enum Outcome {
    Launched(Instance),
    Executed { failures: usize },
    Terminated(Option<Instance>),
    Described,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct FleetContext {
    pub provider: ScriptedProvider,
    pub shell: ScriptedShell,
    pub outcome: Option<Outcome>,
}

impl FleetContext {
    pub fn fleet(&self) -> Fleet<ScriptedProvider, ScriptedShell> {
        Fleet::new(self.provider.clone(), self.shell.clone())
    }
}

#[fixture]
pub fn fleet_context() -> FleetContext {
    FleetContext {
        provider: ScriptedProvider::new(),
        shell: ScriptedShell::new(),
        outcome: None,
    }
}

/// Runs `future` on a paused current-thread runtime so launch polling does
/// not sleep in real time.
pub fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap_or_else(|err| panic!("tokio runtime should start: {err}"))
        .block_on(future)
}

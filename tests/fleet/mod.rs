//! Fleet scenarios, their steps, and shared fixtures.

mod bdd_steps;
mod scenarios;
mod test_helpers;

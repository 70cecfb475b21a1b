//! BDD scenarios for the lifecycle driver.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Host becomes active after a few polls"
)]
fn scenario_host_becomes_active(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Give up when the attempt budget runs out"
)]
fn scenario_attempt_budget(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Stop polling when the host fails"
)]
fn scenario_host_fails(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Delete the host when interrupted"
)]
fn scenario_delete_on_interrupt(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

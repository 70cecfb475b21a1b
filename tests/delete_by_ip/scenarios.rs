//! BDD scenarios for delete-by-IP.

use rstest_bdd_macros::scenario;

use super::test_helpers::{DeleteContext, delete_context};

#[scenario(
    path = "tests/features/delete_by_ip.feature",
    name = "Resolve the IP among tagged droplets"
)]
fn scenario_resolve_ip(delete_context: DeleteContext) {
    let _ = delete_context;
}

#[scenario(
    path = "tests/features/delete_by_ip.feature",
    name = "Unknown IP deletes nothing"
)]
fn scenario_unknown_ip(delete_context: DeleteContext) {
    let _ = delete_context;
}

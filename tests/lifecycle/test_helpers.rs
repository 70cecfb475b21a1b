//! Shared fixtures for lifecycle BDD scenarios.

use std::time::Duration;

use rstest::fixture;
use waystation::lifecycle::{LifecycleConfig, RunOutcome};
use waystation::test_support::FakeProvisioner;

/// Host id handed out by the scripted provider.
pub const HOST_ID: &str = "droplet-42";

/// Public address the scripted provider reports once active.
pub const HOST_IP: &str = "203.0.113.10";

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub provisioner: FakeProvisioner,
    pub config: LifecycleConfig,
    pub outcome: Option<Result<RunOutcome, String>>,
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    LifecycleContext {
        provisioner: FakeProvisioner::new(),
        config: LifecycleConfig {
            poll_interval: Duration::from_millis(5),
            max_attempts: 20,
            delete_on_cancel: false,
            teardown_timeout: Duration::from_secs(5),
        },
        outcome: None,
    }
}

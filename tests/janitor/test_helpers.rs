//! Shared fixtures and helpers for janitor BDD scenarios.

use rstest::fixture;
use waystation::host::{HostStatus, ProvisionedHost};
use waystation::janitor::{JanitorConfig, SweepSummary};
use waystation::provider::ProviderKind;
use waystation::test_support::FakeProvisioner;

#[derive(Clone, Debug)]
pub enum SweepOutcome {
    Success(SweepSummary),
    Failure(String),
}

#[derive(Clone, Debug)]
pub struct JanitorContext {
    pub config: Option<JanitorConfig>,
    pub provisioner: FakeProvisioner,
    pub outcome: Option<SweepOutcome>,
}

#[fixture]
pub fn janitor_context() -> JanitorContext {
    JanitorContext {
        config: None,
        provisioner: FakeProvisioner::new(),
        outcome: None,
    }
}

pub fn build_config(provider: &str) -> JanitorConfig {
    let kind = provider
        .parse::<ProviderKind>()
        .unwrap_or_else(|err| panic!("provider should parse: {err}"));
    JanitorConfig::new(kind, None, None, None)
        .unwrap_or_else(|err| panic!("janitor config should be valid: {err}"))
}

/// Builds active exit nodes from a comma-separated id list.
pub fn exit_nodes(ids: &str) -> Vec<ProvisionedHost> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .enumerate()
        .map(|(index, id)| {
            ProvisionedHost::observed(id, format!("203.0.113.{}", index + 1), HostStatus::Active)
        })
        .collect()
}

//! BDD step definitions for janitor behaviour.

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use waystation::janitor::Janitor;

use super::test_helpers::{JanitorContext, SweepOutcome, build_config, exit_nodes};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a configured janitor for \"{provider}\"")]
fn configured_janitor(mut janitor_context: JanitorContext, provider: String) -> JanitorContext {
    janitor_context.config = Some(build_config(provider.trim()));
    janitor_context
}

#[given("the provider lists exit nodes \"{ids}\"")]
fn lists_exit_nodes(janitor_context: JanitorContext, ids: String) -> JanitorContext {
    janitor_context.provisioner.set_listed(exit_nodes(&ids));
    janitor_context.provisioner.remove_deleted_hosts();
    janitor_context
}

#[given("the provider lists exit nodes \"{ids}\" that survive deletion")]
fn lists_surviving_exit_nodes(janitor_context: JanitorContext, ids: String) -> JanitorContext {
    janitor_context.provisioner.set_listed(exit_nodes(&ids));
    janitor_context
}

#[when("I run the janitor sweep")]
fn run_sweep(mut janitor_context: JanitorContext) -> Result<JanitorContext, StepError> {
    let config = janitor_context
        .config
        .clone()
        .unwrap_or_else(|| panic!("test setup requires configured janitor"));
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let janitor = Janitor::new(config, janitor_context.provisioner.clone());
    janitor_context.outcome = Some(match runtime.block_on(janitor.sweep()) {
        Ok(summary) => SweepOutcome::Success(summary),
        Err(err) => SweepOutcome::Failure(err.to_string()),
    });
    Ok(janitor_context)
}

#[then("the janitor reports deleting {hosts} hosts")]
fn reports_deletions(janitor_context: &JanitorContext, hosts: usize) -> Result<(), StepError> {
    let Some(outcome) = janitor_context.outcome.as_ref() else {
        return Err(StepError::Assertion(String::from("missing outcome")));
    };
    let SweepOutcome::Success(summary) = outcome else {
        return Err(StepError::Assertion(format!(
            "expected success, got: {outcome:?}"
        )));
    };
    if summary.deleted_hosts == hosts && janitor_context.provisioner.deleted().len() == hosts {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {hosts} deleted hosts, got {summary:?}"
        )))
    }
}

#[then("the janitor reports a not-clean error")]
fn reports_not_clean(janitor_context: &JanitorContext) -> Result<(), StepError> {
    let Some(outcome) = janitor_context.outcome.as_ref() else {
        return Err(StepError::Assertion(String::from("missing outcome")));
    };
    let SweepOutcome::Failure(message) = outcome else {
        return Err(StepError::Assertion(String::from(
            "expected sweep to fail, got success",
        )));
    };
    if message.contains("hosts remain after janitor sweep") {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected not-clean error, got: {message}"
        )))
    }
}

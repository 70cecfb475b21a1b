//! BDD step definitions for the lifecycle driver.

use std::future::{pending, ready};

use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use waystation::host::{HostDescriptor, HostStatus, ProvisionedHost};
use waystation::lifecycle::{LifecycleDriver, RunOutcome};

use super::test_helpers::{HOST_ID, HOST_IP, LifecycleContext};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a provider that reports the host as creating for {polls} polls")]
fn creating_for(lifecycle_context: LifecycleContext, polls: usize) -> LifecycleContext {
    let fake = &lifecycle_context.provisioner;
    fake.push_provisioned(Ok(ProvisionedHost::creating(HOST_ID)));
    for _ in 0..polls {
        fake.push_status(HOST_ID, "", HostStatus::Creating);
    }
    fake.push_status(HOST_ID, HOST_IP, HostStatus::Active);
    lifecycle_context
}

#[given("a provider that never finishes creating")]
fn never_finishes(lifecycle_context: LifecycleContext) -> LifecycleContext {
    let fake = &lifecycle_context.provisioner;
    fake.push_provisioned(Ok(ProvisionedHost::creating(HOST_ID)));
    fake.push_status(HOST_ID, "", HostStatus::Creating);
    lifecycle_context
}

#[given("a provider that reports the host as failed")]
fn reports_failed(lifecycle_context: LifecycleContext) -> LifecycleContext {
    let fake = &lifecycle_context.provisioner;
    fake.push_provisioned(Ok(ProvisionedHost::creating(HOST_ID)));
    fake.push_status(HOST_ID, "", HostStatus::Error);
    lifecycle_context
}

#[given("an attempt budget of {attempts}")]
fn attempt_budget(mut lifecycle_context: LifecycleContext, attempts: u32) -> LifecycleContext {
    lifecycle_context.config.max_attempts = attempts;
    lifecycle_context
}

#[given("the host is deleted when interrupted")]
fn delete_on_cancel(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.config.delete_on_cancel = true;
    lifecycle_context
}

fn descriptor(name: &str, region: &str, plan: &str) -> Result<HostDescriptor, StepError> {
    HostDescriptor::builder()
        .name(name.trim())
        .region(region.trim())
        .plan(plan.trim())
        .os_image("ubuntu-22-04-x64")
        .boot_script("#!/bin/bash\n")
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))
}

fn drive(
    mut lifecycle_context: LifecycleContext,
    descriptor: &HostDescriptor,
    interrupt: bool,
) -> Result<LifecycleContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let driver = LifecycleDriver::new(
        lifecycle_context.provisioner.clone(),
        lifecycle_context.config,
    );
    let result = runtime.block_on(async {
        if interrupt {
            driver.run(descriptor, ready(())).await
        } else {
            driver.run(descriptor, pending()).await
        }
    });
    lifecycle_context.outcome = Some(result.map_err(|err| err.to_string()));
    Ok(lifecycle_context)
}

#[when("I create the exit node \"{name}\" in \"{region}\" with plan \"{plan}\"")]
fn create(
    lifecycle_context: LifecycleContext,
    name: String,
    region: String,
    plan: String,
) -> Result<LifecycleContext, StepError> {
    let descriptor = descriptor(&name, &region, &plan)?;
    drive(lifecycle_context, &descriptor, false)
}

#[when("I create the exit node \"{name}\" in \"{region}\" with plan \"{plan}\" and interrupt it")]
fn create_and_interrupt(
    lifecycle_context: LifecycleContext,
    name: String,
    region: String,
    plan: String,
) -> Result<LifecycleContext, StepError> {
    let descriptor = descriptor(&name, &region, &plan)?;
    drive(lifecycle_context, &descriptor, true)
}

fn outcome(lifecycle_context: &LifecycleContext) -> Result<&Result<RunOutcome, String>, StepError> {
    lifecycle_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

#[then("the host is active at \"{ip}\"")]
fn host_active(lifecycle_context: &LifecycleContext, ip: String) -> Result<(), StepError> {
    match outcome(lifecycle_context)? {
        Ok(RunOutcome::Active(host)) if host.ip == ip.trim() && host.id == HOST_ID => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected active host at {ip}, got {other:?}"
        ))),
    }
}

#[then("the provider was polled {count} times")]
fn polled(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let calls = lifecycle_context.provisioner.status_calls();
    if calls == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} status calls, got {calls}"
        )))
    }
}

#[then("the host was created once")]
fn created_once(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let descriptors = lifecycle_context.provisioner.descriptors();
    match descriptors.as_slice() {
        [only] if only.name == "test-vm" && only.region == "lon1" && only.plan == "512mb" => {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected one provision call for test-vm, got {other:?}"
        ))),
    }
}

#[then("the run fails after {attempts} attempts")]
fn fails_after(lifecycle_context: &LifecycleContext, attempts: u32) -> Result<(), StepError> {
    let expected = format!("not active after {attempts} attempts");
    match outcome(lifecycle_context)? {
        Err(message) if message.contains(&expected) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected timeout after {attempts} attempts, got {other:?}"
        ))),
    }
}

#[then("the run fails because the host failed")]
fn fails_host_failed(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match outcome(lifecycle_context)? {
        Err(message) if message.contains("failed with status error") => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected host failure, got {other:?}"
        ))),
    }
}

#[then("the run was cancelled")]
fn run_cancelled(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match outcome(lifecycle_context)? {
        Ok(RunOutcome::Cancelled { deleted: true, .. }) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected cancelled run with deletion, got {other:?}"
        ))),
    }
}

#[then("the host was deleted")]
fn host_deleted(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let deleted = lifecycle_context.provisioner.deleted();
    match deleted.as_slice() {
        [request] if request.id() == Some(HOST_ID) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a single delete of {HOST_ID}, got {other:?}"
        ))),
    }
}

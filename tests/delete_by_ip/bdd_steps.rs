//! BDD step definitions for delete-by-IP.

use rstest_bdd_macros::{given, then, when};
use serde_json::json;
use tokio::runtime::Runtime;
use waystation::host::HostDeleteRequest;
use waystation::provider::Provisioner;
use waystation::provider::digitalocean::DigitalOceanProvisioner;

use super::test_helpers::{DeleteContext, droplet, parse_droplets};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("DigitalOcean lists droplets \"{droplets}\"")]
fn lists_droplets(delete_context: DeleteContext, droplets: String) -> DeleteContext {
    let listed = parse_droplets(&droplets)
        .iter()
        .map(|(id, ip)| droplet(*id, ip))
        .collect::<Vec<_>>();
    delete_context
        .transport
        .push_json(200, &json!({"droplets": listed, "links": {}}));
    delete_context.transport.push_status(204);
    delete_context
}

#[when("I delete the host with IP \"{ip}\"")]
fn delete_by_ip(mut delete_context: DeleteContext, ip: String) -> Result<DeleteContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let adapter = DigitalOceanProvisioner::new(delete_context.transport.clone());
    let request = HostDeleteRequest::by_ip(ip.trim());
    let result = runtime.block_on(async { adapter.delete(&request).await });
    delete_context.outcome = Some(result.map_err(|err| err.to_string()));
    Ok(delete_context)
}

#[then("droplet \"{id}\" is deleted")]
fn droplet_deleted(delete_context: &DeleteContext, id: String) -> Result<(), StepError> {
    if let Some(Err(message)) = &delete_context.outcome {
        return Err(StepError::Assertion(format!("delete failed: {message}")));
    }
    let expected = format!("DELETE /droplets/{}", id.trim());
    let calls = delete_context.transport.calls();
    if calls.last() == Some(&expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected} as the final call, got {calls:?}"
        )))
    }
}

#[then("the delete fails with no host for \"{ip}\"")]
fn fails_no_host(delete_context: &DeleteContext, ip: String) -> Result<(), StepError> {
    match &delete_context.outcome {
        Some(Err(message)) if message.contains(&format!("no host with ip: {}", ip.trim())) => {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected missing-host error, got {other:?}"
        ))),
    }
}

#[then("no droplet is deleted")]
fn nothing_deleted(delete_context: &DeleteContext) -> Result<(), StepError> {
    let calls = delete_context.transport.calls();
    if calls.iter().any(|call| call.starts_with("DELETE")) {
        Err(StepError::Assertion(format!("unexpected delete in {calls:?}")))
    } else {
        Ok(())
    }
}

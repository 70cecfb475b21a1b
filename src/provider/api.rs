//! Request helpers that turn transport results into [`ProvisionError`]s.

use serde::de::DeserializeOwned;

use super::ProvisionError;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Sends `request`, mapping 404 to [`ProvisionError::NotFound`] and any other
/// non-2xx status to [`ProvisionError::ProviderApi`].
pub(crate) async fn send<T: Transport + ?Sized>(
    transport: &T,
    request: ApiRequest,
    operation: &str,
    resource: &str,
) -> Result<ApiResponse, ProvisionError> {
    let response = transport
        .send(request)
        .await
        .map_err(|err| ProvisionError::transport(operation, resource, &err))?;
    if response.is_not_found() {
        return Err(ProvisionError::NotFound {
            resource: resource.to_owned(),
        });
    }
    if !response.is_success() {
        return Err(ProvisionError::api(
            operation,
            resource,
            format!("HTTP {}: {}", response.status, response.body.trim()),
        ));
    }
    Ok(response)
}

/// Sends `request` and decodes the JSON body.
pub(crate) async fn send_json<R, T>(
    transport: &T,
    request: ApiRequest,
    operation: &str,
    resource: &str,
) -> Result<R, ProvisionError>
where
    R: DeserializeOwned,
    T: Transport + ?Sized,
{
    let response = send(transport, request, operation, resource).await?;
    response.json().map_err(|err| {
        ProvisionError::api(operation, resource, format!("unexpected response: {err}"))
    })
}

/// Sends a delete that succeeds when the resource is already gone.
pub(crate) async fn delete_if_present<T: Transport + ?Sized>(
    transport: &T,
    request: ApiRequest,
    operation: &str,
    resource: &str,
) -> Result<(), ProvisionError> {
    match send(transport, request, operation, resource).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Reports whether `request` resolves to an existing resource.
pub(crate) async fn exists<T: Transport + ?Sized>(
    transport: &T,
    request: ApiRequest,
    operation: &str,
    resource: &str,
) -> Result<bool, ProvisionError> {
    match send(transport, request, operation, resource).await {
        Ok(_) => Ok(true),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err),
    }
}

/// Runs `rollback` after `original` failed, folding both errors together
/// when the cleanup also fails.
pub(crate) async fn rollback<F>(original: ProvisionError, rollback: F) -> ProvisionError
where
    F: Future<Output = Result<(), ProvisionError>>,
{
    match rollback.await {
        Ok(()) => original,
        Err(cleanup) => {
            tracing::warn!(error = %cleanup, "rollback after failed provision did not complete");
            original.with_rollback_failure(&cleanup)
        }
    }
}

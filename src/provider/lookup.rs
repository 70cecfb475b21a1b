//! Delete-by-IP support: find a host identifier from its public address.

use tracing::debug;

use super::{ProvisionError, Provisioner};
use crate::host::{HostDeleteRequest, ListFilter, ProvisionedHost};

/// Returns the identifier of the first host whose IP equals `ip`.
///
/// # Errors
///
/// Returns [`ProvisionError::NoHostWithIp`] when nothing matches.
pub fn resolve_id(hosts: &[ProvisionedHost], ip: &str) -> Result<String, ProvisionError> {
    let wanted = ip.trim();
    hosts
        .iter()
        .find(|host| !host.ip.is_empty() && host.ip == wanted)
        .map(|host| host.id.clone())
        .ok_or_else(|| ProvisionError::NoHostWithIp {
            ip: wanted.to_owned(),
        })
}

/// Lists hosts with `filter` and resolves `ip` among them.
///
/// # Errors
///
/// Propagates list failures and returns [`ProvisionError::NoHostWithIp`]
/// when no listed host carries the address.
pub async fn resolve_by_ip<P: Provisioner + ?Sized>(
    provisioner: &P,
    filter: &ListFilter,
    ip: &str,
) -> Result<String, ProvisionError> {
    let hosts = provisioner.list(filter).await?;
    debug!(candidates = hosts.len(), ip, "resolving host by IP");
    resolve_id(&hosts, ip)
}

/// Returns the identifier a delete request addresses, listing hosts with the
/// provider's exit-node `marker` when only an IP was given.
///
/// # Errors
///
/// Returns [`ProvisionError::Configuration`] when the request carries neither
/// an identifier nor an IP, and the lookup errors of [`resolve_by_ip`].
pub async fn target_id<P: Provisioner + ?Sized>(
    provisioner: &P,
    request: &HostDeleteRequest,
    marker: &str,
) -> Result<String, ProvisionError> {
    request.validate()?;
    if let Some(id) = request.id() {
        return Ok(id.to_owned());
    }
    let ip = request.ip().unwrap_or_default();
    resolve_by_ip(provisioner, &request.list_filter(marker), ip).await
}

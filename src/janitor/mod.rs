//! Exit-node janitor.
//!
//! Lists every host carrying the provider's exit-node marker and deletes
//! them one by one, failing if anything remains afterwards. Useful after an
//! interrupted run or an integration test that provisioned real machines.

use thiserror::Error;
use tracing::{info, warn};

use crate::host::{HostDeleteRequest, ListFilter, ProvisionedHost};
use crate::provider::{ProviderKind, ProvisionError, Provisioner};

/// Configuration for a janitor sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JanitorConfig {
    /// Provider to sweep.
    pub provider: ProviderKind,
    /// Project scope for providers that need one.
    pub project_id: Option<String>,
    /// Zone scope for zonal providers.
    pub zone: Option<String>,
    /// Region scope for regional providers.
    pub region: Option<String>,
}

impl JanitorConfig {
    /// Constructs a config, dropping blank scope values.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::InvalidConfig`] when the provider needs a
    /// project id and none is given.
    pub fn new(
        provider: ProviderKind,
        project_id: Option<String>,
        zone: Option<String>,
        region: Option<String>,
    ) -> Result<Self, JanitorError> {
        let trim = |value: Option<String>| {
            value
                .map(|inner| inner.trim().to_owned())
                .filter(|inner| !inner.is_empty())
        };
        let config = Self {
            provider,
            project_id: trim(project_id),
            zone: trim(zone),
            region: trim(region),
        };
        if provider.requires_project_id() && config.project_id.is_none() {
            return Err(JanitorError::InvalidConfig {
                field: String::from("project_id"),
            });
        }
        Ok(config)
    }

    /// Filter selecting this tool's exit nodes within the configured scope.
    #[must_use]
    pub fn filter(&self) -> ListFilter {
        ListFilter::exit_nodes(self.provider)
            .with_project_id(self.project_id.clone())
            .with_zone(self.zone.clone())
            .with_region(self.region.clone())
    }

    fn delete_request(&self, host: &ProvisionedHost) -> HostDeleteRequest {
        HostDeleteRequest::by_id(host.id.clone())
            .with_project_id(self.project_id.clone())
            .with_zone(self.zone.clone())
            .with_region(self.region.clone())
    }
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Hosts deleted during the sweep.
    pub deleted_hosts: usize,
    /// Hosts that had already disappeared when deleted.
    pub already_gone: usize,
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JanitorError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}")]
    InvalidConfig {
        /// Name of the missing or invalid field.
        field: String,
    },
    /// Raised when listing hosts fails.
    #[error("failed to list exit nodes: {0}")]
    List(#[source] ProvisionError),
    /// Raised when deleting a host fails.
    #[error("failed to delete {id}: {source}")]
    Delete {
        /// Host that could not be deleted.
        id: String,
        /// Adapter error.
        #[source]
        source: ProvisionError,
    },
    /// Raised when hosts remain after the sweep.
    #[error("hosts remain after janitor sweep: {message}")]
    NotClean {
        /// Human-readable description of what remains.
        message: String,
    },
}

/// Deletes every exit node a provider reports.
#[derive(Clone, Debug)]
pub struct Janitor<P> {
    config: JanitorConfig,
    provisioner: P,
}

impl<P: Provisioner> Janitor<P> {
    /// Creates a new janitor using the provided configuration and adapter.
    #[must_use]
    pub const fn new(config: JanitorConfig, provisioner: P) -> Self {
        Self {
            config,
            provisioner,
        }
    }

    /// Lists the hosts a sweep would delete.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::List`] when the provider cannot be listed.
    pub async fn candidates(&self) -> Result<Vec<ProvisionedHost>, JanitorError> {
        self.provisioner
            .list(&self.config.filter())
            .await
            .map_err(JanitorError::List)
    }

    /// Performs a sweep and returns how many hosts were deleted.
    ///
    /// Hosts are deleted in listing order. A host that vanished between the
    /// listing and its delete is counted separately rather than failing the
    /// sweep.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError`] when listing or a delete fails, or when hosts
    /// remain after deletion.
    pub async fn sweep(&self) -> Result<SweepSummary, JanitorError> {
        let mut summary = SweepSummary::default();
        for host in self.candidates().await? {
            match self
                .provisioner
                .delete(&self.config.delete_request(&host))
                .await
            {
                Ok(()) => {
                    info!(provider = %self.config.provider, id = %host.id, ip = %host.ip, "deleted exit node");
                    summary.deleted_hosts += 1;
                }
                Err(err) if err.is_not_found() => {
                    warn!(provider = %self.config.provider, id = %host.id, "exit node already gone");
                    summary.already_gone += 1;
                }
                Err(source) => {
                    return Err(JanitorError::Delete {
                        id: host.id,
                        source,
                    });
                }
            }
        }

        let remaining = self.candidates().await?;
        if !remaining.is_empty() {
            let ids = remaining
                .iter()
                .map(|host| host.id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(JanitorError::NotClean {
                message: format!("{} remaining: {ids}", remaining.len()),
            });
        }

        Ok(summary)
    }
}

//! Drives one host from creation to `active`, and tears it down on request.
//!
//! The driver provisions through any [`Provisioner`], then polls `status` on
//! a fixed interval for a bounded number of attempts. Status errors stop the
//! loop at once; they usually mean bad credentials or a wrong identifier and
//! retrying would only burn the attempt budget. A caller-supplied
//! cancellation future can interrupt the wait, optionally deleting the host
//! so an aborted run does not leave a billable machine behind.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::host::{HostDeleteRequest, HostDescriptor, HostStatus, ProvisionedHost};
use crate::provider::{ProvisionError, Provisioner};

/// Default delay between status probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default number of status probes before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 500;
/// Default bound on a teardown triggered by the driver.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(600);

/// Polling and teardown settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecycleConfig {
    /// Delay before each status probe.
    pub poll_interval: Duration,
    /// Status probes allowed before [`LifecycleError::TimeoutExceeded`].
    pub max_attempts: u32,
    /// Deletes the host when the run is cancelled.
    pub delete_on_cancel: bool,
    /// Upper bound on a delete issued by the driver.
    pub teardown_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delete_on_cancel: false,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

/// Errors surfaced by [`LifecycleDriver`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised when the provider rejects the create request.
    #[error("failed to provision host: {0}")]
    Provision(#[source] ProvisionError),
    /// Raised when a status probe fails.
    #[error("failed to read host status: {0}")]
    Status(#[source] ProvisionError),
    /// Raised when the provider reports the host as failed.
    #[error("host {id} failed with status {status}")]
    HostFailed {
        /// Host identifier.
        id: String,
        /// Status that ended the wait.
        status: HostStatus,
    },
    /// Raised when the attempt budget runs out before the host is active.
    #[error("host {id} not active after {attempts} attempts (last status: {last_status})")]
    TimeoutExceeded {
        /// Host identifier.
        id: String,
        /// Probes performed.
        attempts: u32,
        /// Status seen on the final probe.
        last_status: HostStatus,
    },
    /// Raised when deleting the host fails.
    #[error("failed to delete host: {0}")]
    Teardown(#[source] ProvisionError),
    /// Raised when deleting the host does not finish in time.
    #[error("deleting host {id} did not finish within {seconds}s")]
    TeardownTimedOut {
        /// Host identifier or IP.
        id: String,
        /// Timeout that elapsed.
        seconds: u64,
    },
}

/// How a [`LifecycleDriver::run`] ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// The host reached `active`.
    Active(ProvisionedHost),
    /// The cancellation signal fired before the host was active.
    Cancelled {
        /// Host as returned by `provision`.
        host: ProvisionedHost,
        /// Whether the driver deleted the host.
        deleted: bool,
    },
}

/// Provision, poll and teardown over a [`Provisioner`].
#[derive(Debug)]
pub struct LifecycleDriver<P> {
    provisioner: P,
    config: LifecycleConfig,
}

impl<P: Provisioner> LifecycleDriver<P> {
    /// Creates a driver.
    #[must_use]
    pub const fn new(provisioner: P, config: LifecycleConfig) -> Self {
        Self {
            provisioner,
            config,
        }
    }

    /// Returns the wrapped provisioner.
    #[must_use]
    pub const fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Issues the create request. Never retried.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provision`] when the adapter fails.
    pub async fn provision(
        &self,
        descriptor: &HostDescriptor,
    ) -> Result<ProvisionedHost, LifecycleError> {
        info!(name = %descriptor.name, region = %descriptor.zone_or_region(), "provisioning host");
        let host = self
            .provisioner
            .provision(descriptor)
            .await
            .map_err(LifecycleError::Provision)?;
        info!(id = %host.id, status = %host.status, "host requested");
        Ok(host)
    }

    /// Polls until the host is active.
    ///
    /// Each attempt sleeps for the poll interval and then reads the status,
    /// so a host that turns active on the Nth probe costs exactly N calls.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Status`] on the first failed probe,
    /// [`LifecycleError::HostFailed`] when the provider reports an error and
    /// [`LifecycleError::TimeoutExceeded`] once every attempt is spent.
    pub async fn wait_until_active(
        &self,
        host: &ProvisionedHost,
    ) -> Result<ProvisionedHost, LifecycleError> {
        let mut last_status = host.status.clone();
        for attempt in 1..=self.config.max_attempts {
            sleep(self.config.poll_interval).await;
            let current = self
                .provisioner
                .status(&host.id)
                .await
                .map_err(LifecycleError::Status)?;
            debug!(id = %host.id, attempt, status = %current.status, ip = %current.ip, "status probe");
            if current.status.is_active() {
                info!(id = %current.id, ip = %current.ip, attempt, "host active");
                return Ok(current);
            }
            if current.status.is_failed() {
                return Err(LifecycleError::HostFailed {
                    id: host.id.clone(),
                    status: current.status,
                });
            }
            last_status = current.status;
        }
        Err(LifecycleError::TimeoutExceeded {
            id: host.id.clone(),
            attempts: self.config.max_attempts,
            last_status,
        })
    }

    /// Provisions `descriptor` and waits for it, racing the wait against
    /// `cancel`.
    ///
    /// The create request itself is not raced so a cancellation never
    /// abandons a half-submitted create. When `cancel` wins and
    /// `delete_on_cancel` is set the host is deleted before returning.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::provision`], [`Self::wait_until_active`]
    /// and [`Self::teardown`].
    pub async fn run<C>(
        &self,
        descriptor: &HostDescriptor,
        cancel: C,
    ) -> Result<RunOutcome, LifecycleError>
    where
        C: Future<Output = ()>,
    {
        let host = self.provision(descriptor).await?;
        tokio::select! {
            result = self.wait_until_active(&host) => result.map(RunOutcome::Active),
            () = cancel => self.cancelled(host, descriptor).await,
        }
    }

    async fn cancelled(
        &self,
        host: ProvisionedHost,
        descriptor: &HostDescriptor,
    ) -> Result<RunOutcome, LifecycleError> {
        if !self.config.delete_on_cancel {
            warn!(id = %host.id, "interrupted; host left running");
            return Ok(RunOutcome::Cancelled {
                host,
                deleted: false,
            });
        }
        warn!(id = %host.id, "interrupted; deleting host");
        self.teardown(&HostDeleteRequest::for_host(&host, descriptor))
            .await?;
        Ok(RunOutcome::Cancelled {
            host,
            deleted: true,
        })
    }

    /// Keeps an active host until `cancel` fires, then deletes it.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::teardown`].
    pub async fn hold_until_cancelled<C>(
        &self,
        host: &ProvisionedHost,
        descriptor: &HostDescriptor,
        cancel: C,
    ) -> Result<(), LifecycleError>
    where
        C: Future<Output = ()>,
    {
        info!(id = %host.id, "holding host until interrupted");
        cancel.await;
        self.teardown(&HostDeleteRequest::for_host(host, descriptor))
            .await
    }

    /// Deletes a host, bounded by the teardown timeout. A host that is
    /// already gone counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Teardown`] when the adapter fails and
    /// [`LifecycleError::TeardownTimedOut`] when it does not finish in time.
    pub async fn teardown(&self, request: &HostDeleteRequest) -> Result<(), LifecycleError> {
        let target = request.id().or_else(|| request.ip()).unwrap_or_default().to_owned();
        match timeout(self.config.teardown_timeout, self.provisioner.delete(request)).await {
            Ok(Ok(())) => {
                info!(target = %target, "host deleted");
                Ok(())
            }
            Ok(Err(err)) if err.is_not_found() => {
                warn!(target = %target, "host already gone");
                Ok(())
            }
            Ok(Err(err)) => Err(LifecycleError::Teardown(err)),
            Err(_) => Err(LifecycleError::TeardownTimedOut {
                id: target,
                seconds: self.config.teardown_timeout.as_secs(),
            }),
        }
    }
}

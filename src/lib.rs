//! Core library for the waystation exit-node provisioner.
//!
//! The crate exposes a uniform [`Provisioner`] contract over eleven cloud
//! providers, a lifecycle driver that creates a host and polls it until it is
//! active, and the supporting pieces the CLI needs: layered configuration,
//! credential resolution, bootstrap script rendering and a janitor that
//! sweeps leftover exit nodes.

pub mod bootstrap;
pub mod composite_id;
pub mod config;
pub mod host;
pub mod janitor;
pub mod lifecycle;
pub mod names;
pub mod password;
pub mod provider;
pub mod secret;
pub mod test_support;
pub mod transport;

pub use bootstrap::{BootstrapError, BootstrapRequest};
pub use config::{ConfigError, Settings};
pub use host::{
    HostDeleteRequest, HostDescriptor, HostDescriptorBuilder, HostStatus, ListFilter,
    ProvisionedHost,
};
pub use janitor::{Janitor, JanitorConfig, JanitorError, SweepSummary};
pub use lifecycle::{LifecycleConfig, LifecycleDriver, LifecycleError, RunOutcome};
pub use provider::{
    Adapter, ProviderKind, ProvisionError, ProvisionFuture, Provisioner, ProvisionerRequest,
    WaitPolicy,
};
pub use secret::{SecretError, SecretSource};

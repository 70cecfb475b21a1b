//! Provider abstraction and the per-vendor adapters behind it.
//!
//! Every adapter implements [`Provisioner`]: create a host, read its status,
//! delete it by identifier or public IP, and list the hosts this tool created.
//! [`Adapter`] selects an implementation at runtime from a [`ProviderKind`].

mod api;
pub mod azure;
pub mod civo;
pub mod digitalocean;
pub mod ec2;
pub mod equinix;
mod error;
pub mod gce;
pub mod hetzner;
pub mod linode;
pub mod lookup;
pub mod ovh;
pub mod scaleway;
pub mod vultr;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::host::{HostDeleteRequest, HostDescriptor, ListFilter, ProvisionedHost};
use crate::transport::{Auth, AzureCredentials, HttpTransport, OvhCredentials};

pub use error::ProvisionError;

/// Future returned by provider operations.
pub type ProvisionFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisionError>> + Send + 'a>>;

/// Uniform contract implemented by every provider adapter.
pub trait Provisioner: Send + Sync {
    /// Requests a new host. Returns as soon as the provider accepted the
    /// request; the host is usually still `Creating`.
    fn provision<'a>(&'a self, descriptor: &'a HostDescriptor)
    -> ProvisionFuture<'a, ProvisionedHost>;

    /// Reads the current state of a host.
    fn status<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, ProvisionedHost>;

    /// Deletes a host and every auxiliary resource created alongside it.
    fn delete<'a>(&'a self, request: &'a HostDeleteRequest) -> ProvisionFuture<'a, ()>;

    /// Lists hosts matching `filter`, following provider pagination.
    fn list<'a>(&'a self, filter: &'a ListFilter) -> ProvisionFuture<'a, Vec<ProvisionedHost>>;
}

/// Supported cloud providers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProviderKind {
    /// `DigitalOcean` droplets.
    DigitalOcean,
    /// Amazon EC2 instances.
    Ec2,
    /// Google Compute Engine instances.
    Gce,
    /// Azure resource-group deployments.
    Azure,
    /// Scaleway instances.
    Scaleway,
    /// Civo instances.
    Civo,
    /// Equinix Metal (formerly Packet) devices.
    Equinix,
    /// Hetzner Cloud servers.
    Hetzner,
    /// Vultr instances.
    Vultr,
    /// Linode instances.
    Linode,
    /// OVHcloud Public Cloud instances.
    Ovh,
}

/// Default image, plan and location used when a caller supplies none.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProviderDefaults {
    /// Default OS image.
    pub os_image: &'static str,
    /// Default plan.
    pub plan: &'static str,
    /// Default region.
    pub region: &'static str,
    /// Default zone for zonal providers.
    pub zone: Option<&'static str>,
}

impl ProviderKind {
    /// Every supported provider.
    pub const ALL: [Self; 11] = [
        Self::DigitalOcean,
        Self::Ec2,
        Self::Gce,
        Self::Azure,
        Self::Scaleway,
        Self::Civo,
        Self::Equinix,
        Self::Hetzner,
        Self::Vultr,
        Self::Linode,
        Self::Ovh,
    ];

    /// Returns the name used on the command line and in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DigitalOcean => "digitalocean",
            Self::Ec2 => "ec2",
            Self::Gce => "gce",
            Self::Azure => "azure",
            Self::Scaleway => "scaleway",
            Self::Civo => "civo",
            Self::Equinix => "equinix",
            Self::Hetzner => "hetzner",
            Self::Vultr => "vultr",
            Self::Linode => "linode",
            Self::Ovh => "ovh",
        }
    }

    /// Returns the defaults applied by the CLI.
    #[must_use]
    pub const fn defaults(self) -> ProviderDefaults {
        let (os_image, plan, region, zone) = match self {
            Self::DigitalOcean => ("ubuntu-22-04-x64", "s-1vcpu-1gb", "lon1", None),
            Self::Ec2 => (
                "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*",
                "t3.nano",
                "eu-west-1",
                None,
            ),
            Self::Gce => (
                "projects/debian-cloud/global/images/family/debian-12",
                "e2-micro",
                "us-central1",
                Some("us-central1-a"),
            ),
            Self::Azure => (
                "Canonical:0001-com-ubuntu-server-jammy:22_04-lts:latest",
                "Standard_B1ls",
                "eastus",
                None,
            ),
            Self::Scaleway => ("Ubuntu 22.04 Jammy Jellyfish", "DEV1-S", "fr-par-1", None),
            Self::Civo => ("811a8dfb-8202-49ad-b1ef-1e6320b20497", "g3.small", "lon1", None),
            Self::Equinix => ("ubuntu_22_04", "c3.small.x86", "am", None),
            Self::Hetzner => ("ubuntu-22.04", "cx22", "fsn1", None),
            Self::Vultr => ("1743", "vc2-1c-1gb", "lhr", None),
            Self::Linode => ("linode/ubuntu22.04", "g6-nanode-1", "eu-west", None),
            Self::Ovh => ("Ubuntu 22.04", "d2-2", "GRA11", None),
        };
        ProviderDefaults {
            os_image,
            plan,
            region,
            zone,
        }
    }

    /// Returns the list expression that selects hosts created by this tool.
    #[must_use]
    pub const fn exit_node_marker(self) -> &'static str {
        match self {
            Self::DigitalOcean
            | Self::Scaleway
            | Self::Civo
            | Self::Equinix
            | Self::Linode => "inlets",
            Self::Ec2 | Self::Azure => "inlets=exit-node",
            Self::Gce => "labels.inlets=exit-node",
            Self::Hetzner => "inlets==exit-node",
            Self::Vultr => "inlets-exit-node",
            Self::Ovh => "inlets-",
        }
    }

    /// Reports whether descriptors and list calls need a project id.
    #[must_use]
    pub const fn requires_project_id(self) -> bool {
        matches!(self, Self::Gce | Self::Equinix | Self::Ovh)
    }

    /// Reports whether the API token (or key file) is required.
    #[must_use]
    pub const fn requires_access_token(self) -> bool {
        !matches!(self, Self::Scaleway)
    }

    /// Reports whether a secret key is required.
    #[must_use]
    pub const fn requires_secret_key(self) -> bool {
        matches!(self, Self::Ec2 | Self::Scaleway | Self::Ovh)
    }

    /// Reports whether an OVH consumer key is required.
    #[must_use]
    pub const fn requires_consumer_key(self) -> bool {
        matches!(self, Self::Ovh)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProvisionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalised = value.trim().to_ascii_lowercase();
        if normalised == "packet" {
            return Ok(Self::Equinix);
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalised)
            .ok_or_else(|| {
                ProvisionError::configuration(format!("no provisioner for provider: {value}"))
            })
    }
}

/// Polling cadence used by adapters that wait inside an operation, such as
/// waiting for a server to stop before deleting it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitPolicy {
    /// Delay between probes.
    pub interval: Duration,
    /// Total time allowed before giving up.
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

impl WaitPolicy {
    /// Probes until `probe` reports `true`, failing once the timeout passes.
    ///
    /// # Errors
    ///
    /// Propagates probe errors and returns [`ProvisionError::ProviderApi`] on
    /// timeout.
    pub async fn until<F, Fut>(
        &self,
        operation: &str,
        resource: &str,
        mut probe: F,
    ) -> Result<(), ProvisionError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<bool, ProvisionError>> + Send,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            if probe().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::api(
                    operation,
                    resource,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ));
            }
            sleep(self.interval).await;
        }
    }
}

/// Credentials and scoping needed to construct an [`Adapter`].
#[derive(Clone)]
pub struct ProvisionerRequest {
    /// Provider to connect to.
    pub kind: ProviderKind,
    /// API token, access key id, service-account key or auth-file contents.
    pub access_token: Option<String>,
    /// Secret key (EC2, Scaleway) or application secret (OVH).
    pub secret_key: Option<String>,
    /// OVH consumer key.
    pub consumer_key: Option<String>,
    /// Organisation id (Scaleway).
    pub organisation_id: Option<String>,
    /// Default project id (Scaleway).
    pub project_id: Option<String>,
    /// Subscription override (Azure).
    pub subscription_id: Option<String>,
    /// Region the SDK client binds to (EC2).
    pub region: Option<String>,
    /// Base URL override for REST providers.
    pub endpoint: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl fmt::Debug for ProvisionerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerRequest")
            .field("kind", &self.kind)
            .field("organisation_id", &self.organisation_id)
            .field("project_id", &self.project_id)
            .field("subscription_id", &self.subscription_id)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ProvisionerRequest {
    /// Creates a request with no credentials and the default timeout.
    #[must_use]
    pub const fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            access_token: None,
            secret_key: None,
            consumer_key: None,
            organisation_id: None,
            project_id: None,
            subscription_id: None,
            region: None,
            endpoint: None,
            request_timeout: crate::transport::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    fn require<'a>(
        value: Option<&'a String>,
        what: &str,
        kind: ProviderKind,
    ) -> Result<&'a str, ProvisionError> {
        value
            .map(|inner| inner.trim())
            .filter(|inner| !inner.is_empty())
            .ok_or_else(|| ProvisionError::configuration(format!("{kind} requires {what}")))
    }

    fn access_token(&self) -> Result<&str, ProvisionError> {
        Self::require(self.access_token.as_ref(), "an access token", self.kind)
    }

    fn secret_key(&self) -> Result<&str, ProvisionError> {
        Self::require(self.secret_key.as_ref(), "a secret key", self.kind)
    }

    fn http(&self, default_base: &str, auth: Auth) -> Result<HttpTransport, ProvisionError> {
        let base = self.endpoint.as_deref().unwrap_or(default_base);
        HttpTransport::new(base, auth, self.request_timeout)
            .map_err(|err| ProvisionError::configuration(err.to_string()))
    }

    fn bearer(&self, default_base: &str) -> Result<HttpTransport, ProvisionError> {
        self.http(default_base, Auth::Bearer(self.access_token()?.to_owned()))
    }
}

/// Runtime-selected provider adapter.
pub enum Adapter {
    /// `DigitalOcean` adapter.
    DigitalOcean(digitalocean::DigitalOceanProvisioner),
    /// EC2 adapter.
    Ec2(ec2::Ec2Provisioner),
    /// GCE adapter.
    Gce(gce::GceProvisioner),
    /// Azure adapter.
    Azure(azure::AzureProvisioner),
    /// Scaleway adapter.
    Scaleway(scaleway::ScalewayProvisioner),
    /// Civo adapter.
    Civo(civo::CivoProvisioner),
    /// Equinix Metal adapter.
    Equinix(equinix::EquinixProvisioner),
    /// Hetzner adapter.
    Hetzner(hetzner::HetznerProvisioner),
    /// Vultr adapter.
    Vultr(vultr::VultrProvisioner),
    /// Linode adapter.
    Linode(linode::LinodeProvisioner),
    /// OVH adapter.
    Ovh(ovh::OvhProvisioner),
}

macro_rules! dispatch {
    ($adapter:expr, $inner:ident => $call:expr) => {
        match $adapter {
            Adapter::DigitalOcean($inner) => $call,
            Adapter::Ec2($inner) => $call,
            Adapter::Gce($inner) => $call,
            Adapter::Azure($inner) => $call,
            Adapter::Scaleway($inner) => $call,
            Adapter::Civo($inner) => $call,
            Adapter::Equinix($inner) => $call,
            Adapter::Hetzner($inner) => $call,
            Adapter::Vultr($inner) => $call,
            Adapter::Linode($inner) => $call,
            Adapter::Ovh($inner) => $call,
        }
    };
}

impl Adapter {
    /// Builds the adapter for `request.kind`, validating credentials first.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when credentials are missing
    /// or malformed.
    pub async fn connect(request: &ProvisionerRequest) -> Result<Self, ProvisionError> {
        let adapter = match request.kind {
            ProviderKind::DigitalOcean => Self::DigitalOcean(
                digitalocean::DigitalOceanProvisioner::new(request.bearer(digitalocean::API_BASE)?),
            ),
            ProviderKind::Ec2 => {
                let region = Self::require_region(request)?;
                let api = ec2::SdkEc2Api::connect(
                    region,
                    request.access_token()?,
                    request.secret_key()?,
                    request.request_timeout,
                )
                .await;
                Self::Ec2(ec2::Ec2Provisioner::new(api))
            }
            ProviderKind::Gce => {
                let auth = Auth::google_service_account(request.access_token()?)
                    .map_err(|err| ProvisionError::configuration(err.to_string()))?;
                Self::Gce(gce::GceProvisioner::new(request.http(gce::API_BASE, auth)?))
            }
            ProviderKind::Azure => {
                let credentials = AzureCredentials::from_auth_file(request.access_token()?)
                    .map_err(|err| ProvisionError::configuration(err.to_string()))?;
                let subscription = request
                    .subscription_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| credentials.subscription_id())
                    .to_owned();
                let transport =
                    request.http(azure::API_BASE, Auth::Azure(Arc::new(credentials)))?;
                Self::Azure(azure::AzureProvisioner::new(transport, subscription))
            }
            ProviderKind::Scaleway => {
                let secret = request.secret_key()?;
                let transport = request.http(
                    scaleway::API_BASE,
                    Auth::Header {
                        name: "X-Auth-Token",
                        value: secret.to_owned(),
                    },
                )?;
                Self::Scaleway(
                    scaleway::ScalewayProvisioner::new(transport, secret)
                        .with_project_id(request.project_id.clone())
                        .with_organisation_id(request.organisation_id.clone()),
                )
            }
            ProviderKind::Civo => {
                Self::Civo(civo::CivoProvisioner::new(request.bearer(civo::API_BASE)?))
            }
            ProviderKind::Equinix => {
                let transport = request.http(
                    equinix::API_BASE,
                    Auth::Header {
                        name: "X-Auth-Token",
                        value: request.access_token()?.to_owned(),
                    },
                )?;
                Self::Equinix(equinix::EquinixProvisioner::new(transport))
            }
            ProviderKind::Hetzner => Self::Hetzner(hetzner::HetznerProvisioner::new(
                request.bearer(hetzner::API_BASE)?,
            )),
            ProviderKind::Vultr => {
                Self::Vultr(vultr::VultrProvisioner::new(request.bearer(vultr::API_BASE)?))
            }
            ProviderKind::Linode => {
                Self::Linode(linode::LinodeProvisioner::new(request.bearer(linode::API_BASE)?))
            }
            ProviderKind::Ovh => {
                let consumer_key = ProvisionerRequest::require(
                    request.consumer_key.as_ref(),
                    "a consumer key",
                    request.kind,
                )?;
                let credentials = OvhCredentials::new(
                    request.access_token()?,
                    request.secret_key()?,
                    consumer_key,
                );
                Self::Ovh(ovh::OvhProvisioner::new(
                    request.http(ovh::API_BASE, Auth::Ovh(credentials))?,
                ))
            }
        };
        Ok(adapter)
    }

    fn require_region(request: &ProvisionerRequest) -> Result<&str, ProvisionError> {
        ProvisionerRequest::require(request.region.as_ref(), "a region", request.kind)
    }

    /// Returns the provider behind this adapter.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::DigitalOcean(_) => ProviderKind::DigitalOcean,
            Self::Ec2(_) => ProviderKind::Ec2,
            Self::Gce(_) => ProviderKind::Gce,
            Self::Azure(_) => ProviderKind::Azure,
            Self::Scaleway(_) => ProviderKind::Scaleway,
            Self::Civo(_) => ProviderKind::Civo,
            Self::Equinix(_) => ProviderKind::Equinix,
            Self::Hetzner(_) => ProviderKind::Hetzner,
            Self::Vultr(_) => ProviderKind::Vultr,
            Self::Linode(_) => ProviderKind::Linode,
            Self::Ovh(_) => ProviderKind::Ovh,
        }
    }
}

impl Provisioner for Adapter {
    fn provision<'a>(
        &'a self,
        descriptor: &'a HostDescriptor,
    ) -> ProvisionFuture<'a, ProvisionedHost> {
        dispatch!(self, inner => inner.provision(descriptor))
    }

    fn status<'a>(&'a self, id: &'a str) -> ProvisionFuture<'a, ProvisionedHost> {
        dispatch!(self, inner => inner.status(id))
    }

    fn delete<'a>(&'a self, request: &'a HostDeleteRequest) -> ProvisionFuture<'a, ()> {
        dispatch!(self, inner => inner.delete(request))
    }

    fn list<'a>(&'a self, filter: &'a ListFilter) -> ProvisionFuture<'a, Vec<ProvisionedHost>> {
        dispatch!(self, inner => inner.list(filter))
    }
}

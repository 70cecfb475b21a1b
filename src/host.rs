//! Host descriptors and the records exchanged with provider adapters.

use std::collections::BTreeMap;
use std::fmt;

use crate::provider::{ProviderKind, ProvisionError};

/// Tag naming the project (GCE, Equinix Metal, OVH, Scaleway) that owns a host.
pub const TAG_PROJECT_ID: &str = "project-id";
/// Tag naming the prefix of the per-host GCE firewall rule.
pub const TAG_FIREWALL_NAME: &str = "firewall-name";
/// Tag carrying the tunnel control port opened in provider firewalls.
pub const TAG_CONTROL_PORT: &str = "control-port";
/// Tag enabling the wide ingress range required by pro tunnels (`"true"`).
pub const TAG_PRO: &str = "pro";
/// Tag naming an SSH key already registered with the provider.
pub const TAG_SSH_KEY: &str = "ssh-key";
/// Tag naming the VPC (`DigitalOcean`, EC2) a host should join.
pub const TAG_VPC: &str = "vpc";
/// Tag naming the subnet (EC2) a host should join.
pub const TAG_SUBNET: &str = "subnet";
/// Tag overriding the Azure image publisher.
pub const TAG_IMAGE_PUBLISHER: &str = "image-publisher";
/// Tag overriding the Azure image offer.
pub const TAG_IMAGE_OFFER: &str = "image-offer";
/// Tag overriding the Azure image SKU.
pub const TAG_IMAGE_SKU: &str = "image-sku";
/// Tag overriding the Azure image version.
pub const TAG_IMAGE_VERSION: &str = "image-version";
/// Tag selecting the CPU architecture used for image lookup (Scaleway).
pub const TAG_ARCHITECTURE: &str = "architecture";

/// Control port used when a descriptor does not carry one.
pub const DEFAULT_CONTROL_PORT: u16 = 8080;

/// Provider-neutral description of a host to create.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostDescriptor {
    /// Display name or label applied to the host.
    pub name: String,
    /// Provider region (for zonal providers this may be a zone).
    pub region: String,
    /// Availability zone for providers that separate it from the region.
    pub zone: Option<String>,
    /// Machine size, plan or commercial type.
    pub plan: String,
    /// Image identifier, slug or label understood by the provider.
    pub os_image: String,
    /// First-boot script delivered as user data.
    pub boot_script: String,
    /// Provider-specific extra parameters.
    pub tags: BTreeMap<String, String>,
}

impl HostDescriptor {
    /// Starts a builder for a [`HostDescriptor`].
    #[must_use]
    pub fn builder() -> HostDescriptorBuilder {
        HostDescriptorBuilder::default()
    }

    /// Returns a tag value when present and non-blank.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Returns a tag value required by the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when the tag is missing.
    pub fn require_tag(&self, key: &str) -> Result<&str, ProvisionError> {
        self.tag(key).ok_or_else(|| ProvisionError::Configuration {
            message: format!("host '{}' requires the '{key}' tag", self.name),
        })
    }

    /// Reports whether the pro ingress range was requested.
    #[must_use]
    pub fn is_pro(&self) -> bool {
        self.tag(TAG_PRO)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    /// Parses the control port tag, falling back to [`DEFAULT_CONTROL_PORT`].
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when the tag is not a port.
    pub fn control_port(&self) -> Result<u16, ProvisionError> {
        self.tag(TAG_CONTROL_PORT).map_or(Ok(DEFAULT_CONTROL_PORT), |raw| {
            raw.parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| ProvisionError::Configuration {
                    message: format!("control port '{raw}' is not a valid TCP port"),
                })
        })
    }

    /// Returns the zone when set, otherwise the region.
    #[must_use]
    pub fn zone_or_region(&self) -> &str {
        self.zone.as_deref().unwrap_or(&self.region)
    }

    /// Validates the fields every adapter relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] naming the first empty field.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let required = [
            ("name", self.name.as_str()),
            ("region", self.zone_or_region()),
            ("plan", self.plan.as_str()),
            ("os_image", self.os_image.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ProvisionError::Configuration {
                    message: format!("host descriptor is missing {field}"),
                });
            }
        }
        Ok(())
    }
}

/// Builder for [`HostDescriptor`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostDescriptorBuilder {
    descriptor: HostDescriptor,
}

impl HostDescriptorBuilder {
    /// Sets the host name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.descriptor.name = value.into();
        self
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.descriptor.region = value.into();
        self
    }

    /// Sets the optional zone.
    #[must_use]
    pub fn zone(mut self, value: Option<String>) -> Self {
        self.descriptor.zone = value;
        self
    }

    /// Sets the plan.
    #[must_use]
    pub fn plan(mut self, value: impl Into<String>) -> Self {
        self.descriptor.plan = value.into();
        self
    }

    /// Sets the OS image.
    #[must_use]
    pub fn os_image(mut self, value: impl Into<String>) -> Self {
        self.descriptor.os_image = value.into();
        self
    }

    /// Sets the boot script.
    #[must_use]
    pub fn boot_script(mut self, value: impl Into<String>) -> Self {
        self.descriptor.boot_script = value.into();
        self
    }

    /// Adds a single tag, replacing any earlier value for the key.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor.tags.insert(key.into(), value.into());
        self
    }

    /// Builds and validates the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when a required field is empty.
    pub fn build(self) -> Result<HostDescriptor, ProvisionError> {
        let HostDescriptor {
            name,
            region,
            zone,
            plan,
            os_image,
            boot_script,
            tags,
        } = self.descriptor;
        let descriptor = HostDescriptor {
            name: name.trim().to_owned(),
            region: region.trim().to_owned(),
            zone: zone
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty()),
            plan: plan.trim().to_owned(),
            os_image: os_image.trim().to_owned(),
            boot_script,
            tags: tags
                .into_iter()
                .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
                .collect(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Canonical lifecycle states shared by all providers.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum HostStatus {
    /// The provider accepted the request and is allocating the host.
    Creating,
    /// The host exists but is still booting.
    Initializing,
    /// The host is running and reachable.
    Active,
    /// The provider reports an unrecoverable failure.
    Error,
    /// Any provider-native status without a canonical equivalent.
    Other(String),
}

impl HostStatus {
    /// Returns the canonical lowercase name, or the native status verbatim.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Error => "error",
            Self::Other(native) => native,
        }
    }

    /// Parses a canonical name, returning `None` for anything else.
    #[must_use]
    pub fn from_canonical(value: &str) -> Option<Self> {
        match value {
            "creating" => Some(Self::Creating),
            "initializing" => Some(Self::Initializing),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Maps a provider-native status through `table`.
    ///
    /// Canonical names map to themselves, so feeding a mapped status back in
    /// yields the same value. Unknown statuses pass through as [`Self::Other`].
    #[must_use]
    pub fn map_native(native: &str, table: &[(&str, Self)]) -> Self {
        if let Some(canonical) = Self::from_canonical(native) {
            return canonical;
        }
        table
            .iter()
            .find(|(candidate, _)| *candidate == native)
            .map_or_else(|| Self::Other(native.to_owned()), |(_, status)| status.clone())
    }

    /// Reports whether the host reached [`Self::Active`].
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Reports whether the provider declared the host failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host as observed from a provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionedHost {
    /// Provider identifier, possibly composite.
    pub id: String,
    /// Public IPv4 address, empty until assigned.
    pub ip: String,
    /// Canonical or provider-native status.
    pub status: HostStatus,
}

impl ProvisionedHost {
    /// Records an observation, downgrading `Active` to `Initializing` while no
    /// public address has been assigned.
    #[must_use]
    pub fn observed(id: impl Into<String>, ip: impl Into<String>, status: HostStatus) -> Self {
        let address = ip.into().trim().to_owned();
        let reported = if status.is_active() && address.is_empty() {
            HostStatus::Initializing
        } else {
            status
        };
        Self {
            id: id.into(),
            ip: address,
            status: reported,
        }
    }

    /// Records a freshly created host.
    #[must_use]
    pub fn creating(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: String::new(),
            status: HostStatus::Creating,
        }
    }
}

/// Request to delete a host by identifier or by public IP.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostDeleteRequest {
    /// Provider identifier; takes precedence over `ip`.
    pub id: Option<String>,
    /// Public IPv4 address used when no identifier is known.
    pub ip: Option<String>,
    /// Project scope for providers that need one.
    pub project_id: Option<String>,
    /// Zone scope for zonal providers.
    pub zone: Option<String>,
    /// Region scope for regional providers.
    pub region: Option<String>,
}

impl HostDeleteRequest {
    /// Builds a request addressed by identifier.
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Builds a request addressed by public IP.
    #[must_use]
    pub fn by_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    /// Builds a request addressing `host`, scoped the same way as `descriptor`.
    #[must_use]
    pub fn for_host(host: &ProvisionedHost, descriptor: &HostDescriptor) -> Self {
        Self {
            id: Some(host.id.clone()),
            ip: Some(host.ip.clone()).filter(|ip| !ip.is_empty()),
            project_id: descriptor.tag(TAG_PROJECT_ID).map(str::to_owned),
            zone: descriptor.zone.clone(),
            region: Some(descriptor.region.clone()).filter(|region| !region.is_empty()),
        }
    }

    /// Sets the project scope.
    #[must_use]
    pub fn with_project_id(mut self, value: Option<String>) -> Self {
        self.project_id = non_blank(value);
        self
    }

    /// Sets the zone scope.
    #[must_use]
    pub fn with_zone(mut self, value: Option<String>) -> Self {
        self.zone = non_blank(value);
        self
    }

    /// Sets the region scope.
    #[must_use]
    pub fn with_region(mut self, value: Option<String>) -> Self {
        self.region = non_blank(value);
        self
    }

    /// Returns the identifier when set and non-blank.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Returns the IP when set and non-blank.
    #[must_use]
    pub fn ip(&self) -> Option<&str> {
        self.ip
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Rejects requests that carry neither an identifier nor an IP.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when both are missing.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.id().is_none() && self.ip().is_none() {
            return Err(ProvisionError::Configuration {
                message: String::from("delete requires a host id or an IP address"),
            });
        }
        Ok(())
    }

    /// Builds the list filter used to resolve this request by IP.
    #[must_use]
    pub fn list_filter(&self, expression: impl Into<String>) -> ListFilter {
        ListFilter {
            expression: expression.into(),
            project_id: self.project_id.clone(),
            zone: self.zone.clone(),
            region: self.region.clone(),
        }
    }
}

/// Provider-specific filter used when listing hosts.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListFilter {
    /// Provider-specific expression, usually the exit-node marker.
    pub expression: String,
    /// Project scope.
    pub project_id: Option<String>,
    /// Zone scope.
    pub zone: Option<String>,
    /// Region scope.
    pub region: Option<String>,
}

impl ListFilter {
    /// Selects every exit node created for `kind`, with no scope set.
    #[must_use]
    pub fn exit_nodes(kind: ProviderKind) -> Self {
        Self {
            expression: kind.exit_node_marker().to_owned(),
            ..Self::default()
        }
    }

    /// Sets the project scope.
    #[must_use]
    pub fn with_project_id(mut self, value: Option<String>) -> Self {
        self.project_id = non_blank(value);
        self
    }

    /// Sets the zone scope.
    #[must_use]
    pub fn with_zone(mut self, value: Option<String>) -> Self {
        self.zone = non_blank(value);
        self
    }

    /// Sets the region scope.
    #[must_use]
    pub fn with_region(mut self, value: Option<String>) -> Self {
        self.region = non_blank(value);
        self
    }

    /// Returns the project scope or fails with a configuration error.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when no project is set.
    pub fn require_project(&self) -> Result<&str, ProvisionError> {
        require_scope(self.project_id.as_deref(), "project id")
    }

    /// Returns the zone scope or fails with a configuration error.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when no zone is set.
    pub fn require_zone(&self) -> Result<&str, ProvisionError> {
        require_scope(self.zone.as_deref(), "zone")
    }

    /// Returns the region scope or fails with a configuration error.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Configuration`] when no region is set.
    pub fn require_region(&self) -> Result<&str, ProvisionError> {
        require_scope(self.region.as_deref(), "region")
    }
}

fn require_scope<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, ProvisionError> {
    value
        .map(str::trim)
        .filter(|scope| !scope.is_empty())
        .ok_or_else(|| ProvisionError::Configuration {
            message: format!("listing hosts requires a {what}"),
        })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|inner| inner.trim().to_owned())
        .filter(|inner| !inner.is_empty())
}

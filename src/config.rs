//! Configuration loading via `ortho-config`.
//!
//! [`Settings`] merges defaults, `waystation.toml` and `WAYSTATION_*`
//! environment variables. The CLI overlays its flags on top and then turns
//! the result into the explicit values the library consumes: a
//! [`ProvisionerRequest`], a [`HostDescriptor`] and a [`LifecycleConfig`].

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::bootstrap::{self, BootstrapError, BootstrapRequest};
use crate::host::{
    DEFAULT_CONTROL_PORT, HostDescriptor, TAG_CONTROL_PORT, TAG_PRO, TAG_PROJECT_ID,
};
use crate::lifecycle::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL, DEFAULT_TEARDOWN_TIMEOUT, LifecycleConfig,
};
use crate::provider::{ProviderKind, ProvisionError, ProvisionerRequest};
use crate::secret::{SecretError, SecretSource};

/// Environment variable consulted last for the provider access token.
pub const ACCESS_TOKEN_ENV: &str = "INLETS_ACCESS_TOKEN";
/// Environment variable consulted last for the provider secret key.
pub const SECRET_KEY_ENV: &str = "INLETS_SECRET_KEY";
/// Environment variable consulted last for the OVH consumer key.
pub const CONSUMER_KEY_ENV: &str = "INLETS_CONSUMER_KEY";
/// Environment variable consulted last for the tunnel auth token.
pub const INLETS_TOKEN_ENV: &str = "INLETS_TOKEN";

/// Settings shared by the `waystation` commands.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "WAYSTATION",
    discovery(
        app_name = "waystation",
        env_var = "WAYSTATION_CONFIG_PATH",
        config_file_name = "waystation.toml",
        dotfile_name = ".waystation.toml",
        project_file_name = "waystation.toml"
    )
)]
pub struct Settings {
    /// Cloud provider name, for example `digitalocean` or `gce`.
    #[ortho_config(default = "digitalocean".to_owned())]
    pub provider: String,
    /// Region; the provider default applies when unset.
    pub region: Option<String>,
    /// Zone for zonal providers.
    pub zone: Option<String>,
    /// Plan, size or instance type.
    pub plan: Option<String>,
    /// OS image identifier.
    pub os: Option<String>,
    /// Project id (GCE, Equinix Metal, OVH, Scaleway).
    pub project_id: Option<String>,
    /// Subscription id override (Azure).
    pub subscription_id: Option<String>,
    /// Organisation id (Scaleway).
    pub organisation_id: Option<String>,
    /// Provider API token, access key id or service-account key.
    pub access_token: Option<String>,
    /// File holding the access token (or the Azure auth file).
    pub access_token_file: Option<String>,
    /// Secret key (EC2, Scaleway) or OVH application secret.
    pub secret_key: Option<String>,
    /// File holding the secret key.
    pub secret_key_file: Option<String>,
    /// OVH consumer key.
    pub consumer_key: Option<String>,
    /// Tunnel auth token; generated when unset.
    pub inlets_token: Option<String>,
    /// Tunnel control port.
    #[ortho_config(default = DEFAULT_CONTROL_PORT)]
    pub control_port: u16,
    /// Installs the pro tunnel server.
    #[ortho_config(default = false)]
    pub pro: bool,
    /// Tunnel release to install; defaults per edition.
    pub version: Option<String>,
    /// Seconds between status probes.
    #[ortho_config(default = DEFAULT_POLL_INTERVAL.as_secs())]
    pub poll_interval_secs: u64,
    /// Status probes before giving up.
    #[ortho_config(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Per-request timeout for provider APIs, in seconds.
    #[ortho_config(default = crate::transport::DEFAULT_REQUEST_TIMEOUT.as_secs())]
    pub request_timeout_secs: u64,
    /// Upper bound on teardown, in seconds.
    #[ortho_config(default = DEFAULT_TEARDOWN_TIMEOUT.as_secs())]
    pub teardown_timeout_secs: u64,
    /// Base URL override for REST providers, used against API mocks.
    pub endpoint: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to waystation.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "{} {reason}: check {} or {} in waystation.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const PROVIDER: FieldMetadata = FieldMetadata::new("provider", "WAYSTATION_PROVIDER", "provider");
const PROJECT_ID: FieldMetadata =
    FieldMetadata::new("project id", "WAYSTATION_PROJECT_ID", "project_id");
const ORGANISATION_ID: FieldMetadata = FieldMetadata::new(
    "organisation id",
    "WAYSTATION_ORGANISATION_ID",
    "organisation_id",
);
const POLL_INTERVAL: FieldMetadata = FieldMetadata::new(
    "poll interval",
    "WAYSTATION_POLL_INTERVAL_SECS",
    "poll_interval_secs",
);
const MAX_ATTEMPTS: FieldMetadata =
    FieldMetadata::new("max attempts", "WAYSTATION_MAX_ATTEMPTS", "max_attempts");
const CONTROL_PORT: FieldMetadata =
    FieldMetadata::new("control port", "WAYSTATION_CONTROL_PORT", "control_port");
const REQUEST_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "request timeout",
    "WAYSTATION_REQUEST_TIMEOUT_SECS",
    "request_timeout_secs",
);

impl Settings {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("waystation")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Parses the configured provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] or [`ConfigError::Invalid`] when
    /// the provider is empty or unknown.
    pub fn provider_kind(&self) -> Result<ProviderKind, ConfigError> {
        if self.provider.trim().is_empty() {
            return Err(PROVIDER.missing());
        }
        self.provider
            .parse()
            .map_err(|_| PROVIDER.invalid(&format!("'{}' is not supported", self.provider)))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<ProviderKind, ConfigError> {
        let kind = self.provider_kind()?;
        if kind.requires_project_id() && blank(self.project_id.as_deref()) {
            return Err(PROJECT_ID.missing());
        }
        if kind == ProviderKind::Scaleway
            && blank(self.organisation_id.as_deref())
            && blank(self.project_id.as_deref())
        {
            return Err(ORGANISATION_ID.missing());
        }
        if self.poll_interval_secs == 0 {
            return Err(POLL_INTERVAL.invalid("must be at least one second"));
        }
        if self.max_attempts == 0 {
            return Err(MAX_ATTEMPTS.invalid("must be at least one"));
        }
        if self.control_port == 0 {
            return Err(CONTROL_PORT.invalid("must be a TCP port"));
        }
        if self.request_timeout_secs == 0 {
            return Err(REQUEST_TIMEOUT.invalid("must be at least one second"));
        }
        Ok(kind)
    }

    /// Polling and teardown settings for the lifecycle driver.
    #[must_use]
    pub const fn lifecycle_config(&self, delete_on_cancel: bool) -> LifecycleConfig {
        LifecycleConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_attempts: self.max_attempts,
            delete_on_cancel,
            teardown_timeout: Duration::from_secs(self.teardown_timeout_secs),
        }
    }

    /// Where the provider access token comes from.
    #[must_use]
    pub fn access_token_source(&self) -> SecretSource {
        SecretSource::new("access-token", ACCESS_TOKEN_ENV)
            .flag(self.access_token.clone())
            .file(self.access_token_file.clone())
    }

    /// Where the provider secret key comes from.
    #[must_use]
    pub fn secret_key_source(&self) -> SecretSource {
        SecretSource::new("secret-key", SECRET_KEY_ENV)
            .flag(self.secret_key.clone())
            .file(self.secret_key_file.clone())
    }

    /// Resolves credentials and scoping for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Secret`] when a required credential is missing
    /// or unreadable.
    pub fn provisioner_request(&self, kind: ProviderKind) -> Result<ProvisionerRequest, ConfigError> {
        let access_token = if kind.requires_access_token() {
            Some(self.access_token_source().require()?)
        } else {
            self.access_token_source().resolve()?
        };
        let secret_key = if kind.requires_secret_key() {
            Some(self.secret_key_source().require()?)
        } else {
            None
        };
        let consumer_key = if kind.requires_consumer_key() {
            Some(
                SecretSource::new("consumer-key", CONSUMER_KEY_ENV)
                    .flag(self.consumer_key.clone())
                    .require()?,
            )
        } else {
            None
        };
        let mut request = ProvisionerRequest::new(kind);
        request.access_token = access_token;
        request.secret_key = secret_key;
        request.consumer_key = consumer_key;
        request.organisation_id = non_blank(self.organisation_id.as_deref());
        request.project_id = non_blank(self.project_id.as_deref());
        request.subscription_id = non_blank(self.subscription_id.as_deref());
        request.region = Some(self.region_for(kind));
        request.endpoint = non_blank(self.endpoint.as_deref());
        request.request_timeout = Duration::from_secs(self.request_timeout_secs);
        Ok(request)
    }

    /// Region to use, falling back to the provider default.
    #[must_use]
    pub fn region_for(&self, kind: ProviderKind) -> String {
        non_blank(self.region.as_deref()).unwrap_or_else(|| kind.defaults().region.to_owned())
    }

    /// Zone to use, falling back to the provider default.
    #[must_use]
    pub fn zone_for(&self, kind: ProviderKind) -> Option<String> {
        non_blank(self.zone.as_deref()).or_else(|| kind.defaults().zone.map(str::to_owned))
    }

    /// Tunnel auth token from flag or environment, generating one when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Secret`] when the token source is unreadable.
    pub fn inlets_token(&self) -> Result<String, ConfigError> {
        Ok(SecretSource::new("inlets-token", INLETS_TOKEN_ENV)
            .flag(self.inlets_token.clone())
            .resolve()?
            .unwrap_or_else(bootstrap::generate_token))
    }

    /// Builds the descriptor for a new host named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the bootstrap script cannot be rendered or
    /// the descriptor is incomplete.
    pub fn host_descriptor(
        &self,
        kind: ProviderKind,
        name: &str,
        auth_token: &str,
    ) -> Result<HostDescriptor, ConfigError> {
        let defaults = kind.defaults();
        let default_version = if self.pro {
            bootstrap::DEFAULT_PRO_VERSION
        } else {
            bootstrap::DEFAULT_OSS_VERSION
        };
        let boot_script = BootstrapRequest {
            auth_token: auth_token.to_owned(),
            control_port: self.control_port,
            version: non_blank(self.version.as_deref())
                .unwrap_or_else(|| default_version.to_owned()),
            pro: self.pro,
        }
        .render()?;
        let mut builder = HostDescriptor::builder()
            .name(name)
            .region(self.region_for(kind))
            .zone(self.zone_for(kind))
            .plan(non_blank(self.plan.as_deref()).unwrap_or_else(|| defaults.plan.to_owned()))
            .os_image(non_blank(self.os.as_deref()).unwrap_or_else(|| defaults.os_image.to_owned()))
            .boot_script(boot_script)
            .tag(TAG_CONTROL_PORT, self.control_port.to_string());
        if self.pro {
            builder = builder.tag(TAG_PRO, "true");
        }
        if let Some(project) = non_blank(self.project_id.as_deref()) {
            builder = builder.tag(TAG_PROJECT_ID, project);
        }
        Ok(builder.build()?)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::DigitalOcean.as_str().to_owned(),
            region: None,
            zone: None,
            plan: None,
            os: None,
            project_id: None,
            subscription_id: None,
            organisation_id: None,
            access_token: None,
            access_token_file: None,
            secret_key: None,
            secret_key_file: None,
            consumer_key: None,
            inlets_token: None,
            control_port: DEFAULT_CONTROL_PORT,
            pro: false,
            version: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout_secs: crate::transport::DEFAULT_REQUEST_TIMEOUT.as_secs(),
            teardown_timeout_secs: DEFAULT_TEARDOWN_TIMEOUT.as_secs(),
            endpoint: None,
        }
    }
}

fn blank(value: Option<&str>) -> bool {
    value.is_none_or(|inner| inner.trim().is_empty())
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|inner| !inner.is_empty())
        .map(str::to_owned)
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range or unknown.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a credential cannot be resolved.
    #[error(transparent)]
    Secret(#[from] SecretError),
    /// Raised when the bootstrap script cannot be rendered.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// Raised when the host descriptor is incomplete.
    #[error(transparent)]
    Descriptor(#[from] ProvisionError),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

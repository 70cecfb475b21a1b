//! Command-line interface definitions for the `waystation` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `waystation` binary.
#[derive(Debug, Parser)]
#[command(
    name = "waystation",
    about = "Provision and tear down tunnel exit nodes on public clouds",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create an exit node and wait until it is active.
    #[command(name = "create", about = "Create an exit node and wait until it is active")]
    Create(CreateCommand),
    /// Delete an exit node by id or public IP.
    #[command(name = "delete", about = "Delete an exit node by id or public IP")]
    Delete(DeleteCommand),
    /// Show the current status of an exit node.
    #[command(name = "status", about = "Show the current status of an exit node")]
    Status(StatusCommand),
}

/// Provider selection and credentials shared by every subcommand.
#[derive(Debug, Default, Args)]
pub(crate) struct ProviderArgs {
    /// Cloud provider: digitalocean, ec2, gce, azure, scaleway, civo,
    /// equinix (or packet), hetzner, vultr, linode or ovh.
    #[arg(short = 'p', long, value_name = "PROVIDER")]
    pub(crate) provider: Option<String>,
    /// Region; each provider has a default.
    #[arg(short = 'r', long, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Zone for zonal providers (GCE, Scaleway).
    #[arg(short = 'z', long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Project id (GCE, Equinix Metal, OVH, Scaleway).
    #[arg(long, value_name = "ID")]
    pub(crate) project_id: Option<String>,
    /// Subscription id (Azure); read from the auth file when unset.
    #[arg(long, value_name = "ID")]
    pub(crate) subscription_id: Option<String>,
    /// Organisation id (Scaleway).
    #[arg(long, value_name = "ID")]
    pub(crate) organisation_id: Option<String>,
    /// API token, access key id or service-account key for the provider.
    #[arg(short = 'a', long, value_name = "TOKEN")]
    pub(crate) access_token: Option<String>,
    /// Read the access token (or Azure auth file) from this path.
    #[arg(short = 'f', long, value_name = "PATH")]
    pub(crate) access_token_file: Option<String>,
    /// Secret key (EC2, Scaleway) or application secret (OVH).
    #[arg(long, value_name = "KEY")]
    pub(crate) secret_key: Option<String>,
    /// Read the secret key from this path.
    #[arg(long, value_name = "PATH")]
    pub(crate) secret_key_file: Option<String>,
    /// OVH consumer key.
    #[arg(long, value_name = "KEY")]
    pub(crate) consumer_key: Option<String>,
}

/// Arguments for the `waystation create` subcommand.
#[derive(Debug, Default, Args)]
pub(crate) struct CreateCommand {
    #[command(flatten)]
    pub(crate) provider: ProviderArgs,
    /// Host name; a random one is generated when unset.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Plan, size or instance type.
    #[arg(long, value_name = "PLAN")]
    pub(crate) plan: Option<String>,
    /// OS image identifier.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) os: Option<String>,
    /// Tunnel auth token; generated when unset.
    #[arg(short = 't', long, value_name = "TOKEN")]
    pub(crate) inlets_token: Option<String>,
    /// Tunnel control port.
    #[arg(long, value_name = "PORT")]
    pub(crate) control_port: Option<u16>,
    /// Install the pro tunnel server and open the high port range.
    #[arg(long)]
    pub(crate) pro: bool,
    /// Seconds between status probes.
    #[arg(short = 'n', long = "poll", value_name = "SECONDS")]
    pub(crate) poll: Option<u64>,
    /// Status probes before giving up.
    #[arg(long, value_name = "COUNT")]
    pub(crate) max_attempts: Option<u32>,
    /// Delete the exit node when interrupted with Ctrl+C.
    #[arg(long)]
    pub(crate) rm: bool,
}

/// Arguments for the `waystation delete` subcommand.
#[derive(Debug, Default, Args)]
pub(crate) struct DeleteCommand {
    #[command(flatten)]
    pub(crate) provider: ProviderArgs,
    /// Host id as printed by `create`.
    #[arg(short = 'i', long, value_name = "ID", required_unless_present = "ip")]
    pub(crate) id: Option<String>,
    /// Public IP of the host; resolved by listing exit nodes.
    #[arg(long, value_name = "IP")]
    pub(crate) ip: Option<String>,
}

/// Arguments for the `waystation status` subcommand.
#[derive(Debug, Default, Args)]
pub(crate) struct StatusCommand {
    #[command(flatten)]
    pub(crate) provider: ProviderArgs,
    /// Host id as printed by `create`.
    #[arg(short = 'i', long, value_name = "ID")]
    pub(crate) id: String,
}

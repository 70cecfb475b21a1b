//! Exit-node janitor for waystation.
//!
//! This binary deletes every host carrying the exit-node marker for one
//! provider and then verifies the set is empty. Credentials resolve the same
//! way as for `waystation` itself.

use std::io::Write as _;

use clap::Parser;
use waystation::config::Settings;
use waystation::janitor::{Janitor, JanitorConfig};
use waystation::provider::Adapter;

#[derive(Debug, Parser)]
#[command(
    name = "waystation-janitor",
    about = "Delete every waystation exit node for one provider"
)]
struct Cli {
    /// Provider to sweep.
    #[arg(long, env = "WAYSTATION_PROVIDER")]
    provider: Option<String>,
    /// Project id used to scope discovery.
    #[arg(long, env = "WAYSTATION_PROJECT_ID")]
    project_id: Option<String>,
    /// Zone used to scope discovery on zonal providers.
    #[arg(long, env = "WAYSTATION_ZONE")]
    zone: Option<String>,
    /// Region used to scope discovery on regional providers.
    #[arg(long, env = "WAYSTATION_REGION")]
    region: Option<String>,
    /// List the hosts that would be deleted without deleting them.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let mut settings = Settings::load_without_cli_args().map_err(|err| err.to_string())?;
    if let Some(provider) = cli.provider {
        settings.provider = provider;
    }
    if cli.project_id.is_some() {
        settings.project_id = cli.project_id;
    }
    let kind = settings.validate().map_err(|err| err.to_string())?;
    let config = JanitorConfig::new(
        kind,
        settings.project_id.clone(),
        cli.zone.or_else(|| settings.zone_for(kind)),
        cli.region.or_else(|| settings.region.clone()),
    )
    .map_err(|err| err.to_string())?;
    let request = settings
        .provisioner_request(kind)
        .map_err(|err| err.to_string())?;
    let adapter = Adapter::connect(&request)
        .await
        .map_err(|err| err.to_string())?;
    let janitor = Janitor::new(config, adapter);

    let mut stdout = std::io::stdout();
    if cli.dry_run {
        let hosts = janitor.candidates().await.map_err(|err| err.to_string())?;
        for host in &hosts {
            writeln!(stdout, "{}\t{}\t{}", host.id, host.ip, host.status)
                .map_err(|err| err.to_string())?;
        }
        writeln!(stdout, "janitor dry run: {} exit node(s) found", hosts.len())
            .map_err(|err| err.to_string())?;
        return Ok(());
    }

    let summary = janitor.sweep().await.map_err(|err| err.to_string())?;
    writeln!(
        stdout,
        "janitor sweep complete: deleted_hosts={}, already_gone={}",
        summary.deleted_hosts, summary.already_gone
    )
    .map_err(|err| err.to_string())?;
    Ok(())
}

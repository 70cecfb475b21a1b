//! Binary entry point for the waystation CLI.

use std::future::Future;
use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use waystation::config::{ConfigError, Settings};
use waystation::host::{HostDeleteRequest, HostDescriptor, ProvisionedHost, TAG_PROJECT_ID};
use waystation::lifecycle::{LifecycleDriver, LifecycleError, RunOutcome};
use waystation::names;
use waystation::provider::{Adapter, ProviderKind, ProvisionError, Provisioner};

mod cli;

use cli::{Cli, CreateCommand, DeleteCommand, ProviderArgs, StatusCommand};

/// Exit code reported when Ctrl+C interrupts `create`.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "WAYSTATION_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("provider error: {0}")]
    Provider(#[from] ProvisionError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Create(command) => create(command).await,
        Cli::Delete(command) => delete(command).await,
        Cli::Status(command) => status(command).await,
    }
}

async fn create(args: CreateCommand) -> Result<i32, CliError> {
    let settings = create_settings(&args)?;
    let kind = settings.validate()?;
    let adapter = Adapter::connect(&settings.provisioner_request(kind)?).await?;
    let name = args.name.clone().unwrap_or_else(names::generate);
    let auth_token = settings.inlets_token()?;
    let descriptor = settings.host_descriptor(kind, &name, &auth_token)?;
    let driver = LifecycleDriver::new(adapter, settings.lifecycle_config(args.rm));
    let session = CreateSession {
        kind,
        descriptor: &descriptor,
        auth_token: &auth_token,
        control_port: settings.control_port,
        pro: settings.pro,
        hold: args.rm,
    };
    session.drive(&mut io::stdout(), &driver, interrupted).await
}

async fn delete(args: DeleteCommand) -> Result<i32, CliError> {
    let settings = load_settings(&args.provider)?;
    let kind = settings.validate()?;
    let request = delete_request(&settings, kind, &args);
    let adapter = Adapter::connect(&settings.provisioner_request(kind)?).await?;
    let driver = LifecycleDriver::new(adapter, settings.lifecycle_config(false));
    driver.teardown(&request).await?;
    let target = request.id().or_else(|| request.ip()).unwrap_or_default();
    writeln!(io::stdout(), "deleted {target}")?;
    Ok(0)
}

async fn status(args: StatusCommand) -> Result<i32, CliError> {
    let settings = load_settings(&args.provider)?;
    let kind = settings.validate()?;
    let adapter = Adapter::connect(&settings.provisioner_request(kind)?).await?;
    let host = adapter.status(&args.id).await?;
    write_status(io::stdout(), &host)?;
    Ok(0)
}

/// Resolves once Ctrl+C is pressed. If the handler cannot be installed the
/// future never resolves.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

/// Settings for `create`, merging command-line flags over file and
/// environment layers.
fn create_settings(args: &CreateCommand) -> Result<Settings, CliError> {
    let mut settings = load_settings(&args.provider)?;
    overlay(&mut settings.plan, args.plan.as_deref());
    overlay(&mut settings.os, args.os.as_deref());
    overlay(&mut settings.inlets_token, args.inlets_token.as_deref());
    if let Some(port) = args.control_port {
        settings.control_port = port;
    }
    if args.pro {
        settings.pro = true;
    }
    if let Some(secs) = args.poll {
        settings.poll_interval_secs = secs;
    }
    if let Some(attempts) = args.max_attempts {
        settings.max_attempts = attempts;
    }
    Ok(settings)
}

fn load_settings(args: &ProviderArgs) -> Result<Settings, CliError> {
    let mut settings = Settings::load_without_cli_args()?;
    apply_provider_args(&mut settings, args);
    Ok(settings)
}

fn apply_provider_args(settings: &mut Settings, args: &ProviderArgs) {
    if let Some(provider) = &args.provider {
        settings.provider.clone_from(provider);
    }
    overlay(&mut settings.region, args.region.as_deref());
    overlay(&mut settings.zone, args.zone.as_deref());
    overlay(&mut settings.project_id, args.project_id.as_deref());
    overlay(&mut settings.subscription_id, args.subscription_id.as_deref());
    overlay(&mut settings.organisation_id, args.organisation_id.as_deref());
    overlay(&mut settings.access_token, args.access_token.as_deref());
    overlay(&mut settings.access_token_file, args.access_token_file.as_deref());
    overlay(&mut settings.secret_key, args.secret_key.as_deref());
    overlay(&mut settings.secret_key_file, args.secret_key_file.as_deref());
    overlay(&mut settings.consumer_key, args.consumer_key.as_deref());
}

fn overlay(target: &mut Option<String>, value: Option<&str>) {
    if let Some(inner) = value {
        *target = Some(inner.to_owned());
    }
}

/// Builds the delete request, preferring the id when both id and IP are given.
fn delete_request(settings: &Settings, kind: ProviderKind, args: &DeleteCommand) -> HostDeleteRequest {
    let request = match (&args.id, &args.ip) {
        (Some(id), _) => HostDeleteRequest::by_id(id.as_str()),
        (None, Some(ip)) => HostDeleteRequest::by_ip(ip.as_str()),
        (None, None) => HostDeleteRequest::by_id(""),
    };
    request
        .with_project_id(settings.project_id.clone())
        .with_zone(settings.zone_for(kind))
        .with_region(Some(settings.region_for(kind)))
}

/// State for one `create` invocation.
struct CreateSession<'a> {
    kind: ProviderKind,
    descriptor: &'a HostDescriptor,
    auth_token: &'a str,
    control_port: u16,
    pro: bool,
    hold: bool,
}

impl CreateSession<'_> {
    /// Runs the lifecycle and reports the result. `signal` is called once per
    /// interruptible phase.
    async fn drive<P, S, F>(
        &self,
        out: &mut impl Write,
        driver: &LifecycleDriver<P>,
        signal: S,
    ) -> Result<i32, CliError>
    where
        P: Provisioner,
        S: Fn() -> F,
        F: Future<Output = ()>,
    {
        writeln!(
            out,
            "creating exit node {} on {} in {}",
            self.descriptor.name, self.kind, self.descriptor.region
        )?;
        match driver.run(self.descriptor, signal()).await? {
            RunOutcome::Active(host) => {
                self.write_connection_info(out, &host)?;
                if self.hold {
                    writeln!(out, "press Ctrl+C to delete the exit node")?;
                    driver
                        .hold_until_cancelled(&host, self.descriptor, signal())
                        .await?;
                    writeln!(out, "deleted {}", host.id)?;
                }
                Ok(0)
            }
            RunOutcome::Cancelled { host, deleted } => {
                if deleted {
                    writeln!(out, "interrupted; deleted {}", host.id)?;
                } else {
                    writeln!(out, "interrupted; {} is still running", host.id)?;
                    self.write_delete_hint(out, &host)?;
                }
                Ok(INTERRUPTED_EXIT_CODE)
            }
        }
    }

    fn write_connection_info(&self, out: &mut impl Write, host: &ProvisionedHost) -> io::Result<()> {
        writeln!(out, "exit node {} is active at {}", host.id, host.ip)?;
        writeln!(out, "auth token: {}", self.auth_token)?;
        if self.pro {
            writeln!(
                out,
                "connect with: inlets-pro tcp client --url \"wss://{}:{}/connect\" --token \"{}\" --upstream $UPSTREAM --ports $PORTS",
                host.ip, self.control_port, self.auth_token
            )?;
        } else {
            writeln!(
                out,
                "connect with: inlets client --remote \"ws://{}:{}\" --token \"{}\" --upstream $UPSTREAM",
                host.ip, self.control_port, self.auth_token
            )?;
        }
        self.write_delete_hint(out, host)
    }

    fn write_delete_hint(&self, out: &mut impl Write, host: &ProvisionedHost) -> io::Result<()> {
        write!(
            out,
            "to delete: waystation delete --provider {} --id \"{}\"",
            self.kind, host.id
        )?;
        if let Some(project) = self.descriptor.tag(TAG_PROJECT_ID) {
            write!(out, " --project-id \"{project}\"")?;
        }
        if let Some(zone) = &self.descriptor.zone {
            write!(out, " --zone \"{zone}\"")?;
        }
        writeln!(out)
    }
}

fn write_status(mut out: impl Write, host: &ProvisionedHost) -> io::Result<()> {
    let ip = if host.ip.is_empty() { "-" } else { host.ip.as_str() };
    writeln!(out, "{}\t{}\t{ip}", host.id, host.status)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;

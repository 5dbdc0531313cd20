use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use harvest_core::portal::{
    Authenticator, ChromiumLauncher, PortalAuthenticator, PortalError, ProfileManager,
    SessionFactory,
};
use harvest_core::{
    load_harvest_config, select_licenses, ConfigError, HarvestConfig, Job, JobRunner,
    JobScheduler, JobStatus, License, ReportKind, RunReport, SelectionError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "harvest.toml";

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("portal error: {0}")]
    Portal(#[from] PortalError),
    #[error("license selection failed: {0}")]
    Selection(#[from] SelectionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{failed} of {total} licenses failed")]
    JobsFailed { failed: usize, total: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Harvests reports and transfer manifests from a records portal", long_about = None)]
pub struct Cli {
    /// Path to harvest.toml (defaults to ./harvest.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Override run.output_dir
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Maximum number of licenses processed at once (minimum 2)
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Two-letter portal region
    #[arg(long)]
    pub region: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Debug logging for the harvester crates
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in and harvest reports and manifests for the selected licenses
    Run(RunArgs),
    /// Log in and list the licenses available to the account
    Licenses,
    /// List the report kinds that can be requested
    Reports,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// "all" or comma separated license numbers
    #[arg(long)]
    pub licenses: Option<String>,
    /// "all", "none" or comma separated report names
    #[arg(long)]
    pub reports: Option<String>,
    /// "all", "none" or comma separated directions (incoming, outgoing)
    #[arg(long)]
    pub documents: Option<String>,
}

pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("info,harvest_core=debug,harvestctl=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli, |key| std::env::var(key).ok())?;

    match &cli.command {
        Commands::Reports => render(&ReportCatalog::all(), cli.format)?,
        Commands::Licenses => {
            let licenses = block_on(list_licenses(&config))??;
            render(&LicenseList { licenses }, cli.format)?;
        }
        Commands::Run(_) => {
            let report = block_on(harvest(&config))??;
            render(&report, cli.format)?;
            if !report.all_succeeded() {
                return Err(AppError::JobsFailed {
                    failed: report.failed_count(),
                    total: report.total(),
                });
            }
        }
    }

    Ok(())
}

/// File, then `HARVEST_*` variables, then command-line flags.
pub fn resolve_config<F>(cli: &Cli, lookup: F) -> Result<HarvestConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &cli.config {
        Some(path) => load_harvest_config(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => load_harvest_config(DEFAULT_CONFIG)?,
        None => HarvestConfig::default(),
    };
    config.apply_env(lookup)?;

    if let Some(dir) = &cli.output_dir {
        config.run.output_dir = dir.clone();
    }
    if let Some(concurrency) = cli.concurrency {
        config.run.concurrency = concurrency;
    }
    if let Some(region) = &cli.region {
        config.portal.region = Some(region.clone());
    }
    if let Commands::Run(args) = &cli.command {
        if let Some(licenses) = &args.licenses {
            config.run.licenses = licenses.clone();
        }
        if let Some(reports) = &args.reports {
            config.run.reports = reports.clone();
        }
        if let Some(documents) = &args.documents {
            config.run.documents = documents.clone();
        }
    }
    Ok(config)
}

// The browser driver is not `Send`, so everything runs on one thread.
fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

async fn list_licenses(config: &HarvestConfig) -> Result<Vec<License>> {
    let portal_root = config.portal_root()?;
    let credentials = config.credentials()?;
    let factory: Rc<dyn SessionFactory> = Rc::new(ChromiumLauncher::from_config(config));
    let auth = PortalAuthenticator::new(factory, ProfileManager::from_config(config));
    let grant = auth.login(&portal_root, &credentials).await?;
    Ok(grant.licenses)
}

async fn harvest(config: &HarvestConfig) -> Result<RunReport> {
    let portal_root = config.portal_root()?;
    let credentials = config.credentials()?;
    let selection = config.license_selection()?;
    let reports = config.report_kinds()?;
    let directions = config.directions()?;

    let factory: Rc<dyn SessionFactory> = Rc::new(ChromiumLauncher::from_config(config));
    let auth = PortalAuthenticator::new(factory.clone(), ProfileManager::from_config(config));
    let grant = auth.login(&portal_root, &credentials).await?;

    let licenses = select_licenses(&grant.licenses, &selection, config.run.unmatched_licenses)?;
    info!(
        licenses = licenses.len(),
        reports = reports.len(),
        directions = directions.len(),
        "Harvest planned"
    );
    let jobs = Job::for_licenses(licenses, &reports, &directions);
    let runner = JobRunner::from_config(config, factory)?;
    let runner = &runner;
    let cookies = &grant.cookies;

    let scheduler = JobScheduler::new(config.run.concurrency);
    Ok(scheduler
        .run(jobs, |job| async move { runner.run(&job, cookies).await })
        .await)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
struct LicenseList {
    licenses: Vec<License>,
}

impl DisplayFallback for LicenseList {
    fn display(&self) -> String {
        if self.licenses.is_empty() {
            return "No licenses available to this account".to_string();
        }
        self.licenses
            .iter()
            .map(|license| format!("{} | {} | id={}", license.number, license.name, license.id))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ReportEntry {
    name: &'static str,
    identifier: String,
    label: &'static str,
}

#[derive(Debug, Serialize)]
struct ReportCatalog {
    reports: Vec<ReportEntry>,
}

impl ReportCatalog {
    fn all() -> Self {
        Self {
            reports: ReportKind::ALL
                .iter()
                .map(|kind| ReportEntry {
                    name: kind.name(),
                    identifier: kind.identifier(),
                    label: kind.label(),
                })
                .collect(),
        }
    }
}

impl DisplayFallback for ReportCatalog {
    fn display(&self) -> String {
        self.reports
            .iter()
            .map(|entry| format!("{:<20} {}", entry.name, entry.label))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Licenses: {} (succeeded: {}, failed: {}, concurrency: {})",
            self.total(),
            self.succeeded_count(),
            self.failed_count(),
            self.concurrency
        )];
        for outcome in &self.outcomes {
            let elapsed = (outcome.finished_at - outcome.started_at).num_seconds();
            let detail = match &outcome.status {
                JobStatus::Succeeded { summary } => format!(
                    "ok | reports={} documents={}",
                    summary.reports.len(),
                    summary.documents_downloaded()
                ),
                JobStatus::Failed { error } => format!("FAILED | {error}"),
            };
            lines.push(format!("  - {} | {} | {}s", outcome.license, detail, elapsed));
        }
        lines.join("\n")
    }
}

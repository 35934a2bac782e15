use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vmxport::config::AppConfig;
use vmxport::core::{ExportSession, ExportSubject, HttpSource, TransferTask};
use vmxport::logging::{self, LogThrottle};

#[derive(Parser)]
#[command(name = "vmxport")]
#[command(about = "Resilient parallel transfer engine for VM exports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./vmxport.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer every file listed in a manifest
    Run(RunArgs),
    /// Write the default configuration as TOML
    InitConfig {
        #[arg(long, default_value = "vmxport.toml")]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Serialize)]
struct LogArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short, long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,
}

#[derive(Args)]
struct RunArgs {
    /// JSON manifest produced by a provider client
    #[arg(long)]
    manifest: PathBuf,

    #[command(flatten)]
    transfer: TransferArgs,
}

#[derive(Args, Serialize)]
struct TransferArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    parallelism: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    bandwidth_limit: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    bandwidth_burst: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    resume_from_checkpoint: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    enable_checkpoints: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    checkpoint_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    verify_checksums: Option<bool>,
}

#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    transfer: Option<&'a TransferArgs>,
    log: &'a LogArgs,
}

#[derive(Deserialize)]
struct Manifest {
    subject: String,
    provider: String,
    format: String,
    output_dir: PathBuf,
    files: Vec<ManifestFile>,
}

#[derive(Deserialize)]
struct ManifestFile {
    source: String,
    /// Relative paths are resolved against the manifest's output directory.
    destination: PathBuf,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    name: Option<String>,
}

impl Manifest {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    fn into_parts(self) -> (ExportSubject, Vec<TransferTask>) {
        let tasks = self
            .files
            .into_iter()
            .map(|file| {
                let destination = if file.destination.is_absolute() {
                    file.destination
                } else {
                    self.output_dir.join(&file.destination)
                };
                let name = file.name.unwrap_or_else(|| {
                    destination
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| file.source.clone())
                });
                TransferTask::new(file.source, destination, file.size, name)
            })
            .collect();
        let subject = ExportSubject {
            name: self.subject,
            provider: self.provider,
            format: self.format,
            output_dir: self.output_dir,
        };
        (subject, tasks)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let transfer = match &cli.command {
        Commands::Run(args) => Some(&args.transfer),
        Commands::InitConfig { .. } => None,
    };
    let overrides = Overrides {
        transfer,
        log: &cli.log,
    };
    let config = AppConfig::load(cli.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Run(args) => {
            logging::init(&config.log);
            run_export(config, &args.manifest).await.context("Export failed")
        }
        Commands::InitConfig { output, force } => init_config(&config, &output, force),
    }
}

async fn run_export(config: AppConfig, manifest: &Path) -> Result<()> {
    let (subject, tasks) = Manifest::load(manifest)?.into_parts();
    let source = Arc::new(HttpSource::new().context("Failed to build HTTP client")?);
    let session = ExportSession::new(config.transfer, source);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling transfers");
            on_signal.cancel();
        }
    });

    let throttle = LogThrottle::new(Duration::from_secs(5));
    let report = session
        .run(&subject, tasks, &cancel, |progress| {
            if throttle.should_log() {
                info!(
                    downloaded = progress.downloaded,
                    total = progress.total,
                    percent = format!("{:.1}", progress.fraction() * 100.0),
                    speed_mbps = format!("{:.2}", progress.speed_mbps),
                    "export progress"
                );
            }
        })
        .await?;

    for result in report.failed() {
        if let Some(e) = &result.error {
            error!(file = %result.task.name, error = %e, "file failed");
        }
    }
    if let Some(path) = &report.checkpoint_path {
        info!(path = %path.display(), "rerun with --resume-from-checkpoint to continue");
    }

    let failed = report.failed().count();
    if report.cancelled() > 0 {
        bail!("export cancelled ({} file(s) incomplete)", report.cancelled());
    }
    if failed > 0 || !report.succeeded() {
        bail!("{failed} file(s) failed");
    }
    Ok(())
}

fn init_config(config: &AppConfig, output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let content = config.to_toml().context("Failed to serialize config")?;
    std::fs::write(output, content).context("Failed to write config file")?;
    println!("Wrote {}", output.display());
    Ok(())
}

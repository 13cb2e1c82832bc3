use std::path::PathBuf;

use clap::{Parser, Subcommand};
use epias_tools::config::{RunConfig, load_config};
use epias_tools::{Result, ToolError, run};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = init_logging() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
    if let Err(err) = dispatch(cli).await {
        error!(error = %err, "run aborted");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| ToolError::Logging(e.to_string()))
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Export(args) => execute_export(args).await,
    }
}

async fn execute_export(args: ExportArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);

    let summary = run::run(&config).await?;
    println!("{summary}");
    Ok(())
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Download approved hourly meter data and pivot it into one workbook."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download every meter listed in the workbook and rebuild the pivot.
    Export(ExportArgs),
}

#[derive(clap::Args)]
struct ExportArgs {
    /// TOML configuration file. Values can be overridden with EPIAS_* variables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workbook holding the meter list; rewritten with the results.
    #[arg(long)]
    workbook: Option<PathBuf>,

    /// Number of concurrent downloads.
    #[arg(long)]
    workers: Option<usize>,

    /// Directory receiving the per-meter exports.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// CAS username.
    #[arg(long)]
    username: Option<String>,

    /// Also write the manifest as JSON to this path.
    #[arg(long)]
    manifest_json: Option<PathBuf>,
}

impl ExportArgs {
    fn apply(self, config: &mut RunConfig) {
        if let Some(workbook) = self.workbook {
            config.workbook.path = workbook;
        }
        if let Some(workers) = self.workers {
            config.fetch.workers = workers;
        }
        if let Some(output_dir) = self.output_dir {
            config.fetch.output_dir = output_dir;
        }
        if let Some(username) = self.username {
            config.auth.username = username;
        }
        if let Some(manifest_json) = self.manifest_json {
            config.workbook.manifest_json = Some(manifest_json);
        }
    }
}

mod check;
mod persist;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use salesflow_agent::{CrewGateway, SalesPipeline};
use salesflow_core::config::AppConfig;
use salesflow_core::types::{FlowStatus, RunId};
use salesflow_core::EventBus;
use salesflow_flow::RunLogger;

use persist::FileSink;

/// How long the run logger gets to drain after the run finishes.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "salesflow",
    version,
    about = "Lead scoring and outreach email pipeline",
    after_help = "Configuration is read from $SALESFLOW_CONFIG (default: salesflow.toml)."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once over the configured leads (default)
    Run,
    /// Validate the configuration and print the step graph
    Check,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("salesflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "salesflow", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => run_check(),
        Commands::Run => run_pipeline().await,
    }
}

fn load_config() -> anyhow::Result<AppConfig> {
    let path = AppConfig::config_path();
    AppConfig::load(&path).with_context(|| format!("loading config from {}", path.display()))
}

fn run_check() -> anyhow::Result<ExitCode> {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            println!("  [!!] Config: {:#}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    println!("  [OK] Config: {}", AppConfig::config_path().display());

    let llm = salesflow_llm::create_client(&config.model)?;
    let gateway = Arc::new(CrewGateway::from_config(&config, llm));
    let registry = SalesPipeline::from_config(&config, gateway).registry()?;
    registry.validate()?;

    if check::run_check(&config, &registry) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn run_pipeline() -> anyhow::Result<ExitCode> {
    let config = load_config()?;

    let llm = salesflow_llm::create_client(&config.model)?;
    let gateway = Arc::new(CrewGateway::from_config(&config, llm));
    let event_bus = Arc::new(EventBus::default());
    let engine = SalesPipeline::from_config(&config, gateway)
        .engine()?
        .with_fan(config.pipeline.fan.clone())
        .with_events(event_bus.clone());

    let run_id = RunId::new();
    let cancel = CancellationToken::new();

    let logger = config.log_dir().map(|dir| {
        let level = config.log.as_ref().map_or(2, |l| l.level);
        let logger = RunLogger::new(dir, level);
        info!(path = %logger.log_path(&run_id).display(), "Run log enabled");
        tokio::spawn(logger.run(event_bus.clone(), run_id.clone(), cancel.clone()))
    });

    let seed = SalesPipeline::seed(&config.leads)?;
    info!(
        run_id = %run_id,
        leads = config.leads.len(),
        model = %config.model.model_id,
        "Starting pipeline"
    );

    let run = tokio::select! {
        run = engine.kickoff_as(run_id, seed) => run,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; abandoning run");
            cancel.cancel();
            return Ok(ExitCode::from(130));
        }
    };

    if let Some(handle) = logger {
        if tokio::time::timeout(LOG_DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("Run logger did not drain in time");
            cancel.cancel();
        }
    }

    let sink = FileSink::new(config.output_dir());
    let written = persist::write_artifacts(&run, &sink, chrono::Utc::now());

    let emails = run
        .output()
        .and_then(|v| v.as_array())
        .map_or(0, |a| a.len());
    println!();
    println!("  Run {}: {}", run.run_id, run.status);
    println!("  Emails generated: {}", emails);
    for path in &written {
        println!("  Wrote {}", path.display());
    }
    if !run.skipped.is_empty() {
        println!("  Skipped steps: {}", run.skipped.join(", "));
    }

    match run.status {
        FlowStatus::Completed => Ok(ExitCode::SUCCESS),
        _ => {
            for record in run.failed_steps() {
                error!(step = %record.step, outcome = ?record.outcome, "Step failed");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

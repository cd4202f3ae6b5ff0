//! Requirements finalizer CLI.
//!
//! # Usage
//!
//! ```bash
//! # Live run (needs FINALIZE_API_KEY or OPENAI_API_KEY)
//! finalize-agent finalize "Build a todo CLI with due dates"
//!
//! # Offline stub, request read from a file, extra context
//! finalize-agent finalize --input request.txt --offline --context "internal tool"
//!
//! # Usage ledger for the last 7 days
//! finalize-agent cost-report --days 7
//! ```
//!
//! Exit codes: 0 finalized, 2 needs human review, 1 failed.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use finalize_agent::config::FinalizeConfig;
use finalize_agent::orchestrator::Orchestrator;
use finalize_agent::report::CostReport;
use finalize_gates::UsageLedger;
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (overrides FINALIZE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for run artifacts and the usage ledger (overrides FINALIZE_RUNS_DIR)
    #[arg(long, global = true)]
    runs_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Turn a raw request into a validated requirements object
    Finalize(FinalizeArgs),
    /// Show token and cost usage from the ledger
    CostReport {
        /// Most recent N days
        #[arg(long, default_value_t = 7, conflicts_with = "all")]
        days: usize,

        /// Every recorded day
        #[arg(long, default_value_t = false)]
        all: bool,
    },
}

#[derive(Args, Debug)]
struct FinalizeArgs {
    /// Raw request text
    #[arg(required_unless_present = "input", conflicts_with = "input")]
    text: Option<String>,

    /// Read the request from a file
    #[arg(long)]
    input: Option<PathBuf>,

    /// Prior context for the model
    #[arg(long)]
    context: Option<String>,

    /// Use the deterministic offline client instead of the model
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Do not write the run artifact
    #[arg(long, default_value_t = false)]
    no_artifact: bool,
}

const ENV_CONFIG_PATH: &str = "FINALIZE_CONFIG";

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<FinalizeConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from));
    let mut config = FinalizeConfig::load(path.as_deref()).context("loading configuration")?;
    if let Some(dir) = &cli.runs_dir {
        config.runs_dir = dir.clone();
    }
    Ok(config)
}

async fn finalize(mut config: FinalizeConfig, args: FinalizeArgs) -> Result<i32> {
    let text = match (&args.text, &args.input) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading request from {}", path.display()))?,
        (None, None) => bail!("no request text given"),
    };
    if args.no_artifact {
        config.persist_artifacts = false;
    }

    let orchestrator = Orchestrator::from_config(config).context("building orchestrator")?;
    let result = orchestrator
        .run_finalize(&text, !args.offline, args.context.as_deref())
        .await;
    orchestrator.flush_telemetry().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    info!(trace_id = %result.trace_id, status = %result.status, "done");
    Ok(result.status.exit_code())
}

fn cost_report(config: &FinalizeConfig, days: usize, all: bool) -> Result<i32> {
    let path = config.ledger_path();
    let ledger = UsageLedger::load(&path)
        .with_context(|| format!("reading usage ledger {}", path.display()))?;
    let report = CostReport::from_ledger(&ledger, (!all).then_some(days));
    print!("{}", report.render());
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = load_config(&cli)?;

    let code = match cli.command {
        Command::Finalize(args) => finalize(config, args).await?,
        Command::CostReport { days, all } => cost_report(&config, days, all)?,
    };
    std::process::exit(code);
}

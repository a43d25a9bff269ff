//! # Barrage CLI
//!
//! Runs a load test plan against an HTTP service and exits with the verdict.
//!
//! ## Usage
//!
//! ```bash
//! # Default plan against a local service
//! barrage run --target http://localhost:8080
//!
//! # Plan from a file, results written as JSON and Prometheus text
//! barrage run --config config/stress-test.toml --output results.json --prometheus-out results.prom
//!
//! # Validate a config, or print the built-in one as a starting point
//! barrage validate --config config/stress-test.toml
//! barrage print-config > my-test.toml
//! ```
//!
//! Exit status is 0 when every threshold passed, 1 when a threshold failed
//! or the run was interrupted, and 2 when the run could not be carried out.

use anyhow::Context;
use barrage_core::LoadTestConfig;
use barrage_loadtest::*;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "barrage")]
#[command(author = "Barrage Developers")]
#[command(version)]
#[command(about = "Scenario-driven HTTP load testing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "BARRAGE_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a load test plan
    Run {
        /// TOML plan; the built-in plan is used when omitted
        #[arg(short, long, env = "BARRAGE_CONFIG")]
        config: Option<PathBuf>,

        /// Override the target base URL
        #[arg(short, long, env = "BARRAGE_TARGET")]
        target: Option<String>,

        /// Write the run result as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write final aggregates in Prometheus text format
        #[arg(long)]
        prometheus_out: Option<PathBuf>,

        /// Seed for think-time and workload selection
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Check a plan without running it
    Validate {
        /// TOML plan
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the built-in plan as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let outcome = match cli.command {
        Commands::Run {
            config,
            target,
            output,
            prometheus_out,
            seed,
        } => {
            run(
                config.as_deref(),
                target,
                output.as_deref(),
                prometheus_out.as_deref(),
                seed,
            )
            .await
        }
        Commands::Validate { config } => validate(&config),
        Commands::PrintConfig => print_config(),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(EXIT_FATAL);
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<LoadTestConfig> {
    match path {
        Some(path) => LoadTestConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(LoadTestConfig::default()),
    }
}

async fn run(
    config_path: Option<&Path>,
    target: Option<String>,
    output: Option<&Path>,
    prometheus_out: Option<&Path>,
    seed: Option<u64>,
) -> anyhow::Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(target) = target {
        config.target.base_url = target;
    }
    config.validate().context("invalid configuration")?;

    let mut plan = RunPlan::from_config(&config)?;
    if let Some(seed) = seed {
        plan = plan.with_seed(seed);
    }
    let pool_size = plan.peak_concurrent_vus().max(1) as usize;

    info!(
        target = %config.target.base_url,
        scenarios = plan.scenarios.len(),
        planned = ?plan.planned_duration(),
        "Barrage load test"
    );

    let transport = HttpTransport::new(
        &config.target.base_url,
        config.target.request_timeout.get(),
        pool_size,
    )?;
    let mix = user_api_registry().mix(&config.workloads)?;
    let hooks = HealthCheckHooks::new(&config.target.base_url, &config.target.health_path);

    let orchestrator = RunOrchestrator::new(plan, Arc::new(transport), mix, Arc::new(hooks))?;

    let abort = orchestrator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping virtual users");
            abort.abort();
        }
    });

    let result = orchestrator.run().await?;
    result.print_report();

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!("Results saved to: {}", path.display());
    }
    if let Some(path) = prometheus_out {
        let text = render_prometheus(&result)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        info!("Prometheus metrics saved to: {}", path.display());
    }

    Ok(result.exit_code())
}

fn validate(path: &Path) -> anyhow::Result<i32> {
    let config = load_config(Some(path))?;
    config.validate().context("invalid configuration")?;
    // Workload names are only known to the registry
    user_api_registry().mix(&config.workloads)?;

    let plan = RunPlan::from_config(&config)?;
    println!(
        "{}: {} scenarios, {} thresholds, {:?} planned",
        path.display(),
        plan.scenarios.len(),
        plan.thresholds.len(),
        plan.planned_duration()
    );
    Ok(EXIT_PASSED)
}

fn print_config() -> anyhow::Result<i32> {
    print!("{}", LoadTestConfig::default().to_toml_string()?);
    Ok(EXIT_PASSED)
}

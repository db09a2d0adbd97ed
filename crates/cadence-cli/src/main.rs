use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use cadence_adapters::{tracker_from_env, tracker_from_fixture, TrackerApi};
use cadence_analytics::{SchedulingService, ServiceConfig};
use cadence_core::DateRange;
use cadence_http::env_or;
use cadence_web::AppState;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cadence-cli")]
#[command(about = "Scheduling dashboard API and cycle-time tooling")]
struct Cli {
    /// Serve from a tracker fixture instead of the live API.
    #[arg(long, global = true, env = "CADENCE_FIXTURE_PATH")]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print cycle-time records for the given work item ids as JSON.
    CycleTime {
        #[arg(required = true, value_parser = clap::value_parser!(u32).range(1..))]
        ids: Vec<u32>,
    },
    /// Print the scheduling query result as JSON.
    WorkItems {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Probe the upstream project; exits non-zero when unhealthy.
    Health,
}

/// Filter from `RUST_LOG`, then `LOG_LEVEL`, then `default_level`.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(true).init();
}

async fn build_tracker(fixture: Option<PathBuf>) -> Result<Arc<dyn TrackerApi>> {
    match fixture {
        Some(path) => tracker_from_fixture(path).await,
        None => tracker_from_env().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing("info");

    let cli = Cli::parse();
    let tracker = build_tracker(cli.fixture).await?;
    let service = SchedulingService::new(tracker, ServiceConfig::from_env());

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| env_or("CADENCE_WEB_PORT", 3001));
            cadence_web::serve(AppState::new(service), port).await?;
        }
        Commands::CycleTime { ids } => {
            let result = service.cycle_times(&ids).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::WorkItems { from, to } => {
            let range = DateRange::from_bounds(from.as_deref(), to.as_deref())?;
            let items = service.work_items(range).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Commands::Health => {
            let healthy = service.health().await;
            println!("healthy={healthy} tracker={}", service.tracker_id());
            if !healthy {
                bail!("upstream tracker is unhealthy");
            }
        }
    }

    Ok(())
}

//! spindle - run a sealing engine against a shared SQLite store.
//!
//! ```text
//! spindle run                                   # engine + pipeline poller + reaper
//! spindle add-sector --sp-id 1000 --sector 1   # start sealing a sector
//! spindle status                                # task counts and stage states
//! ```
//!
//! Configuration is read from `SPINDLE_*` environment variables (see `settings.rs`).

mod settings;
mod sim;

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::{select, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spindle_core::app::{EngineBuilder, StatusReport};
use spindle_core::impls::SqliteStore;
use spindle_core::ports::TaskStore;
use spindle_core::sealing::{
    LocalPathAllocator, MoveStorageTask, PreCommitSendTask, SdrTask, SealProof, SectorRef,
    TreesTask, add_sector, sdr_pipeline,
};

use crate::settings::Settings;
use crate::sim::{LoggingSender, SimulatedSealCalls};

#[derive(Parser, Debug)]
#[command(name = "spindle", about = "Store-coordinated sector sealing scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the task engine with the subsystems enabled in the environment.
    Run,
    /// Insert a sector into the sealing pipeline.
    AddSector {
        #[arg(long)]
        sp_id: u64,
        #[arg(long = "sector")]
        sector_number: u64,
        #[arg(long, value_enum, default_value_t = ProofArg::Kib2)]
        proof: ProofArg,
    },
    /// Show task counts and per-sector stage states.
    Status {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProofArg {
    #[value(name = "2KiB")]
    Kib2,
    #[value(name = "32GiB")]
    Gib32,
}

impl From<ProofArg> for SealProof {
    fn from(arg: ProofArg) -> Self {
        match arg {
            ProofArg::Kib2 => SealProof::StackedDrg2KiB,
            ProofArg::Gib32 => SealProof::StackedDrg32GiB,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spindle_core=info,spindle=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Command::Run => run(settings).await,
        Command::AddSector {
            sp_id,
            sector_number,
            proof,
        } => {
            let store = SqliteStore::connect(&settings.database_url).await?;
            let pipeline = sdr_pipeline()?;
            store.ensure_pipeline(&pipeline).await?;

            let sector = SectorRef::new(sp_id, sector_number, proof.into());
            if add_sector(&store, &pipeline, &sector).await? {
                info!(sector = %sector, "sector added");
            } else {
                info!(sector = %sector, "sector already in the pipeline");
            }
            Ok(())
        }
        Command::Status { limit, json } => {
            let store = SqliteStore::connect(&settings.database_url).await?;
            let pipeline = sdr_pipeline()?;
            store.ensure_pipeline(&pipeline).await?;

            let report = StatusReport::collect(&store, &[pipeline], limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let enabled = settings.subsystems.enabled();
    if enabled.is_empty() {
        bail!("no subsystems enabled; set e.g. SPINDLE_ENABLE_SDR=1");
    }

    info!(
        host = %settings.host,
        capacity = ?settings.capacity,
        subsystems = ?enabled,
        "starting spindle"
    );

    let store = Arc::new(SqliteStore::connect(&settings.database_url).await?);
    info!(url = %settings.database_url, "connected to store");

    let pipeline = sdr_pipeline()?;
    let calls = Arc::new(SimulatedSealCalls::new(settings.sim_delay));
    let paths = Arc::new(LocalPathAllocator::new(settings.storage_roots()));

    let mut builder = EngineBuilder::new(store, settings.engine_config())
        .host(settings.host.clone())
        .poller_config(settings.poller_config())
        .reaper_config(settings.reaper_config())
        .expect_tasks(&enabled);

    let subsystems = &settings.subsystems;
    if let Some(max) = subsystems.sdr {
        builder = builder.register(Arc::new(SdrTask::new(
            Arc::clone(&pipeline),
            calls.clone(),
            paths.clone(),
            max,
        )))?;
    }
    if let Some(max) = subsystems.trees {
        builder = builder.register(Arc::new(TreesTask::new(
            Arc::clone(&pipeline),
            calls.clone(),
            paths.clone(),
            max,
        )))?;
    }
    if let Some(max) = subsystems.precommit {
        builder = builder.register(Arc::new(PreCommitSendTask::new(
            Arc::clone(&pipeline),
            Arc::new(LoggingSender),
            max,
        )))?;
    }
    if let Some(max) = subsystems.move_storage {
        builder = builder.register(Arc::new(MoveStorageTask::new(
            Arc::clone(&pipeline),
            calls.clone(),
            paths.clone(),
            max,
        )))?;
    }

    let runtime = builder.build().await?.start();
    info!(engine_id = %runtime.engine().id(), "engine running - waiting for shutdown signal");

    wait_for_shutdown().await?;
    info!("shutdown signal received - finishing running tasks");
    runtime.shutdown_and_join().await;

    info!("shutdown complete");
    Ok(())
}

fn print_report(report: &StatusReport) {
    let counts = &report.counts;
    println!(
        "tasks: queued={} running={} succeeded={} dead={}",
        counts.queued, counts.running, counts.succeeded, counts.dead
    );
    for pipeline in &report.pipelines {
        println!("\n{} ({} entities)", pipeline.table, pipeline.entities.len());
        for entity in &pipeline.entities {
            let stages: Vec<String> = entity
                .stages
                .iter()
                .map(|(stage, state)| format!("{stage}={state}"))
                .collect();
            println!("  {:<16} {}", entity.key, stages.join(" "));
        }
    }
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}

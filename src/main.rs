//! mm2 — tiered time-series storage engine demo harness
//!
//! Usage:
//!   mm2 run     --config config.toml
//!   mm2 status  --config config.toml
//!   mm2 inspect --config config.toml --source can-device --sensor 1
//!   mm2 recover --config config.toml

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mm2::config::EngineConfig;
use mm2::{Engine, UploadSource};

#[derive(Parser)]
#[command(name = "mm2", about = "Tiered time-series storage engine for an embedded telematics gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Gateway,
    HostedDevice,
    BleDevice,
    CanDevice,
}

impl From<SourceArg> for UploadSource {
    fn from(s: SourceArg) -> Self {
        match s {
            SourceArg::Gateway => UploadSource::Gateway,
            SourceArg::HostedDevice => UploadSource::HostedDevice,
            SourceArg::BleDevice => UploadSource::BleDevice,
            SourceArg::CanDevice => UploadSource::CanDevice,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Open the engine, run a short synthetic write/migrate/upload
    /// demonstration, and print the resulting stats.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Number of 1Hz ticks to simulate.
        #[arg(long, default_value_t = 30)]
        ticks: u32,
    },
    /// Open (and recover) the engine, print a stats snapshot, and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print per-sensor counters for one (source, sensor) pair.
    Inspect {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long, value_enum)]
        source: SourceArg,
        #[arg(long)]
        sensor: u32,
    },
    /// Force a recovery pass (journal replay + spool scan) and report it.
    Recover {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, ticks } => run_demo(config, ticks),
        Command::Status { config } => run_status(config),
        Command::Inspect { config, source, sensor } => run_inspect(config, source.into(), sensor),
        Command::Recover { config } => run_recover(config),
    }
}

fn load_config(path: &PathBuf) -> EngineConfig {
    match EngineConfig::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    }
}

fn open_engine(path: &PathBuf) -> Engine {
    let cfg = load_config(path);
    match Engine::open(cfg) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "failed to open engine");
            std::process::exit(1);
        }
    }
}

fn run_demo(config_path: PathBuf, ticks: u32) {
    let engine = open_engine(&config_path);
    info!(ticks, "starting synthetic workload");

    for i in 0..200u64 {
        let _ = engine.write_tsd(UploadSource::CanDevice, 1, 1000, i * 1000, (i % 100) as u32);
    }
    for i in 0..20u64 {
        let _ = engine.write_evt(UploadSource::Gateway, 7, i * 500, i as u32);
    }

    for now_ms in 0..ticks {
        if let Err(e) = engine.tick(now_ms as u64 * 1000) {
            error!(error = %e, tick = now_ms, "tick failed");
        }
    }

    if let Ok(batch) = engine.read_bulk(UploadSource::CanDevice, 1, 10) {
        info!(count = batch.len(), "read a batch for upload");
        if engine.erase_pending(UploadSource::CanDevice, 1).is_ok() {
            info!("batch acknowledged");
        }
    }

    let stats = engine.stats();
    println!("=== mm2 run ===");
    println!("pool used     : {}/{}", stats.pool.used, stats.pool.total);
    println!("tracked sensors: {}", stats.tracked_sensors);
    println!("disk files    : {}", stats.disk_files);
}

fn run_status(config_path: PathBuf) {
    let engine = open_engine(&config_path);
    let stats = engine.stats();
    println!("=== mm2 status ===");
    println!("pool          : {}/{} sectors used ({} peak)", stats.pool.used, stats.pool.total, stats.pool.peak_used);
    println!("failed allocs : {}", stats.pool.failed_allocs);
    println!("tracked sensors: {}", stats.tracked_sensors);
    println!("disk files    : {}", stats.disk_files);
    println!("migration idle: {}", stats.migration_phase_is_idle);
}

fn run_inspect(config_path: PathBuf, source: UploadSource, sensor: u32) {
    let engine = open_engine(&config_path);
    match (engine.total_count(source, sensor), engine.new_count(source, sensor), engine.sector_count(source, sensor)) {
        (Ok(total), Ok(new), Ok(sectors)) => {
            println!("=== mm2 inspect {:?}/{} ===", source, sensor);
            println!("total records : {total}");
            println!("new (unread)  : {new}");
            println!("sectors       : {sectors}");
        }
        _ => {
            eprintln!("no such sensor: {:?}/{}", source, sensor);
            std::process::exit(1);
        }
    }
}

fn run_recover(config_path: PathBuf) {
    let engine = open_engine(&config_path);
    let stats = engine.stats();
    println!("=== mm2 recover ===");
    println!("recovered sensors: {}", stats.tracked_sensors);
    println!("recovered disk files: {}", stats.disk_files);
}

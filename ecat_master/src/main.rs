//! # ECAT Master Binary
//!
//! Loads a device descriptor, brings the bus up and runs the cyclic
//! process-data exchange until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run against the simulation driver
//! ecat_master --devices slaves.json --simulate
//!
//! # Loopback outputs to inputs in simulation
//! ecat_master --devices slaves.json -s --sim-config sim.json
//!
//! # Master settings from TOML, 2 kHz, print values every 500 ms
//! ecat_master --config master.toml --frequency 2000 --print-interval-ms 500
//! ```

use clap::Parser;
use ecat_common::config::{ConfigLoader, LogLevel, MasterConfig};
use ecat_common::consts::DEFAULT_CONFIG_PATH;
use ecat_master::drivers::simulation::{SimulationConfig, SimulationDriver};
use ecat_master::{ConfigSource, CycleReport, DriverRegistry, EcatMaster, MasterError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// ECAT Master - fieldbus process-data master
#[derive(Parser, Debug)]
#[command(name = "ecat_master")]
#[command(version)]
#[command(about = "Fieldbus process-data master: device sequencing, cyclic exchange, object requests")]
#[command(long_about = None)]
struct Args {
    /// Path to master settings (master.toml). Defaults apply if the default path is missing.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Path to the JSON device descriptor. Overrides `[devices] path`.
    #[arg(short, long, value_name = "JSON")]
    devices: Option<PathBuf>,

    /// Sort the flattened entries after loading.
    #[arg(long)]
    sort: bool,

    /// Force simulation driver
    #[arg(short = 's', long)]
    simulate: bool,

    /// Simulation driver settings (JSON), implies --simulate
    #[arg(long, value_name = "JSON")]
    sim_config: Option<PathBuf>,

    /// Driver to use
    #[arg(long, default_value = "simulation")]
    driver: String,

    /// Exchange frequency in Hz. Overrides the configured period.
    #[arg(short, long)]
    frequency: Option<u32>,

    /// Print the entry values every N milliseconds (0 = never)
    #[arg(long, default_value_t = 1000)]
    print_interval_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("ecat_master failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = load_master_config(&args);
    let level = config.as_ref().map(|c| c.logging.level).unwrap_or_default();
    setup_tracing(&args, level);
    let mut config = config?;

    info!("ECAT Master v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Some(hz) = args.frequency {
        config.master.frequency_hz = Some(hz);
        config.master.period_us = None;
    }
    let devices_path = args.devices.clone().unwrap_or_else(|| config.devices.path.clone());
    let sort = args.sort || config.devices.sort;

    let simulate = args.simulate || args.sim_config.is_some();
    let driver_name = if simulate { "simulation" } else { args.driver.as_str() };
    let mut master = EcatMaster::new(config, DriverRegistry::with_builtin(), driver_name)?;
    if let Some(path) = &args.sim_config {
        master.inject_driver(Box::new(SimulationDriver::new(load_sim_config(path)?)));
    }

    master.load_configuration(ConfigSource::Path(devices_path), sort)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let session = match master.start(log_report) {
        Ok(session) => session,
        Err(e) => {
            if e.is_fatal() {
                error!("Bring-up failed, bus left unconfigured");
            }
            return Err(e.into());
        }
    };

    let print_interval = Duration::from_millis(args.print_interval_ms);
    let mut last_print = Instant::now();
    while running.load(Ordering::SeqCst) && !session.is_finished() {
        std::thread::sleep(Duration::from_millis(10));
        if !print_interval.is_zero() && last_print.elapsed() >= print_interval {
            last_print = Instant::now();
            print_values(&master);
        }
    }

    master.stop();
    let stats = session.wait()?;
    info!(
        "ECAT Master shutdown complete: {} cycles, avg {} ns, {} overruns",
        stats.cycle_count,
        stats.avg_cycle_ns(),
        stats.overruns
    );
    Ok(())
}

/// Master settings: the given file, or defaults when the default path is absent.
fn load_master_config(args: &Args) -> Result<MasterConfig, MasterError> {
    if args.config == Path::new(DEFAULT_CONFIG_PATH) && !args.config.exists() {
        return Ok(MasterConfig::default());
    }
    Ok(MasterConfig::load_validated(&args.config)?)
}

fn load_sim_config(path: &Path) -> Result<SimulationConfig, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn log_report(report: &CycleReport) {
    if report.state_changed {
        info!(
            "Cycle {}: AL states {} ({})",
            report.cycle,
            report.al_states,
            if report.operational { "ready" } else { "not ready" }
        );
    }
}

fn print_values(master: &EcatMaster) {
    let (latency, jitter) = master.latency_and_jitter();
    match master.snapshot_values() {
        Ok(values) => match serde_json::to_string(&values) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("Cannot serialize values: {e}"),
        },
        Err(e) => warn!("No values: {e}"),
    }
    info!(
        "Domain {:?}, latency {latency} ns, jitter {jitter} ns",
        master.domain_state()
    );
}

/// Setup tracing subscriber based on CLI arguments and the configured level.
fn setup_tracing(args: &Args, level: LogLevel) {
    let directive = if args.verbose { "debug" } else { level.as_directive() };
    let filter = EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .unwrap_or_else(|_| tracing::Level::INFO.into()),
    );

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

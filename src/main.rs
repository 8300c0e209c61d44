//! Gait Stim Agent CLI
//!
//! Closed-loop force-plate acquisition driving an electrical stimulator.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use gait_stim_agent::{
    config::{Config, ConfigError},
    core::{AcquisitionLoop, CompletedCycle},
    sim::{GaitProfile, SimServer},
    status::{create_shared_status_with_persistence, PersistedStats},
    stimulator::DryRunStimulator,
    transport::TcpTransport,
    SAFETY_NOTICE, VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code for an invalid or unreadable configuration.
const EXIT_CONFIG: i32 = 2;
/// Exit code when the force-plate server is unreachable at startup.
const EXIT_TRANSPORT: i32 = 3;

const STATS_FILE: &str = "loop_stats.json";

#[derive(Parser)]
#[command(name = "gait-stim")]
#[command(version = VERSION)]
#[command(about = "Closed-loop force-plate stimulation agent", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition and stimulation loop
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Completed cycles queued for the consumer before dropping
        #[arg(long, default_value = "8")]
        cycle_queue: usize,
    },

    /// Serve synthetic force-plate frames
    Simulate {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (defaults to the configured transport port)
        #[arg(long)]
        port: Option<u16>,

        /// Samples returned per request
        #[arg(long, default_value = "10")]
        samples_per_tick: usize,

        /// Strides per second
        #[arg(long, default_value = "1.0")]
        cadence: f64,
    },

    /// Show configuration summary and cumulative statistics
    Status,

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },

    /// Display stimulation safety notice
    Safety,
}

/// Command-line overrides applied on top of the configuration file.
#[derive(Args)]
struct Overrides {
    /// Force-plate server host
    #[arg(long)]
    host: Option<String>,

    /// Force-plate server port
    #[arg(long)]
    port: Option<u16>,

    /// Polls per second
    #[arg(long)]
    frequency: Option<f64>,

    /// Vertical force threshold for cycle detection
    #[arg(long)]
    threshold: Option<f64>,

    /// Start with the stimulator armed
    #[arg(long)]
    arm: bool,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.transport.host = host;
        }
        if let Some(port) = self.port {
            config.transport.port = port;
        }
        if let Some(frequency) = self.frequency {
            config.read_frequency_hz = frequency;
        }
        if let Some(threshold) = self.threshold {
            config.vertical_force_threshold = threshold;
        }
        if self.arm {
            config.stimulator_armed = true;
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config;
    let result = match cli.command {
        Commands::Run {
            overrides,
            cycle_queue,
        } => cmd_run(config_path.as_deref(), overrides, cycle_queue),
        Commands::Simulate {
            host,
            port,
            samples_per_tick,
            cadence,
        } => cmd_simulate(config_path.as_deref(), &host, port, samples_per_tick, cadence),
        Commands::Status => cmd_status(config_path.as_deref()),
        Commands::Config { save } => cmd_config(config_path.as_deref(), save),
        Commands::Safety => {
            cmd_safety();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Load the configuration or exit with the configuration error code.
fn load_config_or_exit(path: Option<&Path>) -> Config {
    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "could not load configuration");
            eprintln!("Error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

fn cmd_run(config_path: Option<&Path>, overrides: Overrides, cycle_queue: usize) -> anyhow::Result<()> {
    println!("Gait Stim Agent v{VERSION}");
    println!();

    let mut config = load_config_or_exit(config_path);
    overrides.apply(&mut config);

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        eprintln!("Error: invalid configuration: {e}");
        std::process::exit(EXIT_CONFIG);
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    println!("Starting acquisition...");
    println!("  Server: {}", config.transport.address());
    println!("  Frequency: {} Hz", config.read_frequency_hz);
    println!("  Cycle threshold: {} N (plate {})", config.vertical_force_threshold, config.reference_plate);
    for group in &config.channel_groups {
        println!("  Plate {} -> channels {}", group.plate, group.channels);
    }
    println!(
        "  Stimulator: {}",
        if config.stimulator_armed {
            "armed"
        } else {
            "disarmed"
        }
    );

    let transport = match TcpTransport::connect(config.transport.address()) {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!(addr = %config.transport.address(), error = %e, "could not connect to force-plate server");
            eprintln!("Error: could not connect to {}: {e}", config.transport.address());
            std::process::exit(EXIT_TRANSPORT);
        }
    };
    let stimulator = DryRunStimulator::new(config.stimulation.clone(), config.stimulator_armed);

    let status = create_shared_status_with_persistence(
        config.channel_groups.len(),
        config.data_path.join(STATS_FILE),
    );
    println!("Run ID: {}", status.run_id());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(Arc::clone(&running))?;

    let (cycle_tx, cycle_rx) = crossbeam_channel::bounded(cycle_queue.max(1));
    let acquisition = AcquisitionLoop::new(&config, transport, stimulator)
        .with_status(Arc::clone(&status))
        .with_cycle_sink(cycle_tx);
    let handle = acquisition
        .spawn(Arc::clone(&running))
        .context("could not start acquisition thread")?;

    while running.load(Ordering::SeqCst) {
        match cycle_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(cycle) => print_cycle(&cycle, config.reference_plate),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                eprintln!("Acquisition loop exited unexpectedly");
                break;
            }
        }
    }

    println!();
    println!("Stopping acquisition...");
    running.store(false, Ordering::SeqCst);

    let acquisition = handle
        .join()
        .map_err(|_| anyhow::anyhow!("acquisition thread panicked"))?;
    let stimulator = acquisition.shutdown();
    tracing::info!(
        starts = stimulator.start_count(),
        stops = stimulator.stop_count(),
        "stimulator released"
    );
    drop(stimulator);

    for cycle in cycle_rx.try_iter() {
        print_cycle(&cycle, config.reference_plate);
    }

    if let Err(e) = status.save() {
        eprintln!("Warning: Could not save loop statistics: {e}");
    }

    println!();
    println!("{}", status.summary());
    Ok(())
}

fn print_cycle(cycle: &CompletedCycle, reference_plate: usize) {
    println!(
        "[Cycle {}] {:.2}s | {} ticks | {} samples",
        cycle.index,
        cycle.duration_secs(),
        cycle.ticks,
        cycle.buffer.sample_count(reference_plate)
    );
}

fn cmd_simulate(
    config_path: Option<&Path>,
    host: &str,
    port: Option<u16>,
    samples_per_tick: usize,
    cadence: f64,
) -> anyhow::Result<()> {
    let config = load_config_or_exit(config_path);
    let port = port.unwrap_or(config.transport.port);

    let profile = GaitProfile {
        plate_count: config.plate_count,
        samples_per_tick,
        cadence_hz: cadence,
        ..GaitProfile::default()
    };
    let server = SimServer::bind((host, port), profile)
        .with_context(|| format!("could not bind {host}:{port}"))?;

    println!("Gait Stim Agent v{VERSION} - simulated force-plate server");
    println!("  Listening on {}", server.local_addr()?);
    println!("  Plates: {}", config.plate_count);
    println!("  Samples per request: {samples_per_tick}");
    println!("  Cadence: {cadence} strides/s");
    println!();
    println!("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(Arc::clone(&running))?;
    server.serve(running)?;

    Ok(())
}

fn cmd_status(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("Gait Stim Agent Status");
    println!("======================");
    println!();

    println!("Configuration:");
    println!("  Server: {}", config.transport.address());
    println!("  Frequency: {} Hz", config.read_frequency_hz);
    println!("  Plates: {}", config.plate_count);
    println!("  Stimulator armed at start: {}", config.stimulator_armed);
    match config.validate() {
        Ok(()) => println!("  Valid: yes"),
        Err(e) => println!("  Valid: no ({e})"),
    }
    println!();

    let stats_path = config.data_path.join(STATS_FILE);
    if stats_path.exists() {
        let content = std::fs::read_to_string(&stats_path)
            .with_context(|| format!("reading {}", stats_path.display()))?;
        let stats: PersistedStats = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", stats_path.display()))?;

        println!("Cumulative Statistics:");
        println!("  Ticks: {} ({} processed, {} skipped)", stats.ticks, stats.processed_ticks, stats.skipped_ticks);
        println!("  Fetch failures: {}", stats.fetch_failures);
        println!("  Malformed frames: {}", stats.malformed_frames);
        println!("  Shape errors: {}", stats.shape_errors);
        println!("  Capability failures: {}", stats.capability_failures);
        println!("  Panics: {}", stats.panics);
        println!("  Gait cycles: {}", stats.cycles_completed);
        println!(
            "  Stimulations: {} started, {} stopped",
            stats.stimulations_started, stats.stimulations_stopped
        );
        println!("  Last run: {} ({})", stats.last_run_id, stats.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
    } else {
        println!("No previous run data found.");
    }

    Ok(())
}

fn cmd_config(config_path: Option<&Path>, save: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_path);

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {path:?}");
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);

    if save {
        match config_path {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
        println!();
        println!("Saved to {path:?}");
    }

    Ok(())
}

fn cmd_safety() {
    println!("{SAFETY_NOTICE}");
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("could not set Ctrl+C handler")
}

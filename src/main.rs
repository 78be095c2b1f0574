//! CLI entry point for mapping-daq.
//!
//! Runs mapping scans against mock hardware, reorders coordinate files and
//! resumes aborted runs from their remainder files.
//!
//! # Usage
//!
//! ```bash
//! mapping-daq run --mode discrete --nx 20 --ny 10 --step 0.5
//! mapping-daq order --input raw.csv --output ordered.csv --method snake
//! mapping-daq config
//! mapping-daq resume --checkpoint data/checkpoints/map_remaining_20250101_120000.csv
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mapping_daq::acquisition::{ContinuousScanDriver, DiscreteScanDriver, ScanControl, ScanReport};
use mapping_daq::config::MappingConfig;
use mapping_daq::coordinates::io::{load_csv, save_csv};
use mapping_daq::coordinates::sequencer::{ScanOrderPolicy, Scramble, Sequencer};
use mapping_daq::coordinates::{Coordinate, CoordinateHub, CoordinateSet};
use mapping_daq::hardware::mock::{MockMode, MockSpectrometer, MockStage};
use mapping_daq::logging;
use mapping_daq::mapping::export::{export_csv, write_summary_json};
use mapping_daq::mapping::MappingHub;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mapping-daq")]
#[command(about = "Spectral mapping acquisition against mock hardware", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/mapping.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Discrete,
    Continuous,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a rectangular grid
    Run {
        /// Acquisition mode
        #[arg(long, value_enum, default_value = "discrete")]
        mode: Mode,
        /// Points along x
        #[arg(long, default_value_t = 10)]
        nx: usize,
        /// Points along y
        #[arg(long, default_value_t = 10)]
        ny: usize,
        /// Grid pitch
        #[arg(long, default_value_t = 1.0)]
        step: f64,
        /// Unit name (default: "map")
        #[arg(long)]
        name: Option<String>,
    },

    /// Apply the sequencer to a coordinate file
    Order {
        /// Input coordinates (x,y,z)
        #[arg(long)]
        input: PathBuf,
        /// Output file
        #[arg(long)]
        output: PathBuf,
        /// raster or snake (default: from config)
        #[arg(long)]
        method: Option<String>,
        /// x_major or y_major (default: from config)
        #[arg(long)]
        axis: Option<String>,
        /// Shuffle the visit order
        #[arg(long)]
        shuffle: bool,
        /// Stride interleave (stride = jump + 1)
        #[arg(long, default_value_t = 0)]
        jump: usize,
        /// Seed for reproducible shuffles
        #[arg(long)]
        seed: Option<u64>,
        /// Reduce to line endpoints for continuous mode
        #[arg(long)]
        continuous: bool,
    },

    /// Print the effective configuration (file + environment) as TOML
    Config,

    /// Resume from a checkpoint or remainder file
    Resume {
        /// Ordered coordinates left to visit
        #[arg(long)]
        checkpoint: PathBuf,
        /// Acquisition mode of the original run
        #[arg(long, value_enum, default_value = "discrete")]
        mode: Mode,
        /// Unit name (default: "<file stem>_resumed")
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MappingConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run {
            mode,
            nx,
            ny,
            step,
            name,
        } => {
            let grid = CoordinateSet::grid("grid", nx, ny, step, Coordinate::default());
            let ordered = match mode {
                Mode::Discrete => Sequencer::discrete(&grid, &config.scan_order),
                Mode::Continuous => Sequencer::continuous(&grid, &config.scan_order),
            };
            let mut params = BTreeMap::new();
            params.insert("step".to_string(), step.to_string());
            params.insert("nx".to_string(), nx.to_string());
            params.insert("ny".to_string(), ny.to_string());
            params.insert("method".to_string(), config.scan_order.method.to_string());
            params.insert("axis".to_string(), config.scan_order.axis.to_string());
            let name = name.unwrap_or_else(|| "map".to_string());
            run_scan(&config, mode, ordered, &name, params).await
        }
        Commands::Order {
            input,
            output,
            method,
            axis,
            shuffle,
            jump,
            seed,
            continuous,
        } => {
            let method = match method {
                Some(m) => m.parse()?,
                None => config.scan_order.method,
            };
            let axis = match axis {
                Some(a) => a.parse()?,
                None => config.scan_order.axis,
            };
            let policy =
                ScanOrderPolicy::new(method, axis).with_scramble(Scramble { shuffle, jump, seed });
            let set = load_csv(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let ordered = if continuous {
                Sequencer::continuous(&set, &policy)
            } else {
                Sequencer::discrete(&set, &policy)
            };
            save_csv(&ordered, &output)?;
            info!(input = set.len(), output = ordered.len(), path = %output.display(), "Coordinates ordered");
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Resume {
            checkpoint,
            mode,
            name,
        } => {
            let remaining = load_csv(&checkpoint)
                .with_context(|| format!("Failed to read {}", checkpoint.display()))?;
            let name = name.unwrap_or_else(|| format!("{}_resumed", remaining.name()));
            let mut params = BTreeMap::new();
            params.insert("resumed_from".to_string(), checkpoint.display().to_string());
            run_scan(&config, mode, remaining, &name, params).await
        }
    }
}

async fn run_scan(
    config: &MappingConfig,
    mode: Mode,
    coordinates: CoordinateSet,
    name: &str,
    params: BTreeMap<String, String>,
) -> Result<()> {
    let units = MappingHub::new();
    let sets = Arc::new(CoordinateHub::new());
    let unit = units.create_unit(units.unique_name(name), params)?;

    let stage = Arc::new(
        MockStage::builder()
            .mode(MockMode::Timed)
            .velocity(config.acquisition.line_velocity)
            .build(),
    );
    let spectrometer = Arc::new(
        MockSpectrometer::builder()
            .mode(MockMode::Timed)
            .pixels(512)
            .integration_time_ms(config.acquisition.integration_time_ms)
            .frame_interval(Duration::from_secs_f64(
                config.acquisition.integration_time_ms / 1000.0,
            ))
            .metadata("laser", "mock 532 nm")
            .build(),
    );

    info!(unit = %unit.unit_name(), points = coordinates.len(), "Starting mapping run (Ctrl-C aborts)");

    let report = match mode {
        Mode::Discrete => {
            let driver = DiscreteScanDriver::new(stage, spectrometer, config)?;
            abort_on_ctrl_c(driver.control());
            driver.run(unit.clone(), &coordinates, sets.clone()).await?
        }
        Mode::Continuous => {
            let driver = ContinuousScanDriver::new(stage, spectrometer, config)?;
            abort_on_ctrl_c(driver.control());
            driver.run(unit.clone(), &coordinates, sets.clone()).await?
        }
    };

    let export_dir = &config.storage.export_dir;
    let rows = export_csv(&unit, export_dir.join(format!("{}.csv", unit.unit_name())))?;
    write_summary_json(&unit, export_dir.join(format!("{}.json", unit.unit_name())))?;
    info!(rows, dir = %export_dir.display(), "Unit exported");

    print_report(&report, config)?;
    match &report.error {
        Some(error) => anyhow::bail!("Scan failed: {error}"),
        None => Ok(()),
    }
}

fn abort_on_ctrl_c(control: ScanControl) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl-C received; finishing current point and stopping");
                control.abort();
            }
            Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
        }
    });
}

fn print_report(report: &ScanReport, config: &MappingConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    if let Some(remainder) = &report.remainder {
        match &config.storage.checkpoint_dir {
            Some(dir) => println!(
                "Resume with: mapping-daq resume --checkpoint {}",
                dir.join(format!("{remainder}.csv")).display()
            ),
            None => println!(
                "Unvisited coordinates kept as '{remainder}'; set storage.checkpoint_dir to keep them on disk"
            ),
        }
    }
    Ok(())
}

//! cupwear: command-line interface for cup wear analysis.
//!
//! Loads a scanned cup mesh, runs the full analysis pipeline and prints a
//! report, either human-readable or as JSON for scripting.
//!
//! # Logging
//!
//! Set the `RUST_LOG` environment variable to control log output:
//! - `RUST_LOG=cup_wear=info` - Stage transitions and fit summaries
//! - `RUST_LOG=cup_wear=debug` - Per-stage detail
//! - `RUST_LOG=cup_wear::timing=info` - Stage durations only
//! - `RUST_LOG=cup_wear::progress=trace` - Per-meridian progress
//!
//! # Example
//!
//! ```bash
//! # Analyze a scan with a 10% rim trim
//! cupwear analyze liner.ply --trim 10
//!
//! # JSON report with stage timings logged
//! RUST_LOG=cup_wear::timing=info cupwear analyze liner.ply --format json
//!
//! # Try the pipeline on a synthetic cup with a 6 µm dent
//! cupwear demo --dent-depth 6
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod load;
mod output;

use commands::{analyze, demo, params};

/// cupwear - Wear analysis for scanned hemispherical bearing cups.
///
/// Fits a reference sphere to the bearing surface, measures deviations
/// along meridians and reports worn and raised regions with their volumes.
#[derive(Parser)]
#[command(name = "cupwear")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format for results
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Suppress all non-error output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

/// Overrides shared by the commands that run an analysis.
#[derive(clap::Args, Clone, Default)]
pub struct ParamOverrides {
    /// TOML file with analysis parameters
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of meridians (36-720)
    #[arg(long)]
    geodesics: Option<usize>,

    /// Percentage of the surface trimmed at the rim (0-20)
    #[arg(long)]
    trim: Option<f64>,

    /// Anomaly threshold in µm (0.1-10)
    #[arg(long)]
    threshold: Option<f64>,

    /// Material density in g/cm³ (0.8-1.1)
    #[arg(long)]
    density: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a scanned cup mesh (PLY)
    Analyze {
        /// Input mesh file
        input: PathBuf,

        #[command(flatten)]
        overrides: ParamOverrides,

        /// Include every meridian and cluster member in JSON output
        #[arg(long)]
        full: bool,
    },

    /// Run the analysis on a synthetic cup with one dent
    Demo {
        /// Dent depth in µm
        #[arg(long, default_value = "5.0")]
        dent_depth: f64,

        /// Polar angle of the dent center, measured from the pole (degrees)
        #[arg(long, default_value = "30.0")]
        dent_polar_deg: f64,

        /// Dent width in mm
        #[arg(long, default_value = "2.0")]
        dent_width: f64,

        /// Cup radius in mm
        #[arg(long, default_value = "14.0")]
        radius: f64,

        /// Mesh spacing in mm
        #[arg(long, default_value = "0.4")]
        spacing: f64,

        #[command(flatten)]
        overrides: ParamOverrides,
    },

    /// Print the default analysis parameters
    Params,
}

/// Initialize the tracing subscriber based on verbosity level.
fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    // RUST_LOG wins over -v flags
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "cup_wear=info",
            2 => "cup_wear=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    #[cfg(debug_assertions)]
    miette::set_panic_hook();

    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Commands::Analyze {
            input,
            overrides,
            full,
        } => analyze::run(input, overrides, *full, &cli),
        Commands::Demo {
            dent_depth,
            dent_polar_deg,
            dent_width,
            radius,
            spacing,
            overrides,
        } => demo::run(
            &demo::DemoCup {
                dent_depth_um: *dent_depth,
                dent_polar_deg: *dent_polar_deg,
                dent_width_mm: *dent_width,
                radius_mm: *radius,
                spacing_mm: *spacing,
            },
            overrides,
            &cli,
        ),
        Commands::Params => params::run(&cli),
    };

    if let Err(e) = &result {
        if !cli.quiet {
            if let Some(wear_err) = e.downcast_ref::<cup_wear::WearError>() {
                eprintln!("{}: {}", "Error".red().bold(), wear_err);
                eprintln!("  {}: {}", "Code".cyan(), wear_err.code());
                if let Some(stage) = wear_err.stage() {
                    eprintln!("  {}: {}", "Stage".yellow(), stage);
                }
            } else {
                eprintln!("{}: {}", "Error".red().bold(), e);
                for cause in e.chain().skip(1) {
                    eprintln!("  {}: {}", "Caused by".yellow(), cause);
                }
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

//! `scanctl`: drive the scan engine from the command line.
//!
//! The tool runs against the simulated scanner, so every subcommand works
//! without hardware:
//!
//! ```bash
//! scanctl --model bh1200 calibrate
//! scanctl --model cp1200 scan --dpi 300 --width 850 --height 1100 --color -o page.ppm
//! scanctl feed 2400
//! scanctl home
//! ```

mod logging;
mod pnm;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scan_core::{load_profiles, ColorFilter, ModelProfile, ProfileRegistry, ScanFlags, ScanRequest};
use scan_driver::DeviceSession;
use scan_driver_mock::{SimulatedScanner, SimulatorConfig};
use tracing::info;

use crate::logging::{LogConfig, OutputFormat};

#[derive(Parser)]
#[command(name = "scanctl")]
#[command(about = "Scanner acquisition engine against a simulated device", long_about = None)]
struct Cli {
    /// Scanner model
    #[arg(long, global = true, default_value = "bh1200")]
    model: String,

    /// Extra profile file merged over the built-in models
    #[arg(long, global = true)]
    profile_file: Option<PathBuf>,

    /// Seed for the simulated sensor noise
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known models
    Models,

    /// Run the calibration procedures and print the result
    Calibrate,

    /// Scan an area and write it as a netpbm file
    Scan(ScanArgs),

    /// Move the carriage forward by micro-steps
    Feed {
        steps: u32,
    },

    /// Return the carriage to the home sensor
    Home,

    /// Look for a black (or white) reference strip
    Strip {
        /// Search backwards
        #[arg(long)]
        reverse: bool,

        /// Look for white instead of black
        #[arg(long)]
        white: bool,
    },
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long, default_value_t = 150)]
    dpi: u16,

    /// Left edge in pixels at the scan resolution
    #[arg(long, default_value_t = 0)]
    x: u32,

    /// Top edge in lines at the scan resolution
    #[arg(long, default_value_t = 0)]
    y: u32,

    #[arg(long)]
    width: u32,

    #[arg(long)]
    height: u32,

    /// Three-channel color instead of gray
    #[arg(long)]
    color: bool,

    /// Output depth: 1, 8 or 16
    #[arg(long, default_value_t = 8)]
    depth: u8,

    /// Gamma exponent applied to every channel
    #[arg(long)]
    gamma: Option<f64>,

    /// Skip shading correction
    #[arg(long)]
    no_shading: bool,

    /// Adaptive lineart threshold
    #[arg(long)]
    dynamic_lineart: bool,

    /// Output file; stdout when absent
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = logging::parse_level(&cli.log_level)?;
    logging::init(&LogConfig::new(level, cli.log_format))?;

    let registry = registry(cli.profile_file.as_ref())?;
    if let Commands::Models = cli.command {
        let mut models: Vec<&str> = registry.models().collect();
        models.sort_unstable();
        for model in models {
            println!("{model}");
        }
        return Ok(());
    }

    let profile = registry
        .get(&cli.model)
        .with_context(|| format!("unknown model {}", cli.model))?;
    let mut session = open_session(profile, cli.seed)?;

    match cli.command {
        Commands::Models => Ok(()),
        Commands::Calibrate => calibrate(&mut session),
        Commands::Scan(args) => scan(&mut session, &args),
        Commands::Feed { steps } => {
            session.feed(steps)?;
            info!(steps, "Feed complete");
            Ok(())
        }
        Commands::Home => {
            session.slow_back_home(true)?;
            info!("Home");
            Ok(())
        }
        Commands::Strip { reverse, white } => {
            let found = session.search_strip(!reverse, !white)?;
            println!("{}", if found { "found" } else { "not found" });
            Ok(())
        }
    }
}

fn registry(profile_file: Option<&PathBuf>) -> Result<ProfileRegistry> {
    let mut registry = ProfileRegistry::builtin()?;
    if let Some(path) = profile_file {
        let extra = load_profiles(path)
            .with_context(|| format!("loading profiles from {}", path.display()))?;
        registry.extend(extra);
    }
    Ok(registry)
}

fn open_session(profile: Arc<ModelProfile>, seed: Option<u64>) -> Result<DeviceSession> {
    let config = SimulatorConfig {
        seed: seed.or(SimulatorConfig::default().seed),
        ..SimulatorConfig::default()
    };
    let device = SimulatedScanner::with_config(Arc::clone(&profile), config);
    let mut session = DeviceSession::open(profile, device.boxed());
    session.init().context("device init")?;
    Ok(session)
}

fn calibrate(session: &mut DeviceSession) -> Result<()> {
    let report = session.run_calibration()?;
    println!("warmup:   {:?}", report.warmup);
    println!("exposure: {:?}", report.exposure);
    println!("offset:   {:?}", report.offset);
    println!("gain:     {:?}", report.gain);
    if let Some(state) = session.calibration() {
        println!("analog:   {:?}", state.analog);
        println!("shading:  {} pixels", state.shading.pixels());
    }
    Ok(())
}

fn scan(session: &mut DeviceSession, args: &ScanArgs) -> Result<()> {
    let mut flags = ScanFlags::empty();
    if args.no_shading {
        flags |= ScanFlags::DISABLE_SHADING;
    }
    if args.dynamic_lineart {
        flags |= ScanFlags::DYNAMIC_LINEART;
    }
    match args.gamma {
        Some(exponent) => session.set_gamma([exponent; 3])?,
        None => flags |= ScanFlags::DISABLE_GAMMA,
    }

    let mut builder = ScanRequest::builder()
        .resolution(args.dpi)
        .origin(args.x, args.y)
        .area(args.width, args.height)
        .depth(args.depth)
        .flags(flags);
    builder = if args.color {
        builder.color()
    } else {
        builder.gray(ColorFilter::Green)
    };
    let request = builder.build();

    let lines = session.scan(&request)?;
    let channels = if args.color { 3 } else { 1 };
    info!(lines = lines.len(), "Scan complete");

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            pnm::write_pnm(&mut BufWriter::new(file), &lines, args.width, channels, args.depth)
        }
        None => pnm::write_pnm(&mut std::io::stdout().lock(), &lines, args.width, channels, args.depth),
    }
}

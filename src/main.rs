//! CLI Entry Point for fdmeter
//!
//! Provides command-line interface for:
//! - Listing serial ports and reading the force gauge
//! - Jogging the Z axis and checking its endstop
//! - Zeroing against a specimen
//! - Careful, smooth and looped force-displacement tests, saved as JSON or CSV
//!
//! # Usage
//!
//! Zero moving down, then run one careful test and save it:
//! ```bash
//! fdmeter test --type careful --direction down --outfile dome.json
//! ```
//!
//! Five smooth up/down cycles against the simulator:
//! ```bash
//! fdmeter --simulate test --type smooth --direction down --loops 5
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fdmeter::config::{Settings, StorageFormat, DEFAULT_CONFIG_PATH};
use fdmeter::data::storage;
use fdmeter::direction::{Direction, Still};
use fdmeter::error::AppResult;
use fdmeter::experiment::{
    CarefulParams, LoopMode, LoopParams, SmoothParams, TestEngine, TestParams, TestRun, TestType,
};
use fdmeter::logging;
use fdmeter::rig::Rig;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fdmeter")]
#[command(about = "Force-displacement tester for snap-through specimens", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated hardware instead of the serial devices
    #[arg(long, global = true)]
    simulate: bool,

    /// Force gauge serial port (overrides gauge.port)
    #[arg(long, global = true)]
    gauge_port: Option<String>,

    /// Printer serial port (overrides actuator.port)
    #[arg(long, global = true)]
    printer_port: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Print force readings
    Force {
        /// Number of readings; 0 prints until Ctrl-C
        #[arg(short = 'n', long, default_value = "10")]
        count: u64,
    },

    /// Move the Z axis
    Jog {
        /// UP or DOWN
        direction: Direction,
        /// Distance (mm)
        distance: f64,
        /// Feedrate (mm/min)
        #[arg(long, value_parser = positive_feedrate)]
        feedrate: Option<f64>,
        /// Print timestamped force while moving until Ctrl-C
        #[arg(long)]
        stream: bool,
    },

    /// Report the Z endstop
    Endstop,

    /// Zero the Z axis against the specimen
    Zero {
        /// Direction to approach in
        direction: Direction,
        /// Stay in contact instead of backing off to zero force
        #[arg(long)]
        no_backoff: bool,
    },

    /// Run a force-displacement test
    Test(TestArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct TestArgs {
    /// careful or smooth
    #[arg(long = "type")]
    test_type: TestType,

    /// Test direction (UP or DOWN)
    #[arg(long)]
    direction: Direction,

    /// Repeated up/down loops; 0 runs a single test
    #[arg(long, default_value = "0")]
    loops: u32,

    /// Number of the first test
    #[arg(long, default_value = "1")]
    test_num: u32,

    /// Readings averaged per careful step
    #[arg(long, default_value = "1")]
    n_samples: usize,

    /// Careful step (mm)
    #[arg(long, default_value = "0.25")]
    careful_inc: f64,

    /// Give up after this much travel without snap-through (mm)
    #[arg(long, default_value = "15")]
    stop_after: f64,

    /// Travel before snap-through detection starts (mm)
    #[arg(long, default_value = "0")]
    min_down: f64,

    /// Fixed travel per down half of a loop (mm); requires --max-up
    #[arg(long, requires = "max_up")]
    max_down: Option<f64>,

    /// Fixed travel per up half of a loop (mm); requires --max-down
    #[arg(long, requires = "max_down")]
    max_up: Option<f64>,

    /// Smooth displacement (mm); found by a careful test when omitted
    #[arg(long)]
    smooth_displacement: Option<f64>,

    /// Smooth test feedrate (mm/min)
    #[arg(long, value_parser = positive_feedrate)]
    feedrate: Option<f64>,

    /// Skip zeroing before a careful test
    #[arg(long)]
    no_zero: bool,

    /// Stay at the end position after a single test
    #[arg(long)]
    no_return: bool,

    /// Save results here (.csv or .json; other extensions use storage.format)
    #[arg(long)]
    outfile: Option<PathBuf>,
}

fn positive_feedrate(s: &str) -> Result<f64, String> {
    let feedrate: f64 = s
        .parse()
        .map_err(|e| format!("invalid feedrate '{}': {}", s, e))?;
    if feedrate.is_finite() && feedrate > 0.0 {
        Ok(feedrate)
    } else {
        Err(format!("feedrate must be positive, got {}", feedrate))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(port) = cli.gauge_port {
        settings.gauge.port = Some(port);
    }
    if let Some(port) = cli.printer_port {
        settings.actuator.port = Some(port);
    }
    logging::init_from_config(&settings).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        command => {
            let mut rig = open_rig(&settings, cli.simulate).await?;
            let result = run_with_rig(&mut rig, command, &settings).await;
            keep_run_result(result, rig.shutdown().await)
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn list_ports() -> Result<()> {
    let ports = fdmeter::hardware::serial::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}\t{}", port.name, port.description);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports() -> Result<()> {
    bail!("Listing ports requires the instrument_serial feature")
}

/// A failed shutdown is logged; the command's own outcome is what gets reported.
fn keep_run_result(result: Result<()>, shutdown: AppResult<()>) -> Result<()> {
    if let Err(e) = shutdown {
        error!("Shutdown failed: {}", e);
    }
    result
}

async fn open_rig(settings: &Settings, simulate: bool) -> Result<Rig> {
    if simulate {
        return Ok(Rig::simulated(settings).await);
    }
    #[cfg(feature = "instrument_serial")]
    {
        Rig::connect(settings).await
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        bail!("Built without instrument_serial; use --simulate")
    }
}

async fn run_with_rig(rig: &mut Rig, command: Commands, settings: &Settings) -> Result<()> {
    let engine = &mut rig.engine;
    match command {
        Commands::Force { count } => print_force(engine, count).await,
        Commands::Jog {
            direction,
            distance,
            feedrate,
            stream,
        } => jog(engine, direction, distance, feedrate, stream).await,
        Commands::Endstop => {
            let triggered = engine.motion().endstop_status().await?;
            println!("endstop {}", if triggered { "TRIGGERED" } else { "open" });
            Ok(())
        }
        Commands::Zero {
            direction,
            no_backoff,
        } => {
            engine.zero_axis(direction, !no_backoff).await?;
            println!(
                "Zeroed; position {:.3}, force {}",
                engine.motion().position()?,
                engine.motion().read_force().await?
            );
            Ok(())
        }
        Commands::Test(args) => test(engine, &args, settings).await,
        Commands::Ports | Commands::Config => Ok(()),
    }
}

async fn print_force(engine: &TestEngine, count: u64) -> Result<()> {
    let mut printed = 0;
    while count == 0 || printed < count {
        tokio::select! {
            force = engine.motion().read_force() => {
                let force = force?;
                println!("Force: {}, direction: {}", force, Direction::from_force(force));
            }
            _ = signal::ctrl_c() => break,
        }
        printed += 1;
    }
    Ok(())
}

async fn jog(
    engine: &mut TestEngine,
    direction: Direction,
    distance: f64,
    feedrate: Option<f64>,
    stream: bool,
) -> Result<()> {
    if direction == Still {
        bail!("Jog direction must be UP or DOWN");
    }
    let moved = engine
        .motion_mut()
        .move_by(distance, direction, feedrate, !stream)
        .await?;
    if !stream {
        println!("Moved z by {}", moved);
        return Ok(());
    }

    loop {
        tokio::select! {
            sample = engine.motion().read_sample() => {
                match sample {
                    Ok(sample) => println!("{}\t{}", sample.timestamp.to_rfc3339(), sample.value),
                    Err(e) => {
                        engine.motion_mut().abandon_pending();
                        return Err(e.into());
                    }
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }
    engine.motion_mut().wait_settled().await?;
    Ok(())
}

async fn test(engine: &mut TestEngine, args: &TestArgs, settings: &Settings) -> Result<()> {
    if args.direction == Still {
        bail!("Specify --direction as UP or DOWN, not STILL");
    }

    let mut params = TestParams {
        test_type: args.test_type,
        test_direction: args.direction,
        feedrate: args
            .feedrate
            .unwrap_or(settings.actuator.default_feedrate)
            .min(settings.actuator.max_feedrate),
        test_loops: args.loops,
        test_num: args.test_num,
        return_to_zero_after_test: !args.no_return,
        smooth_displacement: None,
        n_samples: None,
        careful_inc: None,
        stop_after: None,
        max_down: args.max_down,
        max_up: args.max_up,
    };

    let outcome = run_test(engine, args, &mut params).await;
    if let Err(e) = &outcome {
        error!("Test aborted: {}", e);
        if e.requires_stop() {
            if let Err(stop_err) = engine.emergency_stop().await {
                error!("Emergency stop failed: {}", stop_err);
            }
        }
    }

    let rows = engine.take_journal();
    if let Some(outfile) = &args.outfile {
        if rows.is_empty() {
            info!("No rows recorded, nothing saved");
        } else {
            let path = output_path(outfile, &settings.storage.output_dir);
            let format = format_for(&path, settings.storage.format);
            let written = storage::write_run(&TestRun::new(params, rows), &path, format)?;
            println!("Saved data to {}", written.display());
        }
    }

    outcome.map_err(anyhow::Error::from)
}

async fn run_test(
    engine: &mut TestEngine,
    args: &TestArgs,
    params: &mut TestParams,
) -> AppResult<()> {
    let direction = args.direction;
    let triggered = engine.motion().endstop_status().await?;
    println!("endstop {}", if triggered { "TRIGGERED" } else { "open" });

    // Smooth tests zero themselves
    if !args.no_zero && args.test_type == TestType::Careful {
        println!("Zeroing z axis {}", direction);
        engine.zero_axis(direction, true).await?;
    }

    match args.test_type {
        TestType::Careful => {
            params.n_samples = Some(args.n_samples);
            params.careful_inc = Some(args.careful_inc);
            params.stop_after = Some(args.stop_after);
        }
        TestType::Smooth => params.smooth_displacement = args.smooth_displacement,
    }

    println!("Going to do test {}", direction);
    let mut smooth_displacement = args.smooth_displacement.unwrap_or(0.0).abs();

    let needs_careful = match args.test_type {
        TestType::Careful => args.loops == 0,
        TestType::Smooth => smooth_displacement == 0.0,
    };
    if needs_careful {
        let rows = engine
            .careful_test(&CarefulParams {
                step: args.careful_inc,
                direction,
                n_samples: args.n_samples,
                min_displacement: args.min_down,
                stop_after: args.stop_after,
                test_no: args.test_num,
                return_to_zero: !args.no_return,
            })
            .await?;
        smooth_displacement = rows
            .iter()
            .rev()
            .find_map(|r| r.displacement)
            .unwrap_or(0.0)
            .abs();
        println!("Careful test found displacement {}", smooth_displacement);
        if args.test_type == TestType::Smooth {
            params.smooth_displacement = Some(smooth_displacement);
        }
    }

    if args.loops > 0 {
        let mode = match args.test_type {
            TestType::Careful => LoopMode::Careful {
                step: args.careful_inc,
                n_samples: args.n_samples,
            },
            TestType::Smooth => LoopMode::Smooth {
                target: smooth_displacement,
                feedrate: params.feedrate,
                zero_first: true,
            },
        };
        engine
            .test_loop(&LoopParams {
                mode,
                repetitions: args.loops,
                start_direction: direction,
                test_no: args.test_num,
                max_down: args.max_down,
                max_up: args.max_up,
                min_displacement: args.min_down,
                stop_after: args.stop_after,
            })
            .await?;
    } else if args.test_type == TestType::Smooth {
        engine
            .smooth_test(&SmoothParams {
                target: smooth_displacement,
                direction,
                feedrate: params.feedrate,
                zero_first: true,
                test_no: args.test_num,
                return_to_zero: !args.no_return,
            })
            .await?;
    }
    Ok(())
}

/// Bare file names land in the configured output directory.
fn output_path(outfile: &Path, output_dir: &Path) -> PathBuf {
    let bare = outfile
        .parent()
        .map_or(true, |parent| parent.as_os_str().is_empty());
    if outfile.is_relative() && bare {
        output_dir.join(outfile)
    } else {
        outfile.to_path_buf()
    }
}

fn format_for(path: &Path, fallback: StorageFormat) -> StorageFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => StorageFormat::Csv,
        Some(ext) if ext.eq_ignore_ascii_case("json") => StorageFormat::Json,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedrate_must_be_positive() {
        assert_eq!(positive_feedrate("180"), Ok(180.0));
        assert!(positive_feedrate("0").is_err());
        assert!(positive_feedrate("-60").is_err());
        assert!(positive_feedrate("NaN").is_err());
        assert!(positive_feedrate("fast").is_err());
    }

    #[test]
    fn shutdown_failure_does_not_mask_run_error() {
        let run = keep_run_result(
            Err(anyhow!("overload")),
            Err(fdmeter::FdmError::LinkLost("closed".to_string())),
        );
        assert_eq!(run.unwrap_err().to_string(), "overload");

        let run = keep_run_result(Ok(()), Err(fdmeter::FdmError::LinkLost("closed".to_string())));
        assert!(run.is_ok());
    }

    #[test]
    fn cli_rejects_zero_feedrate() {
        let parsed = Cli::try_parse_from([
            "fdmeter", "test", "--type", "smooth", "--direction", "down", "--feedrate", "0",
        ]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "fdmeter", "test", "--type", "smooth", "--direction", "down", "--feedrate", "120",
        ]);
        assert!(parsed.is_ok());
    }
}

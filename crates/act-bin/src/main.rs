//! `actctl`: command-line control of the Modbus-RTU linear actuator.
//!
//! # Usage
//!
//! Read the position (discovers the actuator first):
//! ```bash
//! actctl --port /dev/ttyUSB0 position
//! ```
//!
//! Move by -5 units and wait for the axis to settle:
//! ```bash
//! actctl move-rel -5 --speed 20 --wait --timeout 30 --tolerance 1
//! ```
//!
//! Exercise the controller without hardware:
//! ```bash
//! actctl --simulate stress absolute --iterations 20 --seed 1
//! ```
//!
//! Exit codes: 0 on success, 2 when no responsive actuator was found, 3 when a
//! blocking move did not settle in time, 1 for anything else.

mod logging;
mod stress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use act_core::ActError;
use act_hardware::config::DEFAULT_CONFIG_PATH;
use act_hardware::port_resolver::{self, available_ports};
use act_hardware::{ActuatorConfig, ActuatorController, MockPortOpener, SimulatedActuator};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use logging::{OutputFormat, TracingConfig};
use stress::{StressArgs, StressRunner};

#[derive(Parser)]
#[command(name = "actctl", version)]
#[command(about = "Control a Modbus-RTU linear actuator over a serial line", long_about = None)]
struct Cli {
    /// Configuration file (TOML). A missing file means built-in defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Preferred serial endpoint; overrides `[connection] port`
    #[arg(long, global = true)]
    port: Option<String>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    /// Drive an in-memory simulated actuator instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current position
    Position,

    /// Move by a signed displacement
    MoveRel {
        /// Displacement in position units
        #[arg(allow_negative_numbers = true)]
        delta: i32,

        #[command(flatten)]
        motion: MotionArgs,
    },

    /// Move to an absolute position
    MoveAbs {
        /// Target position
        #[arg(allow_negative_numbers = true)]
        target: i32,

        #[command(flatten)]
        motion: MotionArgs,
    },

    /// Move to position 0
    Origin {
        #[command(flatten)]
        motion: MotionArgs,
    },

    /// Send the controller reset sequence
    Reset,

    /// List the serial ports the OS reports, then the discovery scan list
    Ports,

    /// Print the effective configuration (file plus environment) as TOML
    Config,

    /// Run a randomized stress loop
    Stress(StressArgs),
}

#[derive(Args)]
struct MotionArgs {
    /// Speed (defaults to `[motion] default_speed`)
    #[arg(long)]
    speed: Option<i32>,

    /// Wait until the position settles
    #[arg(long)]
    wait: bool,

    /// Settle deadline in seconds, with --wait
    #[arg(long, value_name = "SECS", requires = "wait")]
    timeout: Option<u64>,

    /// Allowed |actual - expected|, with --wait
    #[arg(long, requires = "wait")]
    tolerance: Option<u32>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match logging::parse_log_level(&cli.log_level) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(TracingConfig::new(level).with_format(cli.log_format)) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            let code = e.downcast_ref::<ActError>().map_or(1, ActError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ActuatorConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Ports => return list_ports(&config),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            return Ok(());
        }
        _ => {}
    }

    let preferred = cli.port.clone().or_else(|| config.connection.port.clone());
    let mut actuator = if cli.simulate {
        simulated_controller(&config, preferred.as_deref())?
    } else {
        ActuatorController::with_native_serial(&config)?
    };

    if let Commands::Stress(args) = &cli.command {
        let poll_interval = Duration::from_millis(config.timing.poll_interval_ms);
        if args.mode != stress::StressMode::Connect {
            actuator.connect(preferred.as_deref()).await?;
        }
        let summary = StressRunner::new(&mut actuator, args.clone(), poll_interval)
            .run(preferred.as_deref())
            .await;
        actuator.disconnect().await;
        if summary.fail > 0 {
            bail!("{} of {} iterations failed", summary.fail, summary.iterations);
        }
        return Ok(());
    }

    actuator.connect(preferred.as_deref()).await?;
    if let Some(notice) = actuator.fallback_notice() {
        println!("{notice}");
    }
    let result = execute(&mut actuator, &cli.command).await;
    actuator.disconnect().await;
    result
}

async fn execute(actuator: &mut ActuatorController, command: &Commands) -> Result<()> {
    match command {
        Commands::Position => {
            println!("{}", actuator.read_position().await?);
        }
        Commands::MoveRel { delta, motion } => {
            let (speed, timeout, tolerance) = motion_params(actuator, motion);
            if motion.wait {
                let settled = actuator
                    .move_relative_blocking(*delta, speed, timeout, tolerance)
                    .await?;
                println!("{settled}");
            } else {
                actuator.move_relative(*delta, speed).await?;
            }
        }
        Commands::MoveAbs { target, motion } => move_absolute(actuator, *target, motion).await?,
        Commands::Origin { motion } => move_absolute(actuator, 0, motion).await?,
        Commands::Reset => {
            actuator.reset().await?;
            info!("Reset sequence sent");
        }
        Commands::Ports | Commands::Config | Commands::Stress(_) => {}
    }
    Ok(())
}

async fn move_absolute(
    actuator: &mut ActuatorController,
    target: i32,
    motion: &MotionArgs,
) -> Result<()> {
    let (speed, timeout, tolerance) = motion_params(actuator, motion);
    if motion.wait {
        let settled = actuator
            .move_absolute_blocking(target, speed, timeout, tolerance)
            .await?;
        println!("{settled}");
    } else if target == 0 {
        actuator.move_to_origin(speed).await?;
    } else {
        actuator.move_absolute(target, speed).await?;
    }
    Ok(())
}

fn motion_params(actuator: &ActuatorController, motion: &MotionArgs) -> (i32, Duration, u32) {
    let defaults = actuator.motion_config();
    (
        motion.speed.unwrap_or(defaults.default_speed),
        Duration::from_secs(motion.timeout.unwrap_or(defaults.default_timeout_secs)),
        motion.tolerance.unwrap_or(defaults.default_tolerance),
    )
}

fn simulated_controller(
    config: &ActuatorConfig,
    preferred: Option<&str>,
) -> Result<ActuatorController> {
    let endpoint = preferred
        .filter(|p| !p.is_empty())
        .unwrap_or(port_resolver::default_port());
    info!(endpoint, "Using simulated actuator");
    let opener = MockPortOpener::new().with_device(endpoint, SimulatedActuator::new());
    Ok(ActuatorController::new(config, Box::new(opener))?)
}

fn list_ports(config: &ActuatorConfig) -> Result<()> {
    let ports = available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports reported by the OS");
    }
    for port in ports {
        let describe = [port.vendor, port.model, port.serial]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        println!("{:<24} {:<9} {}", port.device_path, port.kind, describe);
    }

    let candidates = config.candidates();
    println!(
        "Scan order ({} candidates): {}",
        candidates.len(),
        candidates.join(", ")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn negative_relative_move_parses() {
        let cli = Cli::try_parse_from(["actctl", "move-rel", "-5", "--speed", "20", "--wait"]).unwrap();
        match cli.command {
            Commands::MoveRel { delta, motion } => {
                assert_eq!(delta, -5);
                assert_eq!(motion.speed, Some(20));
                assert!(motion.wait);
            }
            _ => panic!("expected move-rel"),
        }
    }

    #[test]
    fn timeout_requires_wait() {
        assert!(Cli::try_parse_from(["actctl", "move-abs", "10", "--timeout", "5"]).is_err());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["actctl", "position", "--port", "/dev/ttyUSB2", "--simulate"]).unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB2"));
        assert!(cli.simulate);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_absolute_move_with_wait() {
        let config = ActuatorConfig::default();
        let mut actuator = simulated_controller(&config, Some("/dev/sim0")).unwrap();
        actuator.connect(Some("/dev/sim0")).await.unwrap();

        let motion = MotionArgs {
            speed: Some(15),
            wait: true,
            timeout: Some(10),
            tolerance: Some(0),
        };
        move_absolute(&mut actuator, 4, &motion).await.unwrap();
        assert_eq!(actuator.read_position().await.unwrap(), 4);
    }

    #[test]
    fn exit_code_survives_context() {
        let err = anyhow::Error::new(ActError::NoResponsiveDevice { tried: 4 }).context("connecting");
        let code = err.downcast_ref::<ActError>().map_or(1, ActError::exit_code);
        assert_eq!(code, 2);
    }
}

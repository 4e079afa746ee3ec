//! Commandline argument parser using clap for the mouse joystick rig.

use crate::assay::{AssayConfig, DEFAULT_POLL_PERIOD};
use crate::rig::{DeviceQuery, RigConfig};
use crate::serial_device::DEFAULT_BAUD;

use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, time::Duration};

/// Runs behavioral assays on the mouse joystick rig.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct RigArgs {
    #[command(subcommand)]
    /// What to do
    pub command: RigCommand,

    /// Only probe this serial port instead of every port on the host
    #[arg(short = 'p', long = "port", global = true)]
    pub port: Option<PathBuf>,

    /// Serial number of the joystick controller, when several are attached
    #[arg(short = 'n', long = "serial-number", global = true)]
    pub serial_number: Option<u32>,

    /// Baud rate of the serial ports
    #[arg(short = 'b', long = "baud", global = true, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Directory assay directories are created in, ~/mouse_joystick by default
    #[arg(short = 'd', long = "base-dir", global = true)]
    pub base_dir: Option<PathBuf>,

    /// Seconds between two polls of the controller
    #[arg(long = "poll-secs", global = true, default_value_t = DEFAULT_POLL_PERIOD.as_secs_f64())]
    pub poll_secs: f64,

    /// Also require the encoder interface
    #[arg(long = "with-encoder", global = true)]
    pub with_encoder: bool,

    /// Use a simulated controller instead of the serial ports
    #[arg(long = "simulate", global = true)]
    pub simulate: bool,
}

impl RigArgs {
    /// The devices to resolve.
    pub fn rig_config(&self) -> RigConfig {
        RigConfig {
            joystick_controller: DeviceQuery::joystick_controller()
                .serial_number(self.serial_number),
            encoder_interface: self.with_encoder.then(DeviceQuery::encoder_interface),
        }
    }

    /// Where and how often assays are recorded.
    pub fn assay_config(&self) -> AssayConfig {
        AssayConfig {
            base_dir: self
                .base_dir
                .clone()
                .unwrap_or_else(AssayConfig::default_base_dir),
            poll_period: Duration::try_from_secs_f64(self.poll_secs)
                .ok()
                .filter(|period| !period.is_zero())
                .unwrap_or(DEFAULT_POLL_PERIOD),
        }
    }
}

/// The tasks the binary can perform.
#[derive(Debug, Subcommand, Clone)]
pub enum RigCommand {
    /// List the devices that answer on the serial ports
    #[command(about)]
    Devices,

    /// Validate a schedule file and print its blocks, without touching devices
    #[command(about)]
    Check(ScheduleArgs),

    /// Run an assay and record its trials
    #[command(about)]
    Run(RunCommand),
}

/// A schedule to read.
#[derive(Debug, Args, Clone)]
pub struct ScheduleArgs {
    /// CSV schedule, one block per row
    pub schedule: PathBuf,
}

/// Options of the `run` command.
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// CSV schedule, one block per row
    pub schedule: PathBuf,

    /// Log progress instead of drawing the terminal monitor; stop with Ctrl-C
    #[arg(long)]
    pub headless: bool,
}

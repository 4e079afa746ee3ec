//! Finds the rig, runs an assay and records its trials.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use mouse_joystick::{
    args::{RigArgs, RigCommand, RunCommand},
    assay::{AssaySession, StartOutcome},
    device_client::DeviceClient,
    dummy_device::DummyDevice,
    gui::{monitor_assay, MonitorExit},
    ledger::{read_ledger, LEDGER_FILE_NAME},
    rig::{DeviceQuery, Rig},
    schedule::load_schedule,
    serial_device::{discover_serial_devices, SerialDevice},
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::Duration,
};

// Example:
// cargo run -- --simulate run schedule.csv
// cargo run -- --port /dev/ttyACM0 --base-dir ~/assays run schedule.csv --headless

/// How often the simulated controller finishes a trial.
const SIMULATED_TRIAL_PERIOD: Duration = Duration::from_secs(2);

const MONITOR_REFRESH: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    env_logger::init();
    let args = RigArgs::parse();

    match &args.command {
        RigCommand::Devices => list_devices(&args),
        RigCommand::Check(check) => check_schedule(&check.schedule),
        RigCommand::Run(run) => run_assay(&args, run),
    }
}

fn discover(args: &RigArgs) -> Result<Vec<Box<dyn DeviceClient>>> {
    if args.simulate {
        let controller = DeviceQuery::joystick_controller();
        let mut devices: Vec<Box<dyn DeviceClient>> = vec![Box::new(
            DummyDevice::builder()
                .id(
                    &controller.name,
                    &controller.form_factor,
                    args.serial_number.unwrap_or_default(),
                )
                .trial_period(SIMULATED_TRIAL_PERIOD)
                .build(),
        )];
        if args.with_encoder {
            let encoder = DeviceQuery::encoder_interface();
            devices.push(Box::new(
                DummyDevice::builder()
                    .id(&encoder.name, &encoder.form_factor, 0)
                    .build(),
            ));
        }
        info!("Using {} simulated devices", devices.len());
        return Ok(devices);
    }

    let devices = match &args.port {
        Some(port) => vec![SerialDevice::open(port, args.baud)
            .with_context(|| format!("No device answered on {}", port.display()))?],
        None => discover_serial_devices(args.baud).context("Failed to list serial ports")?,
    };
    Ok(devices
        .into_iter()
        .map(|dev| Box::new(dev) as Box<dyn DeviceClient>)
        .collect())
}

fn list_devices(args: &RigArgs) -> Result<()> {
    let devices = discover(args)?;
    if devices.is_empty() {
        println!("No devices found");
    }
    for dev in devices {
        println!("{}", dev.device_id());
    }
    Ok(())
}

fn check_schedule(path: &Path) -> Result<()> {
    let blocks = load_schedule(path)
        .with_context(|| format!("Schedule '{}' is invalid", path.display()))?;
    for (i, block) in blocks.iter().enumerate() {
        println!(
            "{:>3}: {} trials, torque {}, reward {}, reach {:?}",
            i,
            block.repeat_trial_count,
            block.pull_torque,
            block.lickport_reward_duration,
            block.reach_position
        );
    }
    let trials: u64 = blocks.iter().map(|b| b.repeat_trial_count as u64).sum();
    println!("{} blocks, {} trials", blocks.len(), trials);
    Ok(())
}

fn run_assay(args: &RigArgs, run: &RunCommand) -> Result<()> {
    let rig = Rig::resolve(discover(args)?, &args.rig_config())?;
    let (controller, encoder) = rig.into_parts();
    if let Some(encoder) = &encoder {
        info!("Encoder interface {} attached", encoder.device_id());
    }

    let mut session = AssaySession::new(controller, args.assay_config());
    let dir = match session
        .start(&run.schedule)
        .with_context(|| format!("Failed to start an assay with '{}'", run.schedule.display()))?
    {
        StartOutcome::Started(dir) => dir,
        StartOutcome::Refused(dir) => {
            bail!("The controller refused to start the assay in '{}'", dir.display())
        }
        StartOutcome::AlreadyRunning => bail!("An assay is already running"),
    };
    println!("Recording into {}", dir.display());

    if run.headless {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("Failed to install the Ctrl-C handler")?;

        while session.is_running() && !interrupted.load(Ordering::SeqCst) {
            if session.status().last_poll_error.is_some() {
                break;
            }
            sleep(MONITOR_REFRESH);
        }
        if interrupted.load(Ordering::SeqCst) {
            info!("Interrupted, stopping the assay");
        }
    } else if monitor_assay(&session, MONITOR_REFRESH)? == MonitorExit::Stopped {
        info!("Stopped from the monitor");
    }

    let poll_error = session.status().last_poll_error;
    session.abort();

    let records = read_ledger(dir.join(LEDGER_FILE_NAME))
        .with_context(|| format!("Failed to read back the ledger in '{}'", dir.display()))?;
    let successful = records
        .last()
        .map_or(0, |r| r.outcome.successful_trial_count);
    println!("{} trials recorded, {} successful", records.len(), successful);

    if let Some(e) = poll_error {
        warn!("The assay stopped early");
        bail!("Lost contact with the controller: {e}");
    }
    Ok(())
}

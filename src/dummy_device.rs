//! A simulated joystick controller.
//!
//! [DummyDevice] answers the same RPCs as the real firmware and walks through
//! the same `ASSAY_NOT_STARTED → ASSAY_RUNNING → ASSAY_FINISHED` states. With
//! a trial period set, a background thread finishes one trial per period;
//! without one, trials only advance when [DummyDevice::run_trial] is called,
//! which keeps tests deterministic.
//!
//! Like the firmware, the simulation holds the next trial back until the
//! timing data of the last one has been read, so no trial is lost to a slow
//! host.

use crate::device_client::{
    method, AssayState, AssayStatus, Block, DeviceClient, DeviceError, DeviceId, TrialTimingData,
};

use log::{debug, info};
use rand::prelude::*;
use serde_json::{json, Value};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// JSON-RPC code for an unknown method.
const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC code for parameters of the wrong shape.
const INVALID_PARAMS: i64 = -32602;

enum Signal {
    Stop,
}

/// The simulated firmware state.
#[derive(Debug)]
struct Firmware {
    state: AssayState,
    set: Vec<Block>,
    block_index: usize,
    trials_in_block: u32,
    status: AssayStatus,
    timing: TrialTimingData,
    time_reference: i64,
    time_set_at: Instant,
    success_probability: f64,
}

impl Firmware {
    fn new(success_probability: f64) -> Self {
        Self {
            state: AssayState::NotStarted,
            set: Vec::new(),
            block_index: 0,
            trials_in_block: 0,
            status: AssayStatus::default(),
            timing: TrialTimingData::default(),
            time_reference: 0,
            time_set_at: Instant::now(),
            success_probability,
        }
    }

    fn now(&self) -> i64 {
        self.time_reference + self.time_set_at.elapsed().as_secs() as i64
    }

    fn total_trials(&self) -> u64 {
        self.set.iter().map(|b| b.repeat_trial_count as u64).sum()
    }

    fn start(&mut self) -> bool {
        match self.state {
            AssayState::Running => true,
            _ if self.total_trials() == 0 => false,
            _ => {
                self.state = AssayState::Running;
                self.block_index = 0;
                self.trials_in_block = 0;
                self.status = AssayStatus::default();
                self.timing = TrialTimingData::default();
                self.skip_empty_blocks();
                info!("Simulated assay started with {} trials", self.total_trials());
                true
            }
        }
    }

    fn abort(&mut self) {
        if self.state == AssayState::Running {
            self.status.assay_aborted = true;
            self.state = AssayState::Finished;
        }
    }

    fn skip_empty_blocks(&mut self) {
        while self
            .set
            .get(self.block_index)
            .is_some_and(|b| self.trials_in_block >= b.repeat_trial_count)
        {
            self.block_index += 1;
            self.trials_in_block = 0;
        }
    }

    fn run_trial(&mut self, rng: &mut impl Rng) {
        if self.state != AssayState::Running || self.status.unread_trial_timing_data {
            return;
        }
        let Some(block) = self.set.get(self.block_index).copied() else {
            self.state = AssayState::Finished;
            return;
        };

        let now = self.now();
        let successful = rng.gen_bool(self.success_probability);
        self.timing = TrialTimingData {
            trial_start: now - 2,
            mouse_ready: now - 2,
            joystick_ready: now - 1,
            pull: if successful { now } else { 0 },
            push: 0,
            timeout: if successful { 0 } else { now },
            trial_abort: 0,
        };

        self.status.finished_trial_count += 1;
        if successful {
            self.status.successful_trial_count += 1;
        }
        self.status.block = block;
        self.status.set_in_assay = self.block_index as u64;
        self.status.unread_trial_timing_data = true;

        self.trials_in_block += 1;
        self.skip_empty_blocks();
        if self.block_index >= self.set.len() {
            self.state = AssayState::Finished;
            info!(
                "Simulated assay finished after {} trials",
                self.status.finished_trial_count
            );
        }
    }

    fn assay_status(&self) -> AssayStatus {
        AssayStatus {
            state: self.state.clone(),
            ..self.status.clone()
        }
    }
}

/// A [DeviceClient] backed by simulated firmware instead of a serial port.
#[derive(Debug)]
pub struct DummyDevice {
    id: DeviceId,
    handle: Option<thread::JoinHandle<()>>,
    tx: Option<mpsc::Sender<Signal>>,
    firmware: Arc<Mutex<Firmware>>,
}

/// Configures a [DummyDevice] before it starts.
#[derive(Debug, Clone)]
pub struct DummyDeviceBuilder {
    id: DeviceId,
    trial_period: Option<Duration>,
    success_probability: f64,
}

impl Default for DummyDeviceBuilder {
    fn default() -> Self {
        Self {
            id: DeviceId {
                name: "mouse_joystick_controller".to_owned(),
                form_factor: "5x3".to_owned(),
                serial_number: 0,
            },
            trial_period: None,
            success_probability: 0.75,
        }
    }
}

impl DummyDeviceBuilder {
    /// Sets the identity the device reports.
    pub fn id(self, name: &str, form_factor: &str, serial_number: u32) -> Self {
        Self {
            id: DeviceId {
                name: name.to_owned(),
                form_factor: form_factor.to_owned(),
                serial_number,
            },
            ..self
        }
    }

    /// Finishes one trial every `period` on a background thread.
    pub fn trial_period(self, period: Duration) -> Self {
        Self {
            trial_period: Some(period),
            ..self
        }
    }

    /// Chance that a simulated trial ends with a pull.
    pub fn success_probability(self, probability: f64) -> Self {
        Self {
            success_probability: probability.clamp(0.0, 1.0),
            ..self
        }
    }

    /// Starts the simulated device.
    pub fn build(self) -> DummyDevice {
        let firmware = Arc::new(Mutex::new(Firmware::new(self.success_probability)));

        let (handle, tx) = match self.trial_period {
            Some(period) => {
                let (tx, rx) = mpsc::channel::<Signal>();
                let th_firmware = Arc::clone(&firmware);
                let handle = thread::spawn(move || {
                    let mut rng = thread_rng();
                    loop {
                        match rx.recv_timeout(period) {
                            Ok(Signal::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                            Err(mpsc::RecvTimeoutError::Timeout) => {
                                lock(&th_firmware).run_trial(&mut rng)
                            }
                        }
                    }
                });
                (Some(handle), Some(tx))
            }
            None => (None, None),
        };

        DummyDevice {
            id: self.id,
            handle,
            tx,
            firmware,
        }
    }
}

fn lock(firmware: &Mutex<Firmware>) -> MutexGuard<'_, Firmware> {
    firmware.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DummyDevice {
    /// A device with default settings that only advances on [DummyDevice::run_trial].
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a device.
    pub fn builder() -> DummyDeviceBuilder {
        DummyDeviceBuilder::default()
    }

    /// Finishes the current trial right away. Does nothing while the last
    /// trial's timing data is unread.
    pub fn run_trial(&self) {
        lock(&self.firmware).run_trial(&mut thread_rng());
    }

    /// The blocks currently staged on the device.
    pub fn staged_set(&self) -> Vec<Block> {
        lock(&self.firmware).set.clone()
    }

    /// Stops the background thread, if there is one.
    pub fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Signal::Stop);
        }
        if let Some(thread) = self.handle.take() {
            let _ = thread.join();
        }
    }

    fn dispatch(&self, name: &str, params: Vec<Value>) -> Result<Value, DeviceError> {
        let mut firmware = lock(&self.firmware);
        match name {
            method::GET_DEVICE_ID => Ok(serde_json::to_value(&self.id)?),
            method::SET_TIME => {
                firmware.time_reference = param(&params, 0)?;
                firmware.time_set_at = Instant::now();
                Ok(Value::Null)
            }
            method::START_ASSAY => Ok(json!(firmware.start())),
            method::ABORT_ASSAY => {
                firmware.abort();
                Ok(Value::Null)
            }
            method::GET_ASSAY_STATUS => Ok(serde_json::to_value(firmware.assay_status())?),
            method::GET_TRIAL_TIMING_DATA => {
                firmware.status.unread_trial_timing_data = false;
                Ok(serde_json::to_value(firmware.timing)?)
            }
            method::CLEAR_SET => {
                firmware.set.clear();
                Ok(Value::Null)
            }
            method::ADD_BLOCK_TO_SET => {
                let block = Block {
                    repeat_trial_count: param(&params, 0)?,
                    pull_torque: param(&params, 1)?,
                    lickport_reward_duration: param(&params, 2)?,
                    reach_position: param(&params, 3)?,
                };
                firmware.set.push(block);
                Ok(serde_json::to_value(block)?)
            }
            _ => Err(DeviceError::Rpc {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {name}"),
            }),
        }
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DummyDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DeviceClient for DummyDevice {
    fn device_id(&self) -> &DeviceId {
        &self.id
    }

    fn call(&mut self, name: &str, params: Vec<Value>) -> Result<Value, DeviceError> {
        debug!("{} <- {} {:?}", self.id, name, params);
        self.dispatch(name, params)
    }
}

fn param<T: serde::de::DeserializeOwned>(params: &[Value], index: usize) -> Result<T, DeviceError> {
    params
        .get(index)
        .and_then(|p| T::deserialize(p).ok())
        .ok_or_else(|| DeviceError::Rpc {
            code: INVALID_PARAMS,
            message: format!("Invalid params: missing or malformed parameter {index}"),
        })
}

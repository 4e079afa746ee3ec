//! The remote procedure calls exposed by the rig's microcontrollers and the
//! typed values they exchange.
//!
//! Every device speaks the same request/response protocol, so a
//! [DeviceClient] only has to provide [DeviceClient::call]; the typed RPCs of
//! the joystick controller are provided on top of it. Their meaning is
//! defined by the firmware; this layer adds no retries and no buffering, and
//! transport failures are returned to the caller untouched.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Errors raised while talking to a device.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Reading from or writing to the port failed.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device sent something that is not the expected JSON.
    #[error("malformed device response: {0}")]
    Json(#[from] serde_json::Error),

    /// The device understood the request and refused it.
    #[error("device error {code}: {message}")]
    Rpc {
        /// Error code reported by the firmware
        code: i64,
        /// Error message reported by the firmware
        message: String,
    },

    /// The response is valid JSON but not the shape the call returns.
    #[error("unexpected response to '{method}': {response}")]
    UnexpectedResponse {
        /// The method that was called
        method: String,
        /// The raw result
        response: String,
    },

    /// The port reached end of file.
    #[error("device closed the connection")]
    Disconnected,
}

/// Identity reported by a device, used to tell devices on different ports apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// Firmware name, e.g. `mouse_joystick_controller`
    pub name: String,
    /// Board form factor, e.g. `5x3`
    pub form_factor: String,
    /// Serial number assigned to the board
    pub serial_number: u32,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) #{}",
            self.name, self.form_factor, self.serial_number
        )
    }
}

/// One entry of the trial schedule: `repeat_trial_count` trials sharing the
/// same torque, reward and reach position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// How many trials run with these parameters
    pub repeat_trial_count: u32,
    /// Torque the mouse must pull against
    pub pull_torque: i64,
    /// How long the lickport delivers reward after a successful pull
    pub lickport_reward_duration: i64,
    /// Joystick position the mouse has to reach
    pub reach_position: [i64; 2],
}

/// The assay state machine, owned by the controller firmware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AssayState {
    /// `ASSAY_NOT_STARTED`
    #[default]
    NotStarted,
    /// `ASSAY_RUNNING`
    Running,
    /// `ASSAY_FINISHED`
    Finished,
    /// Any intermediate state the firmware reports, kept verbatim
    Other(String),
}

impl From<String> for AssayState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ASSAY_NOT_STARTED" => Self::NotStarted,
            "ASSAY_RUNNING" => Self::Running,
            "ASSAY_FINISHED" => Self::Finished,
            _ => Self::Other(value),
        }
    }
}

impl From<AssayState> for String {
    fn from(value: AssayState) -> Self {
        match value {
            AssayState::NotStarted => "ASSAY_NOT_STARTED".to_owned(),
            AssayState::Running => "ASSAY_RUNNING".to_owned(),
            AssayState::Finished => "ASSAY_FINISHED".to_owned(),
            AssayState::Other(state) => state,
        }
    }
}

/// Answer to `get_assay_status`.
///
/// Only `state` and `unread_trial_timing_data` are required; the counters
/// default to zero when a firmware revision leaves them out.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssayStatus {
    pub state: AssayState,
    pub unread_trial_timing_data: bool,
    #[serde(default)]
    pub finished_trial_count: u64,
    #[serde(default)]
    pub successful_trial_count: u64,
    #[serde(default)]
    pub trial_aborted: bool,
    #[serde(default)]
    pub assay_aborted: bool,
    #[serde(default)]
    pub pull_threshold: i64,
    #[serde(default)]
    pub set_in_assay: u64,
    /// The block the last trial belonged to
    #[serde(default)]
    pub block: Block,
}

/// Answer to `get_trial_timing_data`: when each event of the last trial
/// happened, in epoch seconds relative to the clock set with `set_time`.
/// `0` means the event did not happen.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialTimingData {
    pub trial_start: i64,
    pub mouse_ready: i64,
    pub joystick_ready: i64,
    pub pull: i64,
    pub push: i64,
    pub timeout: i64,
    pub trial_abort: i64,
}

/// Wire names of the controller RPCs.
pub mod method {
    #![allow(missing_docs)]
    pub const GET_DEVICE_ID: &str = "get_device_id";
    pub const SET_TIME: &str = "set_time";
    pub const START_ASSAY: &str = "start_assay";
    pub const ABORT_ASSAY: &str = "abort_assay";
    pub const GET_ASSAY_STATUS: &str = "get_assay_status";
    pub const GET_TRIAL_TIMING_DATA: &str = "get_trial_timing_data";
    pub const CLEAR_SET: &str = "clear_set";
    pub const ADD_BLOCK_TO_SET: &str = "add_block_to_set";
}

/// A handle to one remote device.
pub trait DeviceClient: Send {
    /// Identity the device reported when it was discovered.
    fn device_id(&self) -> &DeviceId;

    /// Sends one request and waits for its result.
    fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value, DeviceError>;

    /// Sets the device clock reference, in epoch seconds.
    fn set_time(&mut self, epoch: i64) -> Result<(), DeviceError> {
        self.call(method::SET_TIME, vec![json!(epoch)]).map(drop)
    }

    /// Asks the controller to begin the assay. Returns whether it confirmed
    /// that the assay is running.
    fn start_assay(&mut self) -> Result<bool, DeviceError> {
        let result = self.call(method::START_ASSAY, Vec::new())?;
        match &result {
            Value::Bool(started) => Ok(*started),
            Value::Object(fields) if fields.contains_key("state") => {
                let status: AssayStatus = decode(method::START_ASSAY, result.clone())?;
                Ok(!matches!(
                    status.state,
                    AssayState::NotStarted | AssayState::Finished
                ))
            }
            _ => Err(unexpected(method::START_ASSAY, &result)),
        }
    }

    /// Stops the assay on the controller.
    fn abort_assay(&mut self) -> Result<(), DeviceError> {
        self.call(method::ABORT_ASSAY, Vec::new()).map(drop)
    }

    /// Reads the controller's assay state and counters.
    fn get_assay_status(&mut self) -> Result<AssayStatus, DeviceError> {
        let result = self.call(method::GET_ASSAY_STATUS, Vec::new())?;
        decode(method::GET_ASSAY_STATUS, result)
    }

    /// Reads the timing data of the last finished trial and marks it read.
    fn get_trial_timing_data(&mut self) -> Result<TrialTimingData, DeviceError> {
        let result = self.call(method::GET_TRIAL_TIMING_DATA, Vec::new())?;
        decode(method::GET_TRIAL_TIMING_DATA, result)
    }

    /// Removes every block from the staged set.
    fn clear_set(&mut self) -> Result<(), DeviceError> {
        self.call(method::CLEAR_SET, Vec::new()).map(drop)
    }

    /// Appends a block to the staged set, returning the block as stored.
    fn add_block_to_set(&mut self, block: &Block) -> Result<Block, DeviceError> {
        let params = vec![
            json!(block.repeat_trial_count),
            json!(block.pull_torque),
            json!(block.lickport_reward_duration),
            json!(block.reach_position),
        ];
        let result = self.call(method::ADD_BLOCK_TO_SET, params)?;
        decode(method::ADD_BLOCK_TO_SET, result)
    }
}

impl<D: DeviceClient + ?Sized> DeviceClient for Box<D> {
    fn device_id(&self) -> &DeviceId {
        (**self).device_id()
    }

    fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value, DeviceError> {
        (**self).call(method, params)
    }
}

/// Deserializes an RPC result, reporting the method on failure.
pub fn decode<T: DeserializeOwned>(method: &str, result: Value) -> Result<T, DeviceError> {
    T::deserialize(&result).map_err(|_| unexpected(method, &result))
}

fn unexpected(method: &str, result: &Value) -> DeviceError {
    DeviceError::UnexpectedResponse {
        method: method.to_owned(),
        response: result.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned results and remembers what was asked.
    struct Canned {
        id: DeviceId,
        results: VecDeque<Value>,
        calls: Vec<(String, Vec<Value>)>,
    }

    impl Canned {
        fn new(results: Vec<Value>) -> Self {
            Self {
                id: DeviceId {
                    name: "mouse_joystick_controller".into(),
                    form_factor: "5x3".into(),
                    serial_number: 1,
                },
                results: results.into(),
                calls: Vec::new(),
            }
        }
    }

    impl DeviceClient for Canned {
        fn device_id(&self) -> &DeviceId {
            &self.id
        }

        fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value, DeviceError> {
            self.calls.push((method.to_owned(), params));
            self.results.pop_front().ok_or(DeviceError::Disconnected)
        }
    }

    #[test]
    fn status_parses_with_defaults() {
        let mut dev = Canned::new(vec![json!({
            "state": "ASSAY_RUNNING",
            "unread_trial_timing_data": true,
            "finished_trial_count": 4
        })]);
        let status = dev.get_assay_status().unwrap();
        assert_eq!(status.state, AssayState::Running);
        assert!(status.unread_trial_timing_data);
        assert_eq!(status.finished_trial_count, 4);
        assert_eq!(status.block, Block::default());
    }

    #[test]
    fn status_requires_state() {
        let mut dev = Canned::new(vec![json!({"unread_trial_timing_data": false})]);
        assert!(matches!(
            dev.get_assay_status(),
            Err(DeviceError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn unknown_states_are_kept() {
        let state: AssayState = serde_json::from_value(json!("MOVE_TO_BASE_START")).unwrap();
        assert_eq!(state, AssayState::Other("MOVE_TO_BASE_START".into()));
        assert_eq!(
            serde_json::to_value(AssayState::Finished).unwrap(),
            json!("ASSAY_FINISHED")
        );
    }

    #[test]
    fn start_assay_accepts_bool_or_status() {
        let mut dev = Canned::new(vec![
            json!(true),
            json!(false),
            json!({"state": "ASSAY_RUNNING", "unread_trial_timing_data": false}),
            json!({"state": "ASSAY_NOT_STARTED", "unread_trial_timing_data": false}),
            json!("yes"),
        ]);
        assert!(dev.start_assay().unwrap());
        assert!(!dev.start_assay().unwrap());
        assert!(dev.start_assay().unwrap());
        assert!(!dev.start_assay().unwrap());
        assert!(dev.start_assay().is_err());
    }

    #[test]
    fn add_block_sends_positional_params() {
        let block = Block {
            repeat_trial_count: 2,
            pull_torque: 50,
            lickport_reward_duration: 10,
            reach_position: [100, 200],
        };
        let mut dev = Canned::new(vec![serde_json::to_value(block).unwrap()]);
        assert_eq!(dev.add_block_to_set(&block).unwrap(), block);
        assert_eq!(
            dev.calls[0],
            (
                method::ADD_BLOCK_TO_SET.to_owned(),
                vec![json!(2), json!(50), json!(10), json!([100, 200])]
            )
        );
    }

    #[test]
    fn timing_data_defaults_missing_fields_to_unset() {
        let mut dev = Canned::new(vec![json!({"trial_start": 0, "pull": 1690000000})]);
        let timing = dev.get_trial_timing_data().unwrap();
        assert_eq!(timing.pull, 1_690_000_000);
        assert_eq!(timing.push, 0);
    }
}

//! Talking to the rig's microcontrollers over their USB serial ports.
//!
//! Each request is one JSON array on its own line, the method name followed by
//! its positional parameters:
//!
//! ```text
//! ["add_block_to_set",2,50,10,[100,200]]
//! ```
//!
//! and the device answers with one JSON object per line, carrying either a
//! `result` or an `error`:
//!
//! ```text
//! {"id":"add_block_to_set","result":{"repeat_trial_count":2,...}}
//! {"id":"set_time","error":{"code":-32602,"message":"Invalid params"}}
//! ```

use crate::device_client::{decode, method, DeviceClient, DeviceError, DeviceId};

use log::{debug, info, warn};
use serde_json::Value;
use serial2::SerialPort;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Baud rate the controller firmware listens at.
pub const DEFAULT_BAUD: u32 = 115200;

/// How long a single read may block. Boards reset when their port is opened,
/// so this also has to cover the boot time before the first answer.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Encodes a request line, newline included.
pub fn encode_request(name: &str, params: &[Value]) -> Result<String, DeviceError> {
    let mut request = Vec::with_capacity(params.len() + 1);
    request.push(Value::from(name));
    request.extend_from_slice(params);
    let mut line = serde_json::to_string(&Value::Array(request))?;
    line.push('\n');
    Ok(line)
}

/// Extracts the result from a response line.
pub fn parse_response(line: &str) -> Result<Value, DeviceError> {
    let mut response: serde_json::Map<String, Value> = serde_json::from_str(line)?;
    if let Some(error) = response.remove("error") {
        return Err(DeviceError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_owned(),
        });
    }
    Ok(response.remove("result").unwrap_or(Value::Null))
}

/// A serial port plus the bytes read past the last complete line.
struct Connection {
    port: SerialPort,
    path: PathBuf,
    pending: Vec<u8>,
}

impl Connection {
    fn open(path: &Path, baud: u32) -> Result<Self, DeviceError> {
        let mut port = SerialPort::open(path, baud)?;
        port.set_read_timeout(READ_TIMEOUT)?;
        Ok(Self {
            port,
            path: path.to_owned(),
            pending: Vec::new(),
        })
    }

    fn request(&mut self, name: &str, params: &[Value]) -> Result<Value, DeviceError> {
        let line = encode_request(name, params)?;
        debug!("{} -> {}", self.path.display(), line.trim_end());
        self.port.write_all(line.as_bytes())?;
        self.port.flush()?;

        loop {
            let line = self.read_line()?;
            debug!("{} <- {}", self.path.display(), line);
            match parse_response(&line) {
                Err(DeviceError::Json(e)) => {
                    // Boards sometimes print boot noise before their first answer
                    warn!("Skipping unparsable line from {}: {}", self.path.display(), e);
                }
                other => return other,
            }
        }
    }

    fn read_line(&mut self) -> Result<String, DeviceError> {
        let mut buffer = [0; 256];
        loop {
            if let Some(end) = self.pending.iter().position(|&c| c == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=end).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_owned();
                if !line.is_empty() {
                    return Ok(line);
                }
                continue;
            }

            let read_len = self.port.read(&mut buffer)?;
            if read_len == 0 {
                return Err(DeviceError::Disconnected);
            }
            self.pending.extend_from_slice(&buffer[..read_len]);
        }
    }
}

/// A device reached through a serial port.
pub struct SerialDevice {
    connection: Connection,
    id: DeviceId,
}

impl SerialDevice {
    /// Opens the port at `path` and asks the device who it is.
    pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<Self, DeviceError> {
        let mut connection = Connection::open(path.as_ref(), baud)?;
        let id: DeviceId = decode(
            method::GET_DEVICE_ID,
            connection.request(method::GET_DEVICE_ID, &[])?,
        )?;
        info!("Found {} on {}", id, connection.path.display());
        Ok(Self { connection, id })
    }

    /// Port the device is attached to.
    pub fn path(&self) -> &Path {
        &self.connection.path
    }
}

impl DeviceClient for SerialDevice {
    fn device_id(&self) -> &DeviceId {
        &self.id
    }

    fn call(&mut self, name: &str, params: Vec<Value>) -> Result<Value, DeviceError> {
        self.connection.request(name, &params)
    }
}

/// Opens every serial port on the host and keeps the ones that answer with a
/// device id. Ports that fail are logged and skipped.
pub fn discover_serial_devices(baud: u32) -> Result<Vec<SerialDevice>, DeviceError> {
    let ports = SerialPort::available_ports()?;
    debug!("Probing {} serial ports", ports.len());

    let devices = ports
        .into_iter()
        .filter_map(|path| match SerialDevice::open(&path, baud) {
            Ok(device) => Some(device),
            Err(e) => {
                warn!("No device answered on {}: {}", path.display(), e);
                None
            }
        })
        .collect();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_are_one_json_line() {
        let line = encode_request("add_block_to_set", &[json!(2), json!([100, 200])]).unwrap();
        assert_eq!(line, "[\"add_block_to_set\",2,[100,200]]\n");
        assert_eq!(encode_request("clear_set", &[]).unwrap(), "[\"clear_set\"]\n");
    }

    #[test]
    fn results_are_extracted() {
        let result = parse_response(r#"{"id":"get_assay_status","result":{"state":"ASSAY_RUNNING"}}"#)
            .unwrap();
        assert_eq!(result, json!({"state": "ASSAY_RUNNING"}));
    }

    #[test]
    fn missing_result_is_null() {
        assert_eq!(parse_response(r#"{"id":"clear_set"}"#).unwrap(), Value::Null);
    }

    #[test]
    fn errors_become_rpc_errors() {
        match parse_response(r#"{"id":"set_time","error":{"code":-32602,"message":"Invalid params"}}"#) {
            Err(DeviceError::Rpc { code, message }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "Invalid params");
            }
            other => panic!("expected an rpc error, got {other:?}"),
        }
    }

    #[test]
    fn missing_port_is_an_io_error() {
        assert!(matches!(
            SerialDevice::open("/dev/mouse_joystick_missing_port", DEFAULT_BAUD),
            Err(DeviceError::Io(_))
        ));
    }

    #[test]
    fn noise_is_a_json_error() {
        assert!(matches!(
            parse_response("Booting..."),
            Err(DeviceError::Json(_))
        ));
    }
}

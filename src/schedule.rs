//! Loading the trial schedule from a CSV file and uploading it to the
//! controller as its set of [Block]s.
//!
//! A schedule file has one row per block and exactly the flattened block
//! columns:
//!
//! ```text
//! repeat_trial_count,pull_torque,lickport_reward_duration,reach_position.0,reach_position.1
//! 2,50,10,100,200
//! ```
//!
//! The whole file is validated before the controller is touched, so a bad
//! file never leaves a half uploaded set behind.

use crate::device_client::{Block, DeviceClient, DeviceError};
use crate::flatten::{flatten, unflatten, FlattenError};

use log::{debug, info, warn};
use nom::{
    character::complete::{i64, space0},
    combinator::all_consuming,
    sequence::delimited,
    Finish, IResult,
};
use serde_json::{Map, Value};
use std::{io::Read, path::Path};
use thiserror::Error;

/// Errors that reject a schedule file before anything is uploaded.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The file could not be opened or is not well formed CSV.
    #[error("could not read schedule: {0}")]
    Csv(#[from] csv::Error),

    /// The header is not the flattened block schema.
    #[error("schedule columns {found:?} do not match the block columns {expected:?}")]
    HeaderMismatch {
        /// Columns a schedule must have
        expected: Vec<String>,
        /// Columns the file has
        found: Vec<String>,
    },

    /// A cell is not integer text.
    #[error("row {row}, column '{column}': '{text}' is not an integer")]
    NotAnInteger {
        /// 1-based data row
        row: usize,
        /// Column of the bad cell
        column: String,
        /// Contents of the bad cell
        text: String,
    },

    /// The columns could not be nested back into a block.
    #[error("row {row}: {source}")]
    Shape {
        /// 1-based data row
        row: usize,
        /// Why nesting failed
        source: FlattenError,
    },

    /// The values do not fit a block, e.g. a negative repeat count.
    #[error("row {row}: {message}")]
    InvalidBlock {
        /// 1-based data row
        row: usize,
        /// Why the values were refused
        message: String,
    },
}

/// Errors while pushing a validated schedule to the controller.
#[derive(Error, Debug)]
pub enum UploadError {
    /// Talking to the controller failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The controller stored something other than what was sent.
    #[error("block {index} was echoed as {echoed:?} instead of {sent:?}")]
    BlockEchoMismatch {
        /// 0-based position in the schedule
        index: usize,
        /// The block that was sent
        sent: Block,
        /// The block the controller reported back
        echoed: Block,
    },
}

/// The flattened block columns, in schedule order.
pub fn block_columns() -> Vec<String> {
    serde_json::to_value(Block::default())
        .map(|value| flatten(&value).keys().cloned().collect())
        .unwrap_or_default()
}

/// Reads and validates the schedule at `path`.
pub fn load_schedule(path: impl AsRef<Path>) -> Result<Vec<Block>, ScheduleError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(csv::Error::from)?;
    let blocks = read_schedule(file)?;
    info!("Loaded {} blocks from '{}'", blocks.len(), path.display());
    Ok(blocks)
}

/// Reads and validates a schedule from any CSV source.
pub fn read_schedule(source: impl Read) -> Result<Vec<Block>, ScheduleError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
    let expected = block_columns();
    if !same_columns(&headers, &expected) {
        return Err(ScheduleError::HeaderMismatch {
            expected,
            found: headers,
        });
    }

    let mut blocks = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = index + 1;

        let mut flat = Map::new();
        for (column, text) in headers.iter().zip(record.iter()) {
            let value = parse_integer(text).ok_or_else(|| ScheduleError::NotAnInteger {
                row,
                column: column.clone(),
                text: text.to_owned(),
            })?;
            flat.insert(column.clone(), Value::from(value));
        }

        let nested = unflatten(&flat).map_err(|source| ScheduleError::Shape { row, source })?;
        let block: Block =
            serde_json::from_value(nested).map_err(|e| ScheduleError::InvalidBlock {
                row,
                message: e.to_string(),
            })?;
        blocks.push(block);
    }

    if blocks.is_empty() {
        warn!("Schedule has no blocks");
    }
    Ok(blocks)
}

/// Replaces the controller's set with `blocks`, checking every echo.
pub fn upload_schedule<D>(device: &mut D, blocks: &[Block]) -> Result<(), UploadError>
where
    D: DeviceClient + ?Sized,
{
    device.clear_set()?;
    for (index, block) in blocks.iter().enumerate() {
        let echoed = device.add_block_to_set(block)?;
        if echoed != *block {
            return Err(UploadError::BlockEchoMismatch {
                index,
                sent: *block,
                echoed,
            });
        }
        debug!("Uploaded block {}: {:?}", index, block);
    }
    info!("Uploaded {} blocks to {}", blocks.len(), device.device_id());
    Ok(())
}

fn same_columns(found: &[String], expected: &[String]) -> bool {
    let mut found: Vec<&String> = found.iter().collect();
    let mut expected: Vec<&String> = expected.iter().collect();
    found.sort();
    expected.sort();
    found == expected
}

fn integer_cell(s: &str) -> IResult<&str, i64> {
    all_consuming(delimited(space0, i64, space0))(s)
}

fn parse_integer(text: &str) -> Option<i64> {
    integer_cell(text).finish().ok().map(|(_rest, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_client::DeviceId;
    use serde_json::json;

    const HEADER: &str =
        "repeat_trial_count,pull_torque,lickport_reward_duration,reach_position.0,reach_position.1";

    fn schedule(rows: &[&str]) -> String {
        let mut text = String::from(HEADER);
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        text
    }

    /// Stores blocks like the firmware does, optionally corrupting one field.
    struct EchoDevice {
        id: DeviceId,
        set: Vec<Block>,
        calls: Vec<String>,
        corrupt_torque: bool,
    }

    impl EchoDevice {
        fn new(corrupt_torque: bool) -> Self {
            Self {
                id: DeviceId {
                    name: "mouse_joystick_controller".into(),
                    form_factor: "5x3".into(),
                    serial_number: 0,
                },
                set: vec![Block::default()],
                calls: Vec::new(),
                corrupt_torque,
            }
        }
    }

    impl DeviceClient for EchoDevice {
        fn device_id(&self) -> &DeviceId {
            &self.id
        }

        fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value, DeviceError> {
            self.calls.push(method.to_owned());
            match method {
                "clear_set" => {
                    self.set.clear();
                    Ok(Value::Null)
                }
                "add_block_to_set" => {
                    let mut block = Block {
                        repeat_trial_count: serde_json::from_value(params[0].clone())?,
                        pull_torque: serde_json::from_value(params[1].clone())?,
                        lickport_reward_duration: serde_json::from_value(params[2].clone())?,
                        reach_position: serde_json::from_value(params[3].clone())?,
                    };
                    if self.corrupt_torque {
                        block.pull_torque += 1;
                    }
                    self.set.push(block);
                    Ok(serde_json::to_value(block)?)
                }
                _ => Ok(Value::Null),
            }
        }
    }

    #[test]
    fn block_columns_are_the_schedule_header() {
        assert_eq!(block_columns().join(","), HEADER);
    }

    #[test]
    fn one_row_makes_one_block() {
        let blocks = read_schedule(schedule(&["2,50,10,100,200"]).as_bytes()).unwrap();
        assert_eq!(
            blocks,
            vec![Block {
                repeat_trial_count: 2,
                pull_torque: 50,
                lickport_reward_duration: 10,
                reach_position: [100, 200],
            }]
        );
    }

    #[test]
    fn column_order_does_not_matter() {
        let text = "reach_position.1,reach_position.0,pull_torque,lickport_reward_duration,repeat_trial_count\n200,100,50,10,2";
        let blocks = read_schedule(text.as_bytes()).unwrap();
        assert_eq!(blocks[0].reach_position, [100, 200]);
        assert_eq!(blocks[0].repeat_trial_count, 2);
    }

    #[test]
    fn wrong_header_reports_expected_columns() {
        let text = "repeat_trial_count,pull_torque,reach_position.0,reach_position.1\n2,50,100,200";
        match read_schedule(text.as_bytes()) {
            Err(ScheduleError::HeaderMismatch { expected, found }) => {
                assert_eq!(expected, block_columns());
                assert_eq!(found.len(), 4);
            }
            other => panic!("expected a header mismatch, got {other:?}"),
        }
    }

    #[test]
    fn malformed_integers_are_rejected() {
        for bad in ["2,5O,10,100,200", "2,50,10.5,100,200", "2,50,10,,200"] {
            let err = read_schedule(schedule(&["1,1,1,1,1", bad]).as_bytes()).unwrap_err();
            assert!(
                matches!(err, ScheduleError::NotAnInteger { row: 2, .. }),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn negative_repeat_count_is_rejected() {
        let err = read_schedule(schedule(&["-1,50,10,100,200"]).as_bytes()).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidBlock { row: 1, .. }));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = read_schedule(schedule(&["2,50,10,100"]).as_bytes()).unwrap_err();
        assert!(matches!(err, ScheduleError::Csv(_)));
    }

    #[test]
    fn load_schedule_reads_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), schedule(&["2,50,10,100,200", "3,60,20,110,210"])).unwrap();
        assert_eq!(load_schedule(file.path()).unwrap().len(), 2);
    }

    #[test]
    fn upload_round_trips_every_block() {
        let blocks = read_schedule(
            schedule(&["2,50,10,100,200", "0,-5,0,0,0", "7,1,2,3,4"]).as_bytes(),
        )
        .unwrap();
        let mut device = EchoDevice::new(false);
        upload_schedule(&mut device, &blocks).unwrap();
        assert_eq!(device.set, blocks);
        assert_eq!(device.calls[0], "clear_set");
        assert_eq!(device.calls.len(), 1 + blocks.len());
    }

    #[test]
    fn echo_mismatch_is_fatal() {
        let blocks = read_schedule(schedule(&["2,50,10,100,200"]).as_bytes()).unwrap();
        let mut device = EchoDevice::new(true);
        match upload_schedule(&mut device, &blocks) {
            Err(UploadError::BlockEchoMismatch { index, sent, echoed }) => {
                assert_eq!(index, 0);
                assert_eq!(sent.pull_torque, 50);
                assert_eq!(echoed.pull_torque, 51);
            }
            other => panic!("expected an echo mismatch, got {other:?}"),
        }
    }

    #[test]
    fn blocks_serialize_to_the_wire_shape() {
        let block = Block {
            repeat_trial_count: 2,
            pull_torque: 50,
            lickport_reward_duration: 10,
            reach_position: [100, 200],
        };
        assert_eq!(
            serde_json::to_value(block).unwrap(),
            json!({
                "repeat_trial_count": 2,
                "pull_torque": 50,
                "lickport_reward_duration": 10,
                "reach_position": [100, 200]
            })
        );
    }
}

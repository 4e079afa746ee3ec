//! The record stored for every finished trial.
//!
//! A [TrialRecord] is assembled field by field from the controller's
//! [AssayStatus] and its [TrialTimingData], so the ledger columns are fixed
//! by these types rather than by whatever keys the firmware happens to send.

use crate::device_client::{AssayStatus, Block, TrialTimingData};
use crate::flatten::{flatten, unflatten, FlattenError};
use crate::timestamp::{from_sentinel_string, to_sentinel_string, TimestampError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors converting a record to or from a ledger row.
#[derive(Error, Debug)]
pub enum RecordError {
    /// Serializing or deserializing the typed record failed.
    #[error("record does not match its schema: {0}")]
    Json(#[from] serde_json::Error),

    /// A timing cell is not a valid timestamp.
    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    /// The flat columns could not be nested.
    #[error(transparent)]
    Flatten(#[from] FlattenError),

    /// A cell is neither a boolean nor an integer.
    #[error("column '{column}': '{text}' is not a boolean or an integer")]
    BadCell {
        /// Column of the bad cell
        column: String,
        /// Contents of the bad cell
        text: String,
    },

    /// The row does not have the ledger columns.
    #[error("expected columns {expected:?}, found {found:?}")]
    ColumnMismatch {
        /// The ledger columns
        expected: Vec<String>,
        /// The columns that were given
        found: Vec<String>,
    },
}

/// Non-timing part of a trial record, copied out of the assay status.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub finished_trial_count: u64,
    pub successful_trial_count: u64,
    pub trial_aborted: bool,
    pub assay_aborted: bool,
    pub pull_threshold: i64,
    pub set_in_assay: u64,
    pub block: Block,
}

impl From<&AssayStatus> for TrialOutcome {
    fn from(status: &AssayStatus) -> Self {
        Self {
            finished_trial_count: status.finished_trial_count,
            successful_trial_count: status.successful_trial_count,
            trial_aborted: status.trial_aborted,
            assay_aborted: status.assay_aborted,
            pull_threshold: status.pull_threshold,
            set_in_assay: status.set_in_assay,
            block: status.block,
        }
    }
}

/// One finished trial, as written to the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialRecord {
    /// Counters and block parameters at the end of the trial
    pub outcome: TrialOutcome,
    /// When each event of the trial happened
    pub timing: TrialTimingData,
}

impl TrialRecord {
    /// Combines a status and the timing data read right after it.
    pub fn new(status: &AssayStatus, timing: TrialTimingData) -> Self {
        Self {
            outcome: TrialOutcome::from(status),
            timing,
        }
    }

    /// The ledger header: flattened outcome columns followed by the timing
    /// columns.
    pub fn columns() -> Vec<String> {
        let mut columns = outcome_columns();
        columns.extend(timing_columns());
        columns
    }

    /// Renders the record as text cells in [TrialRecord::columns] order.
    /// Timing fields go through the `NULL` timestamp encoding.
    pub fn to_row(&self) -> Result<Vec<String>, RecordError> {
        let mut row: Vec<String> = flatten(&serde_json::to_value(&self.outcome)?)
            .values()
            .map(cell_text)
            .collect();
        for epoch in flatten(&serde_json::to_value(self.timing)?).values() {
            row.push(to_sentinel_string(epoch.as_i64().unwrap_or_default())?);
        }
        Ok(row)
    }

    /// Parses cells read back from a ledger. `columns` must be the ledger
    /// header, in any order.
    pub fn from_row<S: AsRef<str>>(columns: &[S], cells: &[S]) -> Result<Self, RecordError> {
        let expected = Self::columns();
        let found: Vec<String> = columns.iter().map(|c| c.as_ref().to_owned()).collect();
        let mut sorted_found = found.clone();
        let mut sorted_expected = expected.clone();
        sorted_found.sort();
        sorted_expected.sort();
        if sorted_found != sorted_expected || cells.len() != columns.len() {
            return Err(RecordError::ColumnMismatch { expected, found });
        }

        let timing_columns = timing_columns();
        let mut outcome = Map::new();
        let mut timing = Map::new();
        for (column, text) in found.into_iter().zip(cells.iter().map(AsRef::as_ref)) {
            if timing_columns.contains(&column) {
                timing.insert(column, Value::from(from_sentinel_string(text)?));
            } else {
                let value = parse_cell(text).ok_or_else(|| RecordError::BadCell {
                    column: column.clone(),
                    text: text.to_owned(),
                })?;
                outcome.insert(column, value);
            }
        }

        Ok(Self {
            outcome: serde_json::from_value(unflatten(&outcome)?)?,
            timing: serde_json::from_value(Value::Object(timing))?,
        })
    }
}

fn outcome_columns() -> Vec<String> {
    serde_json::to_value(TrialOutcome::default())
        .map(|value| flatten(&value).keys().cloned().collect())
        .unwrap_or_default()
}

fn timing_columns() -> Vec<String> {
    serde_json::to_value(TrialTimingData::default())
        .map(|value| flatten(&value).keys().cloned().collect())
        .unwrap_or_default()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_cell(text: &str) -> Option<Value> {
    match text {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => text
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.parse::<u64>().map(Value::from))
            .ok(),
    }
}

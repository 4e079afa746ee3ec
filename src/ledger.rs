//! Per-assay output files.
//!
//! Every assay gets its own directory, named after its start time, holding
//!
//! - `trials.csv`, the ledger: a fixed header followed by one row per
//!   finished trial, flushed as soon as it is written so an interrupted assay
//!   still leaves a valid partial file;
//! - `assay.ron`, a description of the assay written once at start.

use crate::device_client::{Block, DeviceId};
use crate::timestamp::{directory_name, TimestampError};
use crate::trial_record::{RecordError, TrialRecord};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Revision of the ledger header. Bump whenever [TrialRecord::columns] changes.
pub const LEDGER_VERSION: u32 = 1;

/// File name of the ledger inside an assay directory.
pub const LEDGER_FILE_NAME: &str = "trials.csv";

/// File name of the assay description inside an assay directory.
pub const METADATA_FILE_NAME: &str = "assay.ron";

/// Errors while creating, writing or reading assay files.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// CSV encoding or decoding error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// A row could not be converted.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// The start time has no directory name.
    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    /// Another assay already owns the directory. It is never reused.
    #[error("assay directory '{0}' already exists")]
    DirectoryExists(PathBuf),

    /// Serializing the assay description failed.
    #[error("ron error: {0}")]
    Ron(#[from] ron::Error),

    /// Deserializing the assay description failed.
    #[error("ron error: {0}")]
    RonSpanned(#[from] ron::de::SpannedError),

    /// The ledger was already closed.
    #[error("ledger '{0}' is closed")]
    Closed(PathBuf),
}

/// Creates `<base_dir>/<YYYY-MM-DD-HH-MM-SS>` for an assay started at
/// `started_at` (epoch seconds). Fails if the directory is already there.
pub fn create_assay_directory(base_dir: &Path, started_at: i64) -> Result<PathBuf, LedgerError> {
    fs::create_dir_all(base_dir)?;
    let dir = base_dir.join(directory_name(started_at)?);
    match fs::create_dir(&dir) {
        Ok(()) => {
            debug!("Created assay directory '{}'", dir.display());
            Ok(dir)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LedgerError::DirectoryExists(dir)),
        Err(e) => Err(e.into()),
    }
}

/// The open CSV file that finished trials are appended to.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: usize,
}

impl Ledger {
    /// Creates `trials.csv` in `dir` and writes the header.
    pub fn create(dir: &Path) -> Result<Self, LedgerError> {
        let path = dir.join(LEDGER_FILE_NAME);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(TrialRecord::columns())?;
        writer.flush()?;
        info!("Ledger opened at '{}'", path.display());

        Ok(Self {
            path,
            writer: Some(writer),
            rows: 0,
        })
    }

    /// Appends one trial and flushes it to disk.
    pub fn append(&mut self, record: &TrialRecord) -> Result<(), LedgerError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| LedgerError::Closed(self.path.clone()))?;
        writer.write_record(record.to_row()?)?;
        writer.flush()?;
        self.rows += 1;
        debug!("Ledger row {} written", self.rows);
        Ok(())
    }

    /// Flushes and closes the file. Closing a closed ledger does nothing.
    pub fn close(&mut self) -> Result<(), LedgerError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                "Ledger '{}' closed after {} rows",
                self.path.display(),
                self.rows
            );
        }
        Ok(())
    }

    /// Whether rows can still be appended.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Number of trial rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Location of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close ledger '{}': {}", self.path.display(), e);
        }
    }
}

/// Reads a ledger back into records, in the order they were written.
pub fn read_ledger(path: impl AsRef<Path>) -> Result<Vec<TrialRecord>, LedgerError> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
    let mut records = Vec::new();
    for row in reader.records() {
        let cells: Vec<String> = row?.iter().map(str::to_owned).collect();
        records.push(TrialRecord::from_row(&columns, &cells)?);
    }
    Ok(records)
}

/// What `assay.ron` records about an assay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssayMetadata {
    /// [LEDGER_VERSION] of the ledger next to this file
    pub ledger_version: u32,
    /// Local start time, `YYYY-MM-DD-HH-MM-SS`
    pub started_at: String,
    /// The controller that ran the assay
    pub controller: DeviceId,
    /// The uploaded schedule
    pub blocks: Vec<Block>,
}

impl AssayMetadata {
    /// Writes `assay.ron` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, LedgerError> {
        let path = dir.join(METADATA_FILE_NAME);
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(&path, text)?;
        Ok(path)
    }

    /// Reads an `assay.ron` file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let text = fs::read_to_string(path)?;
        Ok(ron::de::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_client::{AssayState, AssayStatus, TrialTimingData};

    fn record(count: u64, pull: i64) -> TrialRecord {
        let status = AssayStatus {
            state: AssayState::Running,
            unread_trial_timing_data: true,
            finished_trial_count: count,
            ..Default::default()
        };
        TrialRecord::new(
            &status,
            TrialTimingData {
                pull,
                ..Default::default()
            },
        )
    }

    #[test]
    fn header_is_written_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::create(dir.path()).unwrap();
        let text = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text.trim_end(), TrialRecord::columns().join(","));
        assert_eq!(ledger.rows(), 0);
    }

    #[test]
    fn rows_are_on_disk_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::create(dir.path()).unwrap();
        ledger.append(&record(1, 0)).unwrap();
        ledger.append(&record(2, 1_690_000_000)).unwrap();

        let back = read_ledger(ledger.path()).unwrap();
        assert_eq!(back, vec![record(1, 0), record(2, 1_690_000_000)]);
        assert!(ledger.is_open());
    }

    #[test]
    fn closed_ledger_refuses_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::create(dir.path()).unwrap();
        ledger.close().unwrap();
        ledger.close().unwrap();
        assert!(!ledger.is_open());
        assert!(matches!(
            ledger.append(&record(1, 0)),
            Err(LedgerError::Closed(_))
        ));
    }

    #[test]
    fn existing_ledger_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let _first = Ledger::create(dir.path()).unwrap();
        assert!(matches!(Ledger::create(dir.path()), Err(LedgerError::Io(_))));
    }

    #[test]
    fn assay_directory_collisions_fail() {
        let base = tempfile::tempdir().unwrap();
        let dir = create_assay_directory(base.path(), 1_690_000_000).unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.parent(), Some(base.path()));
        assert!(matches!(
            create_assay_directory(base.path(), 1_690_000_000),
            Err(LedgerError::DirectoryExists(_))
        ));
    }

    #[test]
    fn metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = AssayMetadata {
            ledger_version: LEDGER_VERSION,
            started_at: "2023-07-22-04-26-40".into(),
            controller: DeviceId {
                name: "mouse_joystick_controller".into(),
                form_factor: "5x3".into(),
                serial_number: 7,
            },
            blocks: vec![Block {
                repeat_trial_count: 2,
                pull_torque: 50,
                lickport_reward_duration: 10,
                reach_position: [100, 200],
            }],
        };
        let path = metadata.write(dir.path()).unwrap();
        assert_eq!(AssayMetadata::read(path).unwrap(), metadata);
    }
}

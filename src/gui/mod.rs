//! The terminal monitor shown while an assay runs.

mod assay_monitor;
mod error;

pub use assay_monitor::{monitor_assay, status_lines, MonitorExit};
pub use error::MonitorError;

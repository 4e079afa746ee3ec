use std::io;
use thiserror::Error;

/// Errors raised while drawing the terminal monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// The terminal could not be set up, drawn to or restored.
    #[error("terminal error: {0}")]
    Io(#[from] io::Error),
}

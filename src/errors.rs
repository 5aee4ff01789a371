use std::io;
use thiserror::Error;

/// Failures at the device command surface. Decoding itself never fails.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    /// Request that does not fit the link phase, e.g. a second metadata request.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The metadata block did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Command rejected by the driver state (sampling before metadata).
    #[error("command failed: {0}")]
    Command(String),
    /// Out-of-table range, bad resistor or regulator value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// EOF or I/O failure on the link; the device is stopped for good.
    #[error("link closed: {0}")]
    LinkClosed(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

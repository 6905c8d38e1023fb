//! Error taxonomy for the calibration engine.

use thiserror::Error;

/// Errors surfaced by calibration workflows.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// A frame or stream event was not observed in time.
    #[error("Timed out after {0} ms waiting for {1}")]
    Timeout(u64, &'static str),

    /// The device frame counter never reset after a calibration call was issued.
    #[error("Operation timed-out when starting calibration")]
    StartupTimeout,

    /// Streaming could not be (re)started with the requested configuration.
    #[error("Failed to start streaming ({width}, {height}, {fps})")]
    StreamStart { width: u32, height: u32, fps: u32 },

    /// The device reported a negative status code.
    #[error("Firmware error ({code}) from {context}")]
    Firmware { code: i32, context: &'static str },

    /// Fewer frames were captured than the workflow requires.
    #[error("{0}")]
    InsufficientData(String),

    /// A numeric fit was skipped because its inputs were degenerate.
    #[error("Degenerate input: {0}")]
    DegenerateInput(&'static str),

    /// The connected device lacks a required capability.
    #[error("Device does not support {0}")]
    UnsupportedDevice(&'static str),

    /// The device returned fewer bytes than the protocol requires.
    #[error("Not enough data from {0}")]
    ShortResponse(&'static str),

    /// Configuration store I/O or parse failure.
    #[error("Config store error: {0}")]
    Config(String),

    /// Catch-all for collaborator-reported failures.
    #[error("{0}")]
    Device(String),
}

impl From<std::io::Error> for CalibrationError {
    fn from(e: std::io::Error) -> Self {
        CalibrationError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(e: serde_json::Error) -> Self {
        CalibrationError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CalibrationError>;

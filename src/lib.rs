//! Depth-Camera Self-Calibration Engine
//!
//! In-field calibration workflows for a stereo depth camera:
//! - on-chip intrinsic / focal-length / extended self-calibration
//! - tare calibration against a known ground-truth distance
//! - stand-alone focal-length calibration from dual-IR target imaging
//! - depth/color UV-mapping calibration (firmware and host-side)
//!
//! The engine owns workflow orchestration and signal processing; stream
//! transport, rendering and the firmware's numeric routines are external
//! collaborators reached through the traits in [`stream`], [`device`] and
//! [`config`].

pub mod acquire;
pub mod calibration;
pub mod camera;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod progress;
pub mod stream;
pub mod target;

pub use calibration::{Action, CalibParams, CalibrationEngine, CalibrationSession, Collaborators};
pub use error::{CalibrationError, Result};
pub use progress::{ProgressHandle, SessionState};

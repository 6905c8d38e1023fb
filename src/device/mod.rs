//! Collaborator contracts of the calibration device.
//!
//! The firmware calibration routines are opaque; the engine only sequences
//! them, feeds them frames or statistics, and interprets their status and
//! health codes.

use std::time::Duration;

use crate::error::{CalibrationError, Result};
use crate::stream::frames::VideoFrame;

/// Device options the engine overrides for the duration of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOption {
    /// Infrared emitter on/off.
    EmitterEnabled,
    /// Thermal compensation loop on/off.
    ThermalCompensation,
}

/// Camera descriptor strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraInfo {
    SerialNumber,
    ProductId,
    UsbTypeDescriptor,
}

/// Sensor/device option control.
pub trait DeviceControl: Send + Sync {
    fn supports_option(&self, option: DeviceOption) -> bool;
    fn get_option(&self, option: DeviceOption) -> Result<f32>;
    fn set_option(&self, option: DeviceOption, value: f32) -> Result<()>;
    fn camera_info(&self, info: CameraInfo) -> Option<String>;
}

/// Progress callback invoked by long firmware calls.
pub type ProgressFn<'a> = &'a mut dyn FnMut(f32);

/// Result of the device focal-length routine.
pub struct FocalLengthOutcome {
    /// Candidate calibration table.
    pub table: Vec<u8>,
    /// Measured focal-length ratio, percent deviation.
    pub ratio: f32,
    /// Estimated target tilt angle, degrees.
    pub tilt_angle: f32,
}

/// Firmware calibration protocol.
pub trait CalibrationProtocol: Send + Sync {
    fn calibration_table(&self) -> Result<Vec<u8>>;
    fn set_calibration_table(&self, table: &[u8]) -> Result<()>;
    /// Persist the currently applied table to device flash.
    fn write_calibration(&self) -> Result<()>;

    /// On-chip self-calibration. Returns the new table and the raw health
    /// figure (packed for the extended flow).
    fn run_on_chip_calibration(
        &self,
        json: &str,
        progress: ProgressFn,
        timeout: Duration,
    ) -> Result<(Vec<u8>, f32)>;

    /// Tare calibration against a known ground-truth distance. Returns the
    /// new table (empty for incremental steps) and two health figures.
    fn run_tare_calibration(
        &self,
        ground_truth_mm: f32,
        json: &str,
        progress: ProgressFn,
        timeout: Duration,
    ) -> Result<(Vec<u8>, [f32; 2])>;

    /// Focal-length calibration from matched left/right target frames.
    fn run_focal_length_calibration(
        &self,
        left: &[VideoFrame],
        right: &[VideoFrame],
        target_width_mm: f32,
        target_height_mm: f32,
        adjust_both_sides: bool,
        progress: ProgressFn,
    ) -> Result<FocalLengthOutcome>;

    /// UV-mapping calibration from matched left/color/depth triples.
    /// Returns the new table and four health numbers (px, py, fx, fy).
    fn run_uv_map_calibration(
        &self,
        left: &[VideoFrame],
        color: &[VideoFrame],
        depth: &[VideoFrame],
        py_px_only: bool,
        progress: ProgressFn,
    ) -> Result<(Vec<u8>, [f32; 4])>;
}

/// Raw command channel. The first four response bytes are a signed status
/// code; negative means failure.
pub trait DebugProtocol: Send + Sync {
    fn send_and_receive(&self, command: &[u8]) -> Result<Vec<u8>>;
}

/// Send a raw command and validate the signed status header.
pub fn safe_send_command(
    channel: &dyn DebugProtocol,
    command: &[u8],
    name: &'static str,
) -> Result<Vec<u8>> {
    let response = channel.send_and_receive(command)?;
    if response.len() < 4 {
        return Err(CalibrationError::ShortResponse(name));
    }
    let code = i32::from_le_bytes([response[0], response[1], response[2], response[3]]);
    if code < 0 {
        return Err(CalibrationError::Firmware {
            code,
            context: name,
        });
    }
    Ok(response)
}

/// Unpack the extended on-chip health figure: two 12-bit magnitudes plus a
/// sign bit each, scaled by 1/1000.
pub fn decode_extended_health(raw: f32) -> (f32, f32) {
    let packed = raw as i32;
    let h1 = (packed & 0x0000_0FFF) as f32 / 1000.0;
    let h2 = ((packed & 0x00FF_F000) >> 12) as f32 / 1000.0;
    let sign = (packed & 0x0F00_0000) >> 24;
    let h1 = if sign & 1 != 0 { -h1 } else { h1 };
    let h2 = if sign & 2 != 0 { -h2 } else { h2 };
    (h1, h2)
}

/// Qualitative judgement of a health figure, consumed by the notification
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthRating {
    Good,
    CanBeImproved,
    RequiresCalibration,
}

impl HealthRating {
    /// Classify against the per-action "good" limit (0.25 for intrinsic
    /// figures, 0.15 for focal-length figures); 0.75 is the common upper
    /// bound.
    pub fn classify(health: f32, good_limit: f32) -> Self {
        let magnitude = health.abs();
        if magnitude < good_limit {
            HealthRating::Good
        } else if magnitude < 0.75 {
            HealthRating::CanBeImproved
        } else {
            HealthRating::RequiresCalibration
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedChannel {
        response: Mutex<Vec<u8>>,
    }

    impl DebugProtocol for ScriptedChannel {
        fn send_and_receive(&self, _command: &[u8]) -> Result<Vec<u8>> {
            Ok(self.response.lock().clone())
        }
    }

    #[test]
    fn negative_status_is_firmware_error() {
        let channel = ScriptedChannel {
            response: Mutex::new((-6i32).to_le_bytes().to_vec()),
        };
        let err = safe_send_command(&channel, &[0x14], "GETINITCAL").unwrap_err();
        match err {
            CalibrationError::Firmware { code, .. } => assert_eq!(code, -6),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn short_response_is_rejected() {
        let channel = ScriptedChannel {
            response: Mutex::new(vec![0x00, 0x01]),
        };
        assert!(safe_send_command(&channel, &[0x14], "GETINITCAL").is_err());
    }

    #[test]
    fn extended_health_unpacks_signs() {
        // h1 = 0.210 negative, h2 = 0.145 positive
        let packed = (1 << 24) | (145 << 12) | 210;
        let (h1, h2) = decode_extended_health(packed as f32);
        assert!((h1 + 0.210).abs() < 1e-6);
        assert!((h2 - 0.145).abs() < 1e-6);
    }

    #[test]
    fn health_rating_bands() {
        assert_eq!(HealthRating::classify(0.1, 0.25), HealthRating::Good);
        assert_eq!(
            HealthRating::classify(-0.4, 0.25),
            HealthRating::CanBeImproved
        );
        assert_eq!(
            HealthRating::classify(0.8, 0.25),
            HealthRating::RequiresCalibration
        );
        assert_eq!(
            HealthRating::classify(0.2, 0.15),
            HealthRating::CanBeImproved
        );
    }
}

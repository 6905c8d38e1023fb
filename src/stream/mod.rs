//! Stream model and the runtime contract of the external viewer.
//!
//! The engine never talks to transport directly; it computes a
//! [`SensorSelection`] and hands it to the [`StreamRuntime`], which owns
//! capture threads, decoding and the shared synchronizer.

pub mod frames;
pub mod select;

use std::time::Instant;

use crate::camera::{CameraIntrinsics, Extrinsics};
use crate::error::Result;
use frames::{FrameReceiver, VideoFrame};

/// Stable identifier of one stream exposed by a sensor.
pub type StreamId = u32;

/// Physical sensor on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Stereo depth module (depth + left/right infrared streams).
    Depth,
    /// RGB sensor.
    Color,
}

/// Pixel-format tag used to pick streams per calibration action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 16-bit depth.
    Z16,
    /// 8-bit infrared intensity.
    Y8,
    /// 24-bit color.
    Rgb8,
}

/// The subset of one sensor's streams chosen for a calibration phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSelection {
    /// Enabled stream ids, in priority order.
    pub enabled: Vec<StreamId>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SensorSelection {
    pub fn new(enabled: Vec<StreamId>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            enabled,
            width,
            height,
            fps,
        }
    }
}

/// Funnel for operations that must run on the streaming context's thread.
///
/// Stream start/stop mutates state owned by the display loop; everything
/// routed through here executes there (and blocks the caller until done).
pub trait Invoker: Send + Sync {
    fn invoke(&self, action: &mut dyn FnMut());
}

/// Executes actions inline; used when the caller already runs on the
/// context thread, and by tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectInvoker;

impl Invoker for DirectInvoker {
    fn invoke(&self, action: &mut dyn FnMut()) {
        action();
    }
}

/// Contract of the external stream/viewer runtime.
pub trait StreamRuntime: Send + Sync {
    /// Stream ids with their pixel-format options, in enumeration order.
    fn formats(&self, sensor: SensorKind) -> Vec<(StreamId, Vec<PixelFormat>)>;

    /// Resolutions the sensor advertises.
    fn supported_resolutions(&self, sensor: SensorKind) -> Vec<(u32, u32)>;

    /// FPS values the sensor advertises.
    fn supported_fps(&self, sensor: SensorKind) -> Vec<u32>;

    /// Whether the combination in `selection` can be streamed.
    fn is_supported(&self, sensor: SensorKind, selection: &SensorSelection) -> bool;

    /// Start streaming the selection. Must be called via the [`Invoker`].
    fn play(&self, sensor: SensorKind, selection: &SensorSelection) -> Result<()>;

    /// Stop all streams of the sensor. Must be called via the [`Invoker`].
    fn stop(&self, sensor: SensorKind);

    /// The selection currently applied to the sensor, if any.
    fn selection(&self, sensor: SensorKind) -> Option<SensorSelection>;

    /// Whether the sensor is currently streaming.
    fn is_streaming(&self, sensor: SensorKind) -> bool;

    /// Arrival instant of the most recent frame on `stream`.
    fn last_frame_at(&self, stream: StreamId) -> Option<Instant>;

    /// Most recent decoded frame on `stream`.
    fn last_frame(&self, stream: StreamId) -> Option<VideoFrame>;

    /// Queue fed by the capture thread for `stream`.
    fn frame_queue(&self, stream: StreamId) -> FrameReceiver;

    /// Intrinsics of the stream's active profile.
    fn intrinsics(&self, stream: StreamId) -> Option<CameraIntrinsics>;

    /// Extrinsic transform between two streams' sensors.
    fn extrinsics(&self, from: StreamId, to: StreamId) -> Option<Extrinsics>;

    /// Depth unit in millimeters per Z16 count.
    fn depth_unit_mm(&self) -> f32;

    /// Stereo baseline in millimeters.
    fn stereo_baseline_mm(&self) -> f32;
}

//! Stream Configuration Selector.
//!
//! Chooses stream formats per calibration phase, negotiates unsupported
//! resolution/FPS combinations, and drives stream start/stop through the
//! invoker so all streaming-context mutations stay on its thread.

use std::time::Duration;

use log::{info, warn};

use super::{Invoker, PixelFormat, SensorKind, SensorSelection, StreamId, StreamRuntime};
use crate::clock::{poll_until, Clock};
use crate::error::{CalibrationError, Result};

/// Which streams a calibration phase needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPlan {
    /// Depth stream only (on-chip and tare flows).
    Depth,
    /// Single infrared stream (ground-truth measurement).
    Infrared,
    /// Left + right infrared (stand-alone focal length).
    DualInfrared,
    /// Infrared + depth on the stereo module plus RGB on the color sensor
    /// (UV-mapping flows).
    IrDepthAndColor,
}

impl StreamPlan {
    pub fn wants_color(self) -> bool {
        matches!(self, StreamPlan::IrDepthAndColor)
    }
}

/// Streams chosen for the active phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStreams {
    pub depth: SensorSelection,
    pub color: Option<SensorSelection>,
    /// Primary stream (first enabled depth-sensor stream).
    pub primary: StreamId,
    /// Secondary stream (right IR or depth, when the plan has one).
    pub secondary: Option<StreamId>,
    /// Color stream, when the plan has one.
    pub color_stream: Option<StreamId>,
}

const FRAME_POLL: Duration = Duration::from_millis(10);
const FRAME_FRESH: Duration = Duration::from_millis(100);
const START_POLLS: u32 = 200;
const SETTLE_DELAY: Duration = Duration::from_millis(600);

pub struct StreamConfigurator<'a> {
    runtime: &'a dyn StreamRuntime,
    invoker: &'a dyn Invoker,
    clock: &'a dyn Clock,
}

impl<'a> StreamConfigurator<'a> {
    pub fn new(
        runtime: &'a dyn StreamRuntime,
        invoker: &'a dyn Invoker,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            runtime,
            invoker,
            clock,
        }
    }

    /// Pick depth-sensor stream ids for the plan, matching the first
    /// pixel-format tag of each advertised stream in priority order.
    fn depth_streams(&self, plan: StreamPlan) -> Result<(StreamId, Option<StreamId>)> {
        let formats = self.runtime.formats(SensorKind::Depth);
        let first_with = |tag: PixelFormat, skip: Option<StreamId>| {
            formats
                .iter()
                .filter(|(id, opts)| Some(*id) != skip && opts.first() == Some(&tag))
                .map(|(id, _)| *id)
                .next()
        };

        match plan {
            StreamPlan::Depth => {
                let depth = first_with(PixelFormat::Z16, None)
                    .ok_or(CalibrationError::UnsupportedDevice("a depth (Z16) stream"))?;
                Ok((depth, None))
            }
            StreamPlan::Infrared => {
                let ir = first_with(PixelFormat::Y8, None)
                    .ok_or(CalibrationError::UnsupportedDevice("an infrared (Y8) stream"))?;
                Ok((ir, None))
            }
            StreamPlan::DualInfrared => {
                let left = first_with(PixelFormat::Y8, None)
                    .ok_or(CalibrationError::UnsupportedDevice("a left infrared stream"))?;
                let right = first_with(PixelFormat::Y8, Some(left))
                    .ok_or(CalibrationError::UnsupportedDevice("a right infrared stream"))?;
                Ok((left, Some(right)))
            }
            StreamPlan::IrDepthAndColor => {
                let ir = first_with(PixelFormat::Y8, None)
                    .ok_or(CalibrationError::UnsupportedDevice("an infrared (Y8) stream"))?;
                let depth = first_with(PixelFormat::Z16, None)
                    .ok_or(CalibrationError::UnsupportedDevice("a depth (Z16) stream"))?;
                Ok((ir, Some(depth)))
            }
        }
    }

    /// Pick the color stream carrying RGB8 anywhere in its format list.
    fn color_stream(&self) -> Result<StreamId> {
        self.runtime
            .formats(SensorKind::Color)
            .iter()
            .find(|(_, opts)| opts.contains(&PixelFormat::Rgb8))
            .map(|(id, _)| *id)
            .ok_or(CalibrationError::UnsupportedDevice("an RGB8 color stream"))
    }

    /// Negotiate an unsupported combination: sweep FPS at the requested
    /// resolution, then fall back to 640x480.
    fn negotiate(&self, sensor: SensorKind, mut selection: SensorSelection) -> SensorSelection {
        if self.runtime.is_supported(sensor, &selection) {
            return selection;
        }

        let requested_fps = selection.fps;
        for fps in self.runtime.supported_fps(sensor) {
            selection.fps = fps;
            if self.runtime.is_supported(sensor, &selection) {
                warn!(
                    "{}x{}@{} unsupported, using {} fps",
                    selection.width, selection.height, requested_fps, fps
                );
                return selection;
            }
        }

        selection.fps = requested_fps;
        selection.width = 640;
        selection.height = 480;
        if !self.runtime.is_supported(sensor, &selection) {
            for fps in self.runtime.supported_fps(sensor) {
                selection.fps = fps;
                if self.runtime.is_supported(sensor, &selection) {
                    break;
                }
            }
        }
        warn!(
            "falling back to {}x{}@{}",
            selection.width, selection.height, selection.fps
        );
        selection
    }

    /// Compute and apply the stream configuration for a phase, then wait
    /// for first frame arrival. Returns `None` when no frame showed up.
    fn start_once(
        &self,
        plan: StreamPlan,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Option<ActiveStreams>> {
        let (primary, secondary) = self.depth_streams(plan)?;
        let mut enabled = vec![primary];
        enabled.extend(secondary);

        let depth = self.negotiate(
            SensorKind::Depth,
            SensorSelection::new(enabled, width, height, fps),
        );

        let (color, color_stream) = if plan.wants_color() {
            let stream = self.color_stream()?;
            let selection = self.negotiate(
                SensorKind::Color,
                SensorSelection::new(vec![stream], width, height, fps),
            );
            (Some(selection), Some(stream))
        } else {
            (None, None)
        };

        let mut play_result: Result<()> = Ok(());
        self.invoker.invoke(&mut || {
            play_result = self.runtime.play(SensorKind::Depth, &depth);
            if let (Ok(()), Some(color)) = (&play_result, &color) {
                play_result = self.runtime.play(SensorKind::Color, color);
            }
        });
        play_result?;

        let watched: Vec<StreamId> = depth
            .enabled
            .iter()
            .copied()
            .chain(color_stream)
            .collect();

        let arrived = poll_until(
            self.clock,
            FRAME_POLL,
            FRAME_POLL * START_POLLS,
            || {
                let now = self.clock.now();
                watched
                    .iter()
                    .any(|&stream| {
                        self.runtime
                            .last_frame_at(stream)
                            .is_some_and(|at| now.duration_since(at) < FRAME_FRESH)
                    })
                    .then_some(())
            },
        );

        if arrived.is_none() {
            return Ok(None);
        }

        Ok(Some(ActiveStreams {
            depth,
            color,
            primary,
            secondary,
            color_stream,
        }))
    }

    /// Start streams for the phase, retrying the whole sequence once after
    /// a settle delay before declaring failure.
    pub fn start(
        &self,
        plan: StreamPlan,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<ActiveStreams> {
        if let Some(active) = self.start_once(plan, width, height, fps)? {
            return Ok(active);
        }

        warn!("no frames after stream start, retrying once");
        self.clock.sleep(SETTLE_DELAY);
        if let Some(active) = self.start_once(plan, width, height, fps)? {
            return Ok(active);
        }

        self.stop();
        Err(CalibrationError::StreamStart { width, height, fps })
    }

    /// Stop both sensors.
    pub fn stop(&self) {
        self.invoker.invoke(&mut || {
            self.runtime.stop(SensorKind::Depth);
            self.runtime.stop(SensorKind::Color);
        });
    }

    /// Re-apply previously captured selections (workspace rollback).
    pub fn restore(&self, depth: Option<&SensorSelection>, color: Option<&SensorSelection>) {
        self.invoker.invoke(&mut || {
            if let Some(selection) = depth {
                if self.runtime.play(SensorKind::Depth, selection).is_err() {
                    warn!("failed to restore depth streams");
                }
            }
            if let Some(selection) = color {
                if self.runtime.play(SensorKind::Color, selection).is_err() {
                    warn!("failed to restore color streams");
                }
            }
        });
        info!("stream selection restored");
    }
}

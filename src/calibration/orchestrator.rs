//! Calibration orchestrator: drives a session end-to-end.
//!
//! One run walks `StreamSetup -> Warmup -> [HostAssistedSampling] ->
//! FirmwareCalibrate -> HealthEvaluation`, with the per-action flows layered
//! on top. Device options and stream selections are captured before any
//! override and restored on every exit path, exactly once.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::acquire::{FrameFetcher, DEFAULT_FETCH_TIMEOUT};
use crate::calibration::fill_factor::{sample_fill_factor, FillFactorTable, SampleWindow};
use crate::calibration::payload;
use crate::calibration::session::{Action, CalibrationSession};
use crate::calibration::table::patch_focal_length;
use crate::calibration::uvmap::{UvCorrespondence, UvMappingCalib};
use crate::clock::SharedClock;
use crate::config::{keys, ConfigStore};
use crate::device::{
    decode_extended_health, CalibrationProtocol, CameraInfo, DeviceControl, DeviceOption,
};
use crate::error::{CalibrationError, Result};
use crate::metrics::{get_depth_metrics, DepthMetrics};
use crate::progress::{ProgressSink, SessionState};
use crate::stream::frames::VideoFrame;
use crate::stream::select::{ActiveStreams, StreamConfigurator, StreamPlan};
use crate::stream::{Invoker, SensorKind, SensorSelection, StreamId, StreamRuntime};
use crate::target::{DetectStatus, DotsDetector, RectDetector};

/// Overall firmware-call timeout for on-chip runs.
const OCC_TIMEOUT: Duration = Duration::from_millis(9000);
/// Extended timeout used on a toggled retry.
const OCC_TIMEOUT_TOGGLED: Duration = Duration::from_millis(12000);
/// Timeout of each tare firmware step.
const TARE_STEP_TIMEOUT: Duration = Duration::from_millis(5000);
/// Deadline for the firmware to reset its frame counter after a call.
const OPERATION_START_TIMEOUT: Duration = Duration::from_millis(4000);
/// Settle delay between stopping user streams and starting calibration
/// streams.
const SETTLE_DELAY: Duration = Duration::from_millis(600);
/// Cool-down before a toggled retry re-issues the firmware call.
const RETRY_COOLDOWN: Duration = Duration::from_millis(3000);
/// Settle delay during workspace restoration.
const RESTORE_DELAY: Duration = Duration::from_millis(200);
/// Frame counter value the warmup waits to pass.
const WARMUP_COUNTER: i64 = 2;
/// Depth profile used for metric capture and default restarts.
const METRIC_PROFILE: (u32, u32, u32) = (848, 480, 30);
/// Classic low-resolution profile of the non-assisted on-chip scan.
const SCAN_PROFILE: (u32, u32, u32) = (256, 144, 90);

const REPOSITION_MESSAGE: &str = "Please adjust the camera position and make sure \
the specific target is in the middle of the camera image";

/// Everything the orchestrator talks to. All collaborators are shared so a
/// session can run on its own worker thread.
#[derive(Clone)]
pub struct Collaborators {
    pub device: Arc<dyn DeviceControl>,
    pub protocol: Arc<dyn CalibrationProtocol>,
    pub runtime: Arc<dyn StreamRuntime>,
    pub invoker: Arc<dyn Invoker>,
    pub config: Arc<dyn ConfigStore>,
    pub clock: SharedClock,
}

/// Device and stream state captured before the session overrides it.
/// Restoration is idempotent and swallows secondary failures so it never
/// masks the primary error.
struct Workspace {
    options: Vec<(DeviceOption, f32)>,
    depth_selection: Option<SensorSelection>,
    color_selection: Option<SensorSelection>,
    was_streaming: bool,
    restored: bool,
}

impl Workspace {
    fn capture(links: &Collaborators) -> Self {
        let mut options = Vec::new();
        for option in [DeviceOption::EmitterEnabled, DeviceOption::ThermalCompensation] {
            if links.device.supports_option(option) {
                match links.device.get_option(option) {
                    Ok(value) => {
                        options.push((option, value));
                        if let Err(e) = links.device.set_option(option, 0.0) {
                            warn!("failed to override {option:?}: {e}");
                        }
                    }
                    Err(e) => warn!("failed to read {option:?}: {e}"),
                }
            }
        }

        Workspace {
            options,
            depth_selection: links.runtime.selection(SensorKind::Depth),
            color_selection: links.runtime.selection(SensorKind::Color),
            was_streaming: links.runtime.is_streaming(SensorKind::Depth),
            restored: false,
        }
    }

    fn restore(&mut self, links: &Collaborators) {
        if self.restored {
            return;
        }
        self.restored = true;

        for (option, value) in &self.options {
            if let Err(e) = links.device.set_option(*option, *value) {
                warn!("failed to restore {option:?}: {e}");
            }
        }

        let configurator =
            StreamConfigurator::new(&*links.runtime, &*links.invoker, &*links.clock);
        configurator.stop();
        links.clock.sleep(RESTORE_DELAY);
        if self.was_streaming {
            configurator.restore(self.depth_selection.as_ref(), self.color_selection.as_ref());
        }
    }
}

fn frame_counter(frame: &VideoFrame) -> i64 {
    frame.frame_counter.unwrap_or(0)
}

pub struct Orchestrator {
    links: Collaborators,
    progress: ProgressSink,
}

impl Orchestrator {
    pub fn new(links: Collaborators, progress: ProgressSink) -> Self {
        Self { links, progress }
    }

    fn configurator(&self) -> StreamConfigurator<'_> {
        StreamConfigurator::new(
            &*self.links.runtime,
            &*self.links.invoker,
            &*self.links.clock,
        )
    }

    fn fetcher(&self, streams: Vec<StreamId>) -> FrameFetcher<'_> {
        FrameFetcher::new(&*self.links.runtime, &*self.links.clock, streams)
    }

    /// Run the session end-to-end. Workspace restoration happens on every
    /// exit path.
    pub fn run(&self, session: &mut CalibrationSession) -> Result<()> {
        let mut workspace = Workspace::capture(&self.links);
        let result = self.run_flow(session);
        workspace.restore(&self.links);

        match &result {
            Ok(()) => self.progress.finish(),
            Err(e) => self.progress.fail(e.to_string()),
        }
        result
    }

    fn run_flow(&self, session: &mut CalibrationSession) -> Result<()> {
        info!("starting {}", session.action);
        self.progress.enter(SessionState::StreamSetup);
        self.update_last_used();

        session.old_table = self.links.protocol.calibration_table()?;

        if session.action.captures_metrics() {
            let streams = self.ensure_depth_streaming()?;
            let before = self.depth_metrics_now(&streams)?;
            info!(
                "depth quality before: fill {:.1}%, rms {:.2}%",
                before.fill_rate, before.rms_percent
            );
            session.metrics_before = Some(before);
        }

        let configurator = self.configurator();
        configurator.stop();
        self.links.clock.sleep(SETTLE_DELAY);

        let active = if session.action.uses_target_resolution() {
            configurator.start(session.action.stream_plan(), 1280, 720, self.target_fps())?
        } else if session.host_assistance {
            let (w, h, fps) = METRIC_PROFILE;
            configurator.start(StreamPlan::Depth, w, h, fps)?
        } else {
            let (w, h, fps) = SCAN_PROFILE;
            configurator.start(StreamPlan::Depth, w, h, fps)?
        };

        match session.action {
            Action::TareGroundTruth => self.measure_ground_truth(session, &active)?,
            Action::FocalLength => self.calibrate_focal_length(session, &active)?,
            Action::UvMappingFirmware => self.calibrate_uv_firmware(session, &active)?,
            Action::UvMappingHost => self.calibrate_uv_host(session, &active)?,
            _ => self.calibrate_on_chip(session, &active)?,
        }

        match session.action {
            Action::TareGroundTruth => {
                info!("tare ground truth: {} mm", session.ground_truth_mm)
            }
            Action::FocalLength => info!(
                "focal length ratio: {:.3}",
                session.corrected_ratio.unwrap_or(0.0)
            ),
            Action::UvMappingFirmware | Action::UvMappingHost => {
                info!("UV-mapping calibration completed")
            }
            _ => info!(
                "calibration completed, health factor {:.3}",
                session.health_1.unwrap_or(0.0)
            ),
        }

        if session.action.captures_metrics() {
            configurator.stop();
            let (w, h, fps) = METRIC_PROFILE;
            let restarted = configurator.start(StreamPlan::Depth, w, h, fps)?;

            if !session.new_table.is_empty() {
                self.links
                    .protocol
                    .set_calibration_table(&session.new_table)?;
            }

            let after = self.depth_metrics_now(&restarted.depth.enabled)?;
            info!(
                "depth quality after: fill {:.1}%, rms {:.2}%",
                after.fill_rate, after.rms_percent
            );
            session.metrics_after = Some(after);
        }

        Ok(())
    }

    /// Color/IR streaming at 720p is bandwidth-limited to 5 FPS on USB 2.
    fn target_fps(&self) -> u32 {
        match self.links.device.camera_info(CameraInfo::UsbTypeDescriptor) {
            Some(descriptor) if !descriptor.starts_with("3.") => 5,
            _ => 30,
        }
    }

    fn update_last_used(&self) {
        if let Some(serial) = self.links.device.camera_info(CameraInfo::SerialNumber) {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            self.links
                .config
                .set_i64(&format!("{}.{serial}", keys::LAST_CALIB_PREFIX), now);
        }
    }

    /// Make sure a depth stream is up for metric capture; returns the
    /// streams to watch.
    fn ensure_depth_streaming(&self) -> Result<Vec<StreamId>> {
        if self.links.runtime.is_streaming(SensorKind::Depth) {
            if let Some(selection) = self.links.runtime.selection(SensorKind::Depth) {
                if !selection.enabled.is_empty() {
                    return Ok(selection.enabled);
                }
            }
        }
        let (w, h, fps) = METRIC_PROFILE;
        let active = self.configurator().start(StreamPlan::Depth, w, h, fps)?;
        Ok(active.depth.enabled)
    }

    fn depth_metrics_now(&self, streams: &[StreamId]) -> Result<DepthMetrics> {
        let primary = *streams
            .first()
            .ok_or(CalibrationError::UnsupportedDevice("an active depth stream"))?;
        let intrinsics = self
            .links
            .runtime
            .intrinsics(primary)
            .ok_or(CalibrationError::UnsupportedDevice("depth intrinsics"))?;
        let fetcher = self.fetcher(streams.to_vec());
        get_depth_metrics(
            &fetcher,
            &intrinsics,
            self.links.runtime.depth_unit_mm(),
            None,
        )
    }

    /// Block until the firmware frame counter drops below `threshold`
    /// (a counter reset marks the start of a calibration phase).
    fn wait_for_counter_below(
        &self,
        fetcher: &FrameFetcher,
        threshold: i64,
        mut frame: VideoFrame,
        bump_cap: u32,
    ) -> Result<(VideoFrame, i64)> {
        let started = self.links.clock.now();
        let mut counter = frame_counter(&frame);
        while counter >= threshold {
            if self.links.clock.now().duration_since(started) > OPERATION_START_TIMEOUT {
                return Err(CalibrationError::StartupTimeout);
            }
            self.progress.bump(2, bump_cap);
            frame = fetcher.fetch_depth_frame(DEFAULT_FETCH_TIMEOUT)?;
            counter = frame_counter(&frame);
        }
        Ok((frame, counter))
    }

    /// Harvest one fill-factor sample per counter tick until the firmware
    /// frame budget is met, spreading `progress_span` points over the scan.
    fn sample_fill_factors(
        &self,
        fetcher: &FrameFetcher,
        window: SampleWindow,
        total: usize,
        mut frame: VideoFrame,
        progress_span: u32,
    ) -> Result<FillFactorTable> {
        self.progress.enter(SessionState::HostAssistedSampling);
        let base = self.progress.get();
        let mut table = FillFactorTable::new(total);
        let mut counter = frame_counter(&frame);
        let mut prev = total as i64;

        while counter < total as i64 {
            if counter != prev && counter >= 0 {
                self.progress
                    .set(base + counter as u32 * progress_span / total as u32);
                table.record(counter as usize, sample_fill_factor(&frame, window));
            }
            frame = fetcher.fetch_depth_frame(DEFAULT_FETCH_TIMEOUT)?;
            prev = counter;
            counter = frame_counter(&frame);
        }

        table.fill_missing_data()?;
        Ok(table)
    }

    /// On-chip and tare flows (classic and host-assisted).
    fn calibrate_on_chip(
        &self,
        session: &mut CalibrationSession,
        active: &ActiveStreams,
    ) -> Result<()> {
        let mut occ_timeout = OCC_TIMEOUT;
        if session.action.auto_retries() {
            if session.toggle {
                occ_timeout = OCC_TIMEOUT_TOGGLED;
                session.params.speed_fl = match session.params.speed_fl {
                    0 => 1,
                    1 => 0,
                    other => other,
                };
                session.toggle = false;
                warn!(
                    "re-attempting with speed profile {}",
                    session.params.speed_fl
                );
                self.links.clock.sleep(RETRY_COOLDOWN);
            }
            session.params.apply_speed_fl_profile();
        }

        let json = match session.action {
            Action::OnChip => payload::on_chip(&session.params, session.host_assistance),
            Action::OnChipFocalLength => {
                payload::on_chip_focal_length(&session.params, session.host_assistance)
            }
            _ => payload::extended(&session.params, session.host_assistance),
        };

        // Warmup: wait for the stream to deliver a steady frame counter.
        self.progress.enter(SessionState::Warmup);
        let fetcher = self.fetcher(active.depth.enabled.clone());
        let mut frame = fetcher.fetch_depth_frame(DEFAULT_FETCH_TIMEOUT)?;
        while frame_counter(&frame) <= WARMUP_COUNTER {
            self.progress.bump(3, 7);
            frame = fetcher.fetch_depth_frame(DEFAULT_FETCH_TIMEOUT)?;
        }
        self.progress.set(10);
        let start_counter = frame_counter(&frame);

        // Kick off the firmware scan (scan-only when host-assisted).
        self.progress.enter(SessionState::FirmwareCalibrate);
        let progress = &self.progress;
        let mut raw_health = 0.0f32;
        let mut tare_health = [0.0f32; 2];
        if session.action == Action::Tare {
            let (table, health) = self.links.protocol.run_tare_calibration(
                session.ground_truth_mm,
                &json,
                &mut |p| progress.set(p as u32),
                TARE_STEP_TIMEOUT,
            )?;
            session.new_table = table;
            tare_health = health;
        } else {
            let (table, health) = self.links.protocol.run_on_chip_calibration(
                &json,
                &mut |p| progress.set(p as u32),
                occ_timeout,
            )?;
            session.new_table = table;
            raw_health = health;
        }

        if session.host_assistance {
            match session.action {
                Action::Tare => {
                    tare_health =
                        self.tare_host_assisted(session, &fetcher, frame, start_counter)?;
                }
                Action::OnChipExtended => {
                    raw_health =
                        self.extended_host_assisted(session, &fetcher, frame, start_counter)?;
                }
                _ => {
                    raw_health = self.scan_host_assisted(session, &fetcher, frame, start_counter)?;
                }
            }
        }

        self.progress.enter(SessionState::HealthEvaluation);
        match session.action {
            Action::OnChipExtended => {
                let (h1, h2) = decode_extended_health(raw_health);
                session.health_1 = Some(h1);
                session.health_2 = Some(h2);
            }
            Action::Tare => {
                session.health_1 = Some(tare_health[0] * 100.0);
                session.health_2 = Some(tare_health[1] * 100.0);
            }
            _ => session.health_1 = Some(raw_health),
        }
        Ok(())
    }

    /// Host-assisted single-phase scan (intrinsic or focal length): build
    /// the fill-factor table and upload it.
    fn scan_host_assisted(
        &self,
        session: &mut CalibrationSession,
        fetcher: &FrameFetcher,
        frame: VideoFrame,
        start_counter: i64,
    ) -> Result<f32> {
        let (frame, _) = self.wait_for_counter_below(fetcher, start_counter, frame, 18)?;
        self.progress.set(20);

        let focal_scan = session.action == Action::OnChipFocalLength;
        let window = if focal_scan {
            SampleWindow::focal_band(
                frame.width,
                frame.height,
                session.params.fl_scan_location as u32,
            )
        } else {
            SampleWindow::center(frame.width, frame.height)
        };
        let total = if focal_scan {
            session.params.fl_step_count as usize
        } else {
            session.params.total_frames()
        };

        let table = self.sample_fill_factors(fetcher, window, total, frame, 60)?;

        self.progress.set(80);
        self.progress.enter(SessionState::FirmwareCalibrate);
        let calib_type = if focal_scan { 1 } else { 0 };
        let json = payload::host_sampling(calib_type, 2, table.as_slice());
        let progress = &self.progress;
        let (table, health) = self.links.protocol.run_on_chip_calibration(
            &json,
            &mut |p| progress.set(p as u32),
            OCC_TIMEOUT,
        )?;
        session.new_table = table;
        Ok(health)
    }

    /// Host-assisted extended flow: intrinsic scan over the full window,
    /// then a focal-length scan over the five-row band.
    fn extended_host_assisted(
        &self,
        session: &mut CalibrationSession,
        fetcher: &FrameFetcher,
        frame: VideoFrame,
        start_counter: i64,
    ) -> Result<f32> {
        let (frame, _) = self.wait_for_counter_below(fetcher, start_counter, frame, 18)?;
        self.progress.set(20);

        let total = session.params.total_frames();
        let window = SampleWindow::center(frame.width, frame.height);
        let table = self.sample_fill_factors(fetcher, window, total, frame, 25)?;

        self.progress.enter(SessionState::FirmwareCalibrate);
        let json = payload::host_sampling(2, 2, table.as_slice());
        let (new_table, _) =
            self.links
                .protocol
                .run_on_chip_calibration(&json, &mut |_| {}, OCC_TIMEOUT)?;
        session.new_table = new_table;
        self.progress.set(45);

        // Second phase: the counter resets again below the first budget.
        let frame = fetcher.fetch_depth_frame(DEFAULT_FETCH_TIMEOUT)?;
        let (frame, _) = self.wait_for_counter_below(fetcher, total as i64, frame, 53)?;
        self.progress.set(55);

        let band = SampleWindow::focal_band(
            frame.width,
            frame.height,
            session.params.fl_scan_location as u32,
        );
        let fl_total = session.params.fl_step_count as usize;
        let table = self.sample_fill_factors(fetcher, band, fl_total, frame, 25)?;

        self.progress.set(80);
        self.progress.enter(SessionState::FirmwareCalibrate);
        let json = payload::host_sampling(2, 3, table.as_slice());
        let progress = &self.progress;
        let (new_table, health) = self.links.protocol.run_on_chip_calibration(
            &json,
            &mut |p| progress.set(p as u32),
            OCC_TIMEOUT,
        )?;
        session.new_table = new_table;
        Ok(health)
    }

    /// Host-assisted tare: stream ROI depth averages to the firmware until
    /// the step budget is met, then commit.
    fn tare_host_assisted(
        &self,
        session: &mut CalibrationSession,
        fetcher: &FrameFetcher,
        frame: VideoFrame,
        start_counter: i64,
    ) -> Result<[f32; 2]> {
        let (mut frame, mut counter) =
            self.wait_for_counter_below(fetcher, start_counter, frame, 18)?;
        self.progress.set(20);
        self.progress.enter(SessionState::HostAssistedSampling);

        let window = SampleWindow::center(frame.width, frame.height);
        let total = session.params.step_count;
        let average_steps = session.params.average_step_count;

        let mut sum = 0.0f64;
        let mut valid = 0u64;
        let mut frames_in_tick = 0i64;
        while counter < total {
            if frames_in_tick < average_steps {
                for y in window.y0..window.y0 + window.rows {
                    for x in window.x0..window.x0 + window.width {
                        let raw = frame.depth_at(x, y);
                        if raw != 0 {
                            sum += raw as f64;
                            valid += 1;
                        }
                    }
                }

                if valid > 0 && frames_in_tick + 1 == average_steps {
                    let depth = (sum / valid as f64 * 10000.0 + 0.5) as i64;
                    let json = payload::tare_depth(depth);
                    self.links.protocol.run_tare_calibration(
                        session.ground_truth_mm,
                        &json,
                        &mut |_| {},
                        TARE_STEP_TIMEOUT,
                    )?;
                }
            }

            frame = fetcher.fetch_depth_frame(DEFAULT_FETCH_TIMEOUT)?;
            let next = frame_counter(&frame);
            if next != counter {
                self.progress.bump(1, 80);
                sum = 0.0;
                valid = 0;
                frames_in_tick = 0;
            } else {
                frames_in_tick += 1;
            }
            counter = next;
        }

        self.progress.set(80);
        self.progress.enter(SessionState::FirmwareCalibrate);
        let progress = &self.progress;
        let (table, health) = self.links.protocol.run_tare_calibration(
            session.ground_truth_mm,
            &payload::tare_depth(-1),
            &mut |p| progress.set(p as u32),
            TARE_STEP_TIMEOUT,
        )?;
        session.new_table = table;
        Ok(health)
    }

    /// Stand-alone focal-length calibration: harvest matched IR pairs,
    /// measure the alignment error, run the device routine, patch the
    /// table with the corrected ratio.
    fn calibrate_focal_length(
        &self,
        session: &mut CalibrationSession,
        active: &ActiveStreams,
    ) -> Result<()> {
        let required = RectDetector::FRAME_COUNT;
        let right_stream = active
            .secondary
            .ok_or(CalibrationError::UnsupportedDevice("a right infrared stream"))?;
        info!(
            "focal length calibration, stereo baseline {:.1} mm",
            self.links.runtime.stereo_baseline_mm()
        );
        let left_queue = self.links.runtime.frame_queue(active.primary);
        let right_queue = self.links.runtime.frame_queue(right_stream);

        // Stage 1: matched pairs; the first half of the progress bar.
        let mut left = Vec::with_capacity(required);
        let mut right = Vec::with_capacity(required);
        let mut attempts = 0;
        while left.len() < required && attempts < required * 4 {
            attempts += 1;
            let l = left_queue.wait_for_frame();
            let r = right_queue.wait_for_frame();
            if let (Some(l), Some(r)) = (l, r) {
                left.push(l);
                right.push(r);
                self.progress.bump(2, 50);
            }
        }
        if left.len() < required {
            return Err(CalibrationError::InsufficientData(
                "Failed to capture enough frames!".into(),
            ));
        }

        // Rectangle aspect ratios on both sensors give the alignment error.
        let mut left_detector = RectDetector::new();
        let mut right_detector = RectDetector::new();
        for frame in &left {
            left_detector.process(frame);
        }
        for frame in &right {
            right_detector.process(frame);
        }
        let left_sides = left_detector
            .sides()
            .ok_or_else(|| CalibrationError::InsufficientData(REPOSITION_MESSAGE.into()))?;
        let right_sides = right_detector
            .sides()
            .ok_or_else(|| CalibrationError::InsufficientData(REPOSITION_MESSAGE.into()))?;

        let left_ar = left_sides.aspect_ratio();
        let align = if left_ar > 0.0 {
            (right_sides.aspect_ratio() / left_ar - 1.0) * 100.0
        } else {
            0.0
        };

        // Stage 2: the device routine measures the focal-length ratio.
        self.progress.enter(SessionState::FirmwareCalibrate);
        let progress = &self.progress;
        let outcome = self.links.protocol.run_focal_length_calibration(
            &left,
            &right,
            session.target_width_mm,
            session.target_height_mm,
            session.params.adjust_both_sides,
            &mut |p| progress.set(p as u32),
        )?;

        let corrected = outcome.ratio - session.correction_factor * align;
        let ratio_to_apply = corrected / 100.0 + 1.0;
        session.new_table = patch_focal_length(&session.old_table, ratio_to_apply)?;
        session.corrected_ratio = Some(corrected);
        session.tilt_angle = Some(outcome.tilt_angle);
        info!(
            "focal length: measured {:.3}, align {:.3}, corrected {:.3}",
            outcome.ratio, align, corrected
        );
        Ok(())
    }

    /// Firmware UV-mapping calibration from matched left/depth/color
    /// triples.
    fn calibrate_uv_firmware(
        &self,
        session: &mut CalibrationSession,
        active: &ActiveStreams,
    ) -> Result<()> {
        let required = DotsDetector::FRAME_COUNT;
        let depth_stream = active
            .secondary
            .ok_or(CalibrationError::UnsupportedDevice("a depth stream"))?;
        let color_stream = active
            .color_stream
            .ok_or(CalibrationError::UnsupportedDevice("a color stream"))?;

        let left_queue = self.links.runtime.frame_queue(active.primary);
        let depth_queue = self.links.runtime.frame_queue(depth_stream);
        let color_queue = self.links.runtime.frame_queue(color_stream);

        let mut left = Vec::with_capacity(required);
        let mut depth = Vec::with_capacity(required);
        let mut color = Vec::with_capacity(required);
        let mut attempts = 0;
        while left.len() < required && attempts < required * 4 {
            attempts += 1;
            let l = left_queue.wait_for_frame();
            let d = depth_queue.wait_for_frame();
            let c = color_queue.wait_for_frame();
            if let (Some(l), Some(d), Some(c)) = (l, d, c) {
                left.push(l);
                depth.push(d);
                color.push(c);
            }
            self.progress.bump(2, 50);
        }
        if left.len() < required {
            return Err(CalibrationError::InsufficientData(
                "Failed to capture sufficient amount of frames to run UV-Map calibration!".into(),
            ));
        }

        self.progress.enter(SessionState::FirmwareCalibrate);
        let progress = &self.progress;
        let (table, health) = self.links.protocol.run_uv_map_calibration(
            &left,
            &color,
            &depth,
            session.py_px_only,
            &mut |p| progress.set(p as u32),
        )?;
        if table.is_empty() {
            return Err(CalibrationError::InsufficientData(
                "UV-Mapping calibration failed! Please adjust the camera position and make sure \
the specific target is inside the ROI of the camera images"
                    .into(),
            ));
        }
        info!("UV-mapping recalibration produced a new working point");
        session.new_table = table;
        session.health_nums = Some(health);
        Ok(())
    }

    /// Host-side UV-mapping correction: dot correspondences plus the
    /// closed-form per-axis fit, no firmware call.
    fn calibrate_uv_host(
        &self,
        session: &mut CalibrationSession,
        active: &ActiveStreams,
    ) -> Result<()> {
        let required = DotsDetector::FRAME_COUNT;
        let depth_stream = active
            .secondary
            .ok_or(CalibrationError::UnsupportedDevice("a depth stream"))?;
        let color_stream = active
            .color_stream
            .ok_or(CalibrationError::UnsupportedDevice("a color stream"))?;

        let left_queue = self.links.runtime.frame_queue(active.primary);
        let depth_queue = self.links.runtime.frame_queue(depth_stream);
        let color_queue = self.links.runtime.frame_queue(color_stream);

        let mut left_dots = DotsDetector::new();
        let mut color_dots = DotsDetector::new();
        let mut depth_frames: Vec<VideoFrame> = Vec::with_capacity(required);
        let mut left_done = false;
        let mut color_done = false;

        let mut attempts = 0;
        while attempts < required * 4 {
            attempts += 1;

            if depth_frames.len() < required {
                if let Some(frame) = depth_queue.wait_for_frame() {
                    depth_frames.push(frame);
                }
            }
            if !left_done {
                if let Some(frame) = left_queue.wait_for_frame() {
                    match left_dots.process(&frame) {
                        DetectStatus::Progress => self.progress.bump(2, 50),
                        DetectStatus::Done => {
                            self.progress.bump(2, 50);
                            left_done = true;
                        }
                        DetectStatus::NeedMoreFrames => {}
                    }
                }
            }
            if !color_done {
                if let Some(frame) = color_queue.wait_for_frame() {
                    match color_dots.process(&frame) {
                        DetectStatus::Progress => self.progress.bump(2, 50),
                        DetectStatus::Done => {
                            self.progress.bump(2, 50);
                            color_done = true;
                        }
                        DetectStatus::NeedMoreFrames => {}
                    }
                }
            }

            if left_done && color_done && depth_frames.len() >= required {
                break;
            }
        }

        if !(left_done && color_done) || depth_frames.len() < required {
            return Err(CalibrationError::InsufficientData(REPOSITION_MESSAGE.into()));
        }

        let left_centers = left_dots
            .centers()
            .ok_or_else(|| CalibrationError::InsufficientData(REPOSITION_MESSAGE.into()))?;
        let color_centers = color_dots
            .centers()
            .ok_or_else(|| CalibrationError::InsufficientData(REPOSITION_MESSAGE.into()))?;

        // Median depth at each dot across the harvested depth frames.
        let unit_mm = self.links.runtime.depth_unit_mm();
        let mut z = [0.0f32; 4];
        for (i, center) in left_centers.iter().enumerate() {
            let x = center[0].round() as u32;
            let y = center[1].round() as u32;
            let mut samples: Vec<u16> = depth_frames
                .iter()
                .map(|f| f.depth_at(x, y))
                .filter(|&v| v != 0)
                .collect();
            if samples.is_empty() {
                return Err(CalibrationError::InsufficientData(
                    "No valid depth at the target dots".into(),
                ));
            }
            samples.sort_unstable();
            z[i] = samples[samples.len() / 2] as f32 * unit_mm / 1000.0;
        }

        let left_intrin = self
            .links
            .runtime
            .intrinsics(active.primary)
            .ok_or(CalibrationError::UnsupportedDevice("left intrinsics"))?;
        let color_intrin = self
            .links
            .runtime
            .intrinsics(color_stream)
            .ok_or(CalibrationError::UnsupportedDevice("color intrinsics"))?;
        let extrin = self
            .links
            .runtime
            .extrinsics(active.primary, color_stream)
            .ok_or(CalibrationError::UnsupportedDevice("left-to-color extrinsics"))?;

        let mut points = [UvCorrespondence {
            left_pixel: [0.0; 2],
            left_z: 0.0,
            color_pixel: [0.0; 2],
        }; 4];
        for i in 0..4 {
            points[i] = UvCorrespondence {
                left_pixel: left_centers[i],
                left_z: z[i],
                color_pixel: color_centers[i],
            };
        }

        self.progress.enter(SessionState::HealthEvaluation);
        let calib = UvMappingCalib::new(points, left_intrin, color_intrin, extrin);
        let (accepted, report) = calib.calibrate();
        info!(
            "UV-mapping fit: err {:.2}px -> {:.2}px",
            report.err_before, report.err_after
        );
        session.uv_fit = Some(report);
        session.health_nums = Some([
            report.ppx - color_intrin.ppx,
            report.ppy - color_intrin.ppy,
            report.fx - color_intrin.fx,
            report.fy - color_intrin.fy,
        ]);
        if !accepted {
            return Err(CalibrationError::InsufficientData(
                "UV-mapping correction rejected: fitted parameters exceed the safety threshold"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Measure the target distance from its rectangle and persist it; no
    /// firmware calibration call.
    fn measure_ground_truth(
        &self,
        session: &mut CalibrationSession,
        active: &ActiveStreams,
    ) -> Result<()> {
        let intrinsics = self
            .links
            .runtime
            .intrinsics(active.primary)
            .ok_or(CalibrationError::UnsupportedDevice("infrared intrinsics"))?;
        let queue = self.links.runtime.frame_queue(active.primary);

        let mut detector = RectDetector::new();
        let step = (100 / RectDetector::FRAME_COUNT) as u32;
        let mut done = false;
        let mut attempts = 0;
        while attempts < RectDetector::FRAME_COUNT * 2 {
            attempts += 1;
            let Some(frame) = queue.wait_for_frame() else {
                continue;
            };
            match detector.process(&frame) {
                DetectStatus::NeedMoreFrames => {}
                DetectStatus::Progress => self.progress.bump(step, 99),
                DetectStatus::Done => {
                    self.progress.bump(step, 99);
                    done = true;
                    break;
                }
            }
        }
        if !done {
            return Err(CalibrationError::InsufficientData(REPOSITION_MESSAGE.into()));
        }

        let sides = detector
            .sides()
            .ok_or_else(|| CalibrationError::InsufficientData(REPOSITION_MESSAGE.into()))?;

        let target_fw = intrinsics.fx * session.target_width_mm;
        let target_fh = intrinsics.fy * session.target_height_mm;
        let distances = [
            target_fw / sides.top,
            target_fw / sides.bottom,
            target_fh / sides.left,
            target_fh / sides.right,
        ];
        if distances.iter().any(|&d| d <= 0.1) {
            return Err(CalibrationError::InsufficientData(
                "Bad target rectangle side sizes returned!".into(),
            ));
        }

        let ground_truth = distances.iter().sum::<f32>() / 4.0;
        session.ground_truth_mm = ground_truth;
        self.links.config.set_f32(keys::GROUND_TRUTH, ground_truth);
        info!("target Z distance calculated: {ground_truth:.1} mm");
        Ok(())
    }
}

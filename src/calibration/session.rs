//! Calibration session state: the action being run, its parameters, and
//! everything the run produces.

use crate::metrics::DepthMetrics;
use crate::stream::select::StreamPlan;
use crate::calibration::uvmap::UvFitReport;

/// Calibration workflow variant. Each action is a distinct path through
/// the orchestrator's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Firmware intrinsic self-calibration against a flat wall.
    OnChip,
    /// Firmware focal-length self-calibration.
    OnChipFocalLength,
    /// Combined intrinsic + focal-length calibration, two host-assisted
    /// phases.
    OnChipExtended,
    /// Calibration against a known ground-truth distance.
    Tare,
    /// Measure and persist the tare ground-truth distance from the target;
    /// no firmware calibration call.
    TareGroundTruth,
    /// Stand-alone focal-length calibration from dual-IR target imaging.
    FocalLength,
    /// Firmware UV-mapping calibration from left/depth/color triples.
    UvMappingFirmware,
    /// Host-side UV-mapping correction (closed-form fit, no firmware call).
    UvMappingHost,
}

impl Action {
    /// Streams the action needs while calibrating.
    pub fn stream_plan(self) -> StreamPlan {
        match self {
            Action::OnChip | Action::OnChipFocalLength | Action::OnChipExtended | Action::Tare => {
                StreamPlan::Depth
            }
            Action::TareGroundTruth => StreamPlan::Infrared,
            Action::FocalLength => StreamPlan::DualInfrared,
            Action::UvMappingFirmware | Action::UvMappingHost => StreamPlan::IrDepthAndColor,
        }
    }

    /// Whether the session layer retries this action automatically.
    pub fn auto_retries(self) -> bool {
        matches!(self, Action::OnChipFocalLength | Action::OnChipExtended)
    }

    /// Whether the flow captures before/after depth metrics and applies the
    /// new table when it finishes.
    pub fn captures_metrics(self) -> bool {
        !matches!(
            self,
            Action::TareGroundTruth | Action::UvMappingFirmware | Action::UvMappingHost
        )
    }

    /// Whether the flow streams the calibration target at 1280x720.
    pub fn uses_target_resolution(self) -> bool {
        matches!(
            self,
            Action::FocalLength
                | Action::TareGroundTruth
                | Action::UvMappingFirmware
                | Action::UvMappingHost
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::OnChip => write!(f, "On-Chip Calibration"),
            Action::OnChipFocalLength => write!(f, "On-Chip Focal Length Calibration"),
            Action::OnChipExtended => write!(f, "On-Chip Calibration Extended"),
            Action::Tare => write!(f, "Tare Calibration"),
            Action::TareGroundTruth => write!(f, "Tare Ground Truth"),
            Action::FocalLength => write!(f, "Focal Length Calibration"),
            Action::UvMappingFirmware => write!(f, "UV-Mapping Calibration"),
            Action::UvMappingHost => write!(f, "UV-Mapping Correction"),
        }
    }
}

/// Firmware-facing tuning parameters shared by the on-chip flows.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibParams {
    /// Scan speed 0..=4; controls the firmware frame budget.
    pub speed: i64,
    /// Focal-length profile index (0..=2); alternated by the auto-retry.
    pub speed_fl: i64,
    /// Frames averaged per tare step (1..=30).
    pub average_step_count: i64,
    /// Tare iteration steps (1..=30).
    pub step_count: i64,
    /// Subpixel accuracy level, 0 (very high) ..= 3 (low).
    pub accuracy: i64,
    /// Intrinsic (true) vs extrinsic (false) scan.
    pub intrinsic_scan: bool,
    /// Apply the high-accuracy preset during the run.
    pub apply_preset: bool,
    pub fl_step_count: i64,
    pub fy_scan_range: i64,
    pub keep_new_value_after_successful_scan: i64,
    pub fl_data_sampling: i64,
    pub adjust_both_sides: bool,
    pub fl_scan_location: i64,
    pub fy_scan_direction: i64,
    pub white_wall_mode: i64,
}

impl Default for CalibParams {
    fn default() -> Self {
        Self {
            speed: 3,
            speed_fl: 1,
            average_step_count: 20,
            step_count: 20,
            accuracy: 2,
            intrinsic_scan: true,
            apply_preset: true,
            fl_step_count: 51,
            fy_scan_range: 40,
            keep_new_value_after_successful_scan: 0,
            fl_data_sampling: 1,
            adjust_both_sides: false,
            fl_scan_location: 0,
            fy_scan_direction: 0,
            white_wall_mode: 0,
        }
    }
}

impl CalibParams {
    /// Firmware frame budget for the intrinsic scan at the configured
    /// speed.
    pub fn total_frames(&self) -> usize {
        match self.speed {
            0 => 60,
            1 => 120,
            4 => 120,
            _ => 256,
        }
    }

    /// Apply the focal-length profile selected by `speed_fl`.
    pub fn apply_speed_fl_profile(&mut self) {
        match self.speed_fl {
            0 => {
                self.speed = 1;
                self.fl_step_count = 41;
                self.fy_scan_range = 30;
                self.white_wall_mode = 0;
            }
            1 => {
                self.speed = 3;
                self.fl_step_count = 51;
                self.fy_scan_range = 40;
                self.white_wall_mode = 0;
            }
            _ => {
                self.speed = 4;
                self.fl_step_count = 41;
                self.fy_scan_range = 30;
                self.white_wall_mode = 1;
            }
        }
    }
}

/// One calibration run: inputs, live state and results. Created when the
/// user starts a calibration, owned by the worker, reset on restart.
#[derive(Clone)]
pub struct CalibrationSession {
    pub action: Action,
    /// Host gathers statistics and uploads them instead of the firmware
    /// sampling frames itself.
    pub host_assistance: bool,
    pub params: CalibParams,

    /// Target rectangle dimensions, millimeters.
    pub target_width_mm: f32,
    pub target_height_mm: f32,
    /// Tare ground-truth distance, millimeters.
    pub ground_truth_mm: f32,
    /// Weight of the alignment error in the corrected focal ratio.
    pub correction_factor: f32,
    /// Fit only px/py during UV-mapping (vs all four parameters).
    pub py_px_only: bool,

    /// Calibration table active before the run; owned by the session.
    pub old_table: Vec<u8>,
    /// Candidate table produced by the run.
    pub new_table: Vec<u8>,

    /// Primary health figure.
    pub health_1: Option<f32>,
    /// Secondary health figure (extended and tare flows).
    pub health_2: Option<f32>,
    /// UV-mapping health numbers (px, py, fx, fy).
    pub health_nums: Option<[f32; 4]>,

    /// Depth quality captured before/after applying the new table.
    pub metrics_before: Option<DepthMetrics>,
    pub metrics_after: Option<DepthMetrics>,

    /// Focal-length results.
    pub corrected_ratio: Option<f32>,
    pub tilt_angle: Option<f32>,

    /// Host-side UV-mapping fit.
    pub uv_fit: Option<UvFitReport>,

    /// Automatic retry bookkeeping (session-management layer).
    pub retry_count: u32,
    /// Set between retries: next attempt alternates the speed profile and
    /// uses the extended firmware timeout.
    pub toggle: bool,
}

impl CalibrationSession {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            host_assistance: false,
            params: CalibParams::default(),
            target_width_mm: 175.0,
            target_height_mm: 100.0,
            ground_truth_mm: 1200.0,
            correction_factor: 0.5,
            py_px_only: false,
            old_table: Vec::new(),
            new_table: Vec::new(),
            health_1: None,
            health_2: None,
            health_nums: None,
            metrics_before: None,
            metrics_after: None,
            corrected_ratio: None,
            tilt_angle: None,
            uv_fit: None,
            retry_count: 0,
            toggle: false,
        }
    }

    /// Clear per-attempt results, keeping inputs and retry bookkeeping.
    pub fn reset_results(&mut self) {
        self.old_table.clear();
        self.new_table.clear();
        self.health_1 = None;
        self.health_2 = None;
        self.health_nums = None;
        self.metrics_before = None;
        self.metrics_after = None;
        self.corrected_ratio = None;
        self.tilt_angle = None;
        self.uv_fit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_maps_to_frame_budget() {
        let mut params = CalibParams::default();
        for (speed, frames) in [(0, 60), (1, 120), (2, 256), (3, 256), (4, 120)] {
            params.speed = speed;
            assert_eq!(params.total_frames(), frames);
        }
    }

    #[test]
    fn speed_fl_profiles() {
        let mut params = CalibParams::default();
        params.speed_fl = 0;
        params.apply_speed_fl_profile();
        assert_eq!((params.speed, params.fl_step_count), (1, 41));
        params.speed_fl = 1;
        params.apply_speed_fl_profile();
        assert_eq!((params.speed, params.fl_step_count), (3, 51));
        params.speed_fl = 2;
        params.apply_speed_fl_profile();
        assert_eq!(params.white_wall_mode, 1);
    }

    #[test]
    fn plans_follow_actions() {
        use crate::stream::select::StreamPlan;
        assert_eq!(Action::OnChip.stream_plan(), StreamPlan::Depth);
        assert_eq!(Action::TareGroundTruth.stream_plan(), StreamPlan::Infrared);
        assert_eq!(Action::FocalLength.stream_plan(), StreamPlan::DualInfrared);
        assert_eq!(
            Action::UvMappingHost.stream_plan(),
            StreamPlan::IrDepthAndColor
        );
    }

    #[test]
    fn only_on_chip_focal_actions_auto_retry() {
        assert!(Action::OnChipFocalLength.auto_retries());
        assert!(Action::OnChipExtended.auto_retries());
        assert!(!Action::OnChip.auto_retries());
        assert!(!Action::Tare.auto_retries());
    }

    #[test]
    fn reset_keeps_inputs() {
        let mut session = CalibrationSession::new(Action::Tare);
        session.ground_truth_mm = 987.0;
        session.old_table = vec![1, 2, 3];
        session.health_1 = Some(0.2);
        session.reset_results();
        assert_eq!(session.ground_truth_mm, 987.0);
        assert!(session.old_table.is_empty());
        assert!(session.health_1.is_none());
    }
}

//! Firmware JSON payload builders.
//!
//! Key names and presence are part of the firmware contract and are
//! reproduced exactly, including the historical misspelling in
//! `"keep new value after sucessful scan"`.

use serde_json::{json, Map, Value};

use super::session::CalibParams;

fn flag(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

/// Intrinsic on-chip calibration document (calib type 0).
pub fn on_chip(params: &CalibParams, host_assistance: bool) -> String {
    json!({
        "calib type": 0,
        "host assistance": flag(host_assistance),
        "average step count": params.average_step_count,
        "scan parameter": flag(!params.intrinsic_scan),
        "step count": params.step_count,
        "apply preset": flag(params.apply_preset),
        "accuracy": params.accuracy,
        "scan only": 0,
        "interactive scan": 0,
    })
    .to_string()
}

/// On-chip focal-length calibration document (calib type 1).
pub fn on_chip_focal_length(params: &CalibParams, host_assistance: bool) -> String {
    json!({
        "calib type": 1,
        "host assistance": flag(host_assistance),
        "fl step count": params.fl_step_count,
        "fy scan range": params.fy_scan_range,
        "keep new value after sucessful scan": params.keep_new_value_after_successful_scan,
        "fl data sampling": params.fl_data_sampling,
        "adjust both sides": flag(params.adjust_both_sides),
        "fl scan location": params.fl_scan_location,
        "fy scan direction": params.fy_scan_direction,
        "white wall mode": params.white_wall_mode,
        "scan only": flag(host_assistance),
        "interactive scan": 0,
    })
    .to_string()
}

/// Extended (combined intrinsic + focal length) document, also used for
/// tare runs (calib type 2).
pub fn extended(params: &CalibParams, host_assistance: bool) -> String {
    json!({
        "calib type": 2,
        "host assistance": flag(host_assistance),
        "fl step count": params.fl_step_count,
        "fy scan range": params.fy_scan_range,
        "keep new value after sucessful scan": params.keep_new_value_after_successful_scan,
        "fl data sampling": params.fl_data_sampling,
        "adjust both sides": flag(params.adjust_both_sides),
        "fl scan location": params.fl_scan_location,
        "fy scan direction": params.fy_scan_direction,
        "white wall mode": params.white_wall_mode,
        "speed": params.speed,
        "average step count": params.average_step_count,
        "scan parameter": flag(!params.intrinsic_scan),
        "step count": params.step_count,
        "apply preset": flag(params.apply_preset),
        "accuracy": params.accuracy,
        "scan only": flag(host_assistance),
        "interactive scan": 0,
        "depth": 0,
    })
    .to_string()
}

/// Host-assisted statistics upload: the repaired fill-factor table keyed by
/// tick index (`"fill factor N"`), preceded by the tick count.
pub fn host_sampling(calib_type: i64, host_assistance: i64, fill_factor: &[u16]) -> String {
    let mut doc = Map::new();
    doc.insert("calib type".into(), Value::from(calib_type));
    doc.insert("host assistance".into(), Value::from(host_assistance));
    doc.insert("step count v3".into(), Value::from(fill_factor.len() as i64));
    for (tick, value) in fill_factor.iter().enumerate() {
        doc.insert(format!("fill factor {tick}"), Value::from(*value));
    }
    Value::Object(doc).to_string()
}

/// Incremental host-assisted tare step; `depth` is the ROI average ×10000,
/// or -1 for the final commit.
pub fn tare_depth(depth: i64) -> String {
    json!({ "depth": depth }).to_string()
}

//! Depth-quality metric: 31-frame bundles, noise-damping resampling and
//! median aggregation.

pub mod plane;

use std::time::Duration;

use log::debug;

use crate::acquire::{FrameFetcher, DEFAULT_FETCH_TIMEOUT};
use crate::camera::CameraIntrinsics;
use crate::error::Result;
use plane::{analyze_depth_frame, FrameQuality, RegionOfInterest};

/// Frames per bundle.
const BUNDLE_SIZE: usize = 31;
/// Maximum bundle resamples.
const MAX_BUNDLES: usize = 10;
/// A bundle is re-sampled while its RMS-of-RMS keeps shrinking below this
/// ratio of the previous bundle...
const IMPROVEMENT_RATIO: f32 = 0.8;
/// ...and stays above this floor (percent).
const RMS_FLOOR: f32 = 10.0;

/// Aggregated depth-quality figures: (fill rate %, plane-fit RMS %).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthMetrics {
    pub fill_rate: f32,
    pub rms_percent: f32,
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

/// Fold per-frame quality samples into median fill-rate and RMS figures.
///
/// Bundles of 31 samples are drawn; a bundle is re-drawn (up to 10 times)
/// while its RMS-of-RMS keeps shrinking below 80% of the previous bundle's
/// and stays above the 10% floor, damping transient noise right after a
/// stream start or calibration write.
pub fn collect_depth_metrics(
    mut sample: impl FnMut() -> Result<FrameQuality>,
) -> Result<DepthMetrics> {
    let mut fill_rates: Vec<f32> = Vec::new();
    let mut rmses: Vec<f32> = Vec::new();

    let mut rms_std = 1000.0f32;
    let mut bundles = 0;
    loop {
        let mut bundle_rmses: Vec<f32> = Vec::with_capacity(BUNDLE_SIZE);
        for _ in 0..BUNDLE_SIZE {
            let quality = sample()?;
            fill_rates.push(quality.fill_rate);
            if let Some(rms) = quality.rms_percent {
                bundle_rmses.push(rms);
            }
        }

        let new_rms_std = if bundle_rmses.is_empty() {
            0.0
        } else {
            (bundle_rmses.iter().map(|r| r * r).sum::<f32>() / bundle_rmses.len() as f32).sqrt()
        };
        rmses.extend_from_slice(&bundle_rmses);
        bundles += 1;
        debug!("depth metric bundle {bundles}: rms-of-rms {new_rms_std:.3}");

        let improving = new_rms_std < rms_std * IMPROVEMENT_RATIO && new_rms_std > RMS_FLOOR;
        rms_std = new_rms_std;
        if !improving || bundles >= MAX_BUNDLES {
            break;
        }
    }

    Ok(DepthMetrics {
        fill_rate: median(&mut fill_rates),
        rms_percent: median(&mut rmses),
    })
}

/// Capture live frames through the acquisition adapter and aggregate them.
pub fn get_depth_metrics(
    fetcher: &FrameFetcher,
    intrinsics: &CameraIntrinsics,
    depth_unit_mm: f32,
    fetch_timeout: Option<Duration>,
) -> Result<DepthMetrics> {
    let timeout = fetch_timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT);
    collect_depth_metrics(|| {
        let frame = fetcher.fetch_depth_frame(timeout)?;
        let roi = RegionOfInterest::center_box(frame.width, frame.height);
        Ok(analyze_depth_frame(&frame, intrinsics, depth_unit_mm, roi))
    })
}

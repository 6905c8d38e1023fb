//! Per-frame depth-quality analysis: ROI extraction, plane fitting, fill
//! rate and plane-fit RMS.

use glam::Vec3;

use crate::camera::CameraIntrinsics;
use crate::stream::frames::VideoFrame;

/// Pixel-space region of interest, half-open on the max side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOfInterest {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl RegionOfInterest {
    /// Central 10% box used by the depth-quality metric.
    pub fn center_box(width: u32, height: u32) -> Self {
        Self {
            min_x: (width as f32 * 0.45) as u32,
            min_y: (height as f32 * 0.45) as u32,
            max_x: (width as f32 * 0.55) as u32,
            max_y: (height as f32 * 0.55) as u32,
        }
    }

    pub fn area(&self) -> u32 {
        (self.max_x - self.min_x) * (self.max_y - self.min_y)
    }
}

/// Plane `ax + by + cz + d = 0` with unit normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
}

impl Plane {
    pub fn distance(&self, point: Vec3) -> f32 {
        self.a * point.x + self.b * point.y + self.c * point.z + self.d
    }
}

/// Least-squares plane through a point cloud via the covariance method.
/// Returns `None` for fewer than three points or a degenerate spread.
pub fn plane_from_points(points: &[Vec3]) -> Option<Plane> {
    if points.len() < 3 {
        return None;
    }

    let mut centroid = Vec3::ZERO;
    for p in points {
        centroid += *p;
    }
    centroid /= points.len() as f32;

    let (mut xx, mut xy, mut xz) = (0.0f32, 0.0f32, 0.0f32);
    let (mut yy, mut yz, mut zz) = (0.0f32, 0.0f32, 0.0f32);
    for p in points {
        let r = *p - centroid;
        xx += r.x * r.x;
        xy += r.x * r.y;
        xz += r.x * r.z;
        yy += r.y * r.y;
        yz += r.y * r.z;
        zz += r.z * r.z;
    }

    let det_x = yy * zz - yz * yz;
    let det_y = xx * zz - xz * xz;
    let det_z = xx * yy - xy * xy;
    let det_max = det_x.max(det_y).max(det_z);
    if det_max <= 0.0 {
        return None;
    }

    let dir = if det_max == det_x {
        Vec3::new(det_x, xz * yz - xy * zz, xy * yz - xz * yy)
    } else if det_max == det_y {
        Vec3::new(xz * yz - xy * zz, det_y, xy * xz - yz * xx)
    } else {
        Vec3::new(xy * yz - xz * yy, xy * xz - yz * xx, det_z)
    };

    let normal = dir.normalize();
    Some(Plane {
        a: normal.x,
        b: normal.y,
        c: normal.z,
        d: -normal.dot(centroid),
    })
}

/// One frame's contribution to the depth-quality metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameQuality {
    /// Percentage of ROI pixels with valid depth.
    pub fill_rate: f32,
    /// Plane-fit RMS as a percentage of the nominal distance, when a plane
    /// could be fitted.
    pub rms_percent: Option<f32>,
}

/// Fraction of points trimmed from each end of the depth-sorted cloud.
const OUTLIER_FRACTION: usize = 50; // 2%

/// Analyze one Z16 frame: deproject valid ROI pixels, fit a plane, trim
/// depth outliers, report fill rate and RMS%.
pub fn analyze_depth_frame(
    frame: &VideoFrame,
    intrinsics: &CameraIntrinsics,
    depth_unit_mm: f32,
    roi: RegionOfInterest,
) -> FrameQuality {
    let mut points = Vec::with_capacity(roi.area() as usize);
    for y in roi.min_y..roi.max_y {
        for x in roi.min_x..roi.max_x {
            let raw = frame.depth_at(x, y);
            if raw != 0 {
                let depth_m = raw as f32 * depth_unit_mm / 1000.0;
                points.push(intrinsics.deproject([x as f32, y as f32], depth_m));
            }
        }
    }

    let fill_rate = points.len() as f32 / roi.area() as f32 * 100.0;

    // Trim 2% of points at each end by depth before fitting error stats.
    points.sort_by(|a, b| a.z.total_cmp(&b.z));
    let outliers = points.len() / OUTLIER_FRACTION;
    let trimmed = &points[outliers..points.len() - outliers];

    let Some(plane) = plane_from_points(trimmed) else {
        return FrameQuality {
            fill_rate,
            rms_percent: None,
        };
    };

    let distance_mm = plane.d.abs() * 1000.0;
    if distance_mm <= f32::EPSILON {
        return FrameQuality {
            fill_rate,
            rms_percent: None,
        };
    }

    let sum_sq: f64 = trimmed
        .iter()
        .map(|p| {
            let mm = (plane.distance(*p) * 1000.0) as f64;
            mm * mm
        })
        .sum();
    let rms_mm = (sum_sq / trimmed.len() as f64).sqrt() as f32;

    FrameQuality {
        fill_rate,
        rms_percent: Some(100.0 * rms_mm / distance_mm),
    }
}

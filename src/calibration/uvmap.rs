//! Host-side UV-mapping correction.
//!
//! Fits a per-axis scale + offset over four depth-to-color correspondences,
//! replacing the color sensor's fx/fy/ppx/ppy so that depth-derived points
//! reproject onto their detected color pixels.

use crate::camera::{CameraIntrinsics, Extrinsics};

/// Maximum accepted change of any fitted intrinsic parameter, pixels.
/// Larger corrections indicate a bad sample and are rejected.
const MAX_CHANGE: f32 = 16.0;

/// Degeneracy guard on the per-axis normalization denominator.
const MIN_DENOMINATOR: f64 = 0.01;

/// One left-pixel / depth / color-pixel correspondence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvCorrespondence {
    pub left_pixel: [f32; 2],
    /// Depth at the left pixel, meters.
    pub left_z: f32,
    pub color_pixel: [f32; 2],
}

/// Result of a UV-mapping fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvFitReport {
    /// Mean reprojection error with the current color intrinsics, pixels.
    pub err_before: f32,
    /// Mean reprojection error with the fitted parameters, pixels.
    pub err_after: f32,
    pub ppx: f32,
    pub ppy: f32,
    pub fx: f32,
    pub fy: f32,
}

/// Immutable four-point calibration problem, consumed once.
pub struct UvMappingCalib {
    points: [UvCorrespondence; 4],
    left_intrin: CameraIntrinsics,
    color_intrin: CameraIntrinsics,
    extrin: Extrinsics,
}

impl UvMappingCalib {
    pub fn new(
        points: [UvCorrespondence; 4],
        left_intrin: CameraIntrinsics,
        color_intrin: CameraIntrinsics,
        extrin: Extrinsics,
    ) -> Self {
        Self {
            points,
            left_intrin,
            color_intrin,
            extrin,
        }
    }

    /// Solve the per-axis least-squares correction.
    ///
    /// Returns `(accepted, report)`: the fit is accepted only when every
    /// fitted parameter stays within [`MAX_CHANGE`] of the current color
    /// intrinsics. A degenerate axis keeps its prior parameters instead of
    /// failing the whole calibration.
    pub fn calibrate(&self) -> (bool, UvFitReport) {
        let mut norm = [[0.0f32; 2]; 4];
        let mut projected = [[0.0f32; 2]; 4];

        for (i, c) in self.points.iter().enumerate() {
            let left_point = self.left_intrin.deproject(c.left_pixel, c.left_z);
            let color_point = self.extrin.transform(left_point);
            let n = CameraIntrinsics::normalize(color_point);
            norm[i] = n;
            projected[i] = [
                n[0] * self.color_intrin.fx + self.color_intrin.ppx,
                n[1] * self.color_intrin.fy + self.color_intrin.ppy,
            ];
        }

        let err_before = self
            .points
            .iter()
            .zip(projected.iter())
            .map(|(c, p)| {
                let dx = p[0] - c.color_pixel[0];
                let dy = p[1] - c.color_pixel[1];
                (dx * dx + dy * dy).sqrt()
            })
            .sum::<f32>()
            / 4.0;

        // Closed-form line fit per axis: observed = scale * normalized + offset.
        let mut x = 0.0f64;
        let mut y = 0.0f64;
        let mut c_x = 0.0f64;
        let mut c_y = 0.0f64;
        let mut x_2 = 0.0f64;
        let mut y_2 = 0.0f64;
        let mut c_xc = 0.0f64;
        let mut c_yc = 0.0f64;
        for (n, c) in norm.iter().zip(self.points.iter()) {
            x += n[0] as f64;
            y += n[1] as f64;
            c_x += c.color_pixel[0] as f64;
            c_y += c.color_pixel[1] as f64;
            x_2 += (n[0] as f64) * (n[0] as f64);
            y_2 += (n[1] as f64) * (n[1] as f64);
            c_xc += (c.color_pixel[0] as f64) * (n[0] as f64);
            c_yc += (c.color_pixel[1] as f64) * (n[1] as f64);
        }

        let mut fx = self.color_intrin.fx;
        let mut ppx = self.color_intrin.ppx;
        let d_x = 4.0 * x_2 - x * x;
        if d_x > MIN_DENOMINATOR {
            let inv = 1.0 / d_x;
            fx = (inv * (4.0 * c_xc - x * c_x)) as f32;
            ppx = (inv * (x_2 * c_x - x * c_xc)) as f32;
        }

        let mut fy = self.color_intrin.fy;
        let mut ppy = self.color_intrin.ppy;
        let d_y = 4.0 * y_2 - y * y;
        if d_y > MIN_DENOMINATOR {
            let inv = 1.0 / d_y;
            fy = (inv * (4.0 * c_yc - y * c_y)) as f32;
            ppy = (inv * (y_2 * c_y - y * c_yc)) as f32;
        }

        let err_after = norm
            .iter()
            .zip(self.points.iter())
            .map(|(n, c)| {
                let dx = n[0] * fx + ppx - c.color_pixel[0];
                let dy = n[1] * fy + ppy - c.color_pixel[1];
                (dx * dx + dy * dy).sqrt()
            })
            .sum::<f32>()
            / 4.0;

        let accepted = (self.color_intrin.ppx - ppx).abs() < MAX_CHANGE
            && (self.color_intrin.ppy - ppy).abs() < MAX_CHANGE
            && (self.color_intrin.fx - fx).abs() < MAX_CHANGE
            && (self.color_intrin.fy - fy).abs() < MAX_CHANGE;

        (
            accepted,
            UvFitReport {
                err_before,
                err_after,
                ppx,
                ppy,
                fx,
                fy,
            },
        )
    }
}

//! Camera geometry primitives: pinhole intrinsics and sensor-to-sensor
//! extrinsics.
//!
//! Distortion is not modelled here; infrared frames are treated as
//! rectified and color frames are undistorted before detection.

use glam::{Mat3, Vec3};
use serde::{Deserialize, Serialize};

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Focal length x (pixels).
    pub fx: f32,
    /// Focal length y (pixels).
    pub fy: f32,
    /// Principal point x (pixels).
    pub ppx: f32,
    /// Principal point y (pixels).
    pub ppy: f32,
}

impl CameraIntrinsics {
    /// Deproject a pixel with a known depth (same unit as `depth`) to a 3D
    /// point in the camera frame.
    pub fn deproject(&self, pixel: [f32; 2], depth: f32) -> Vec3 {
        let x = (pixel[0] - self.ppx) / self.fx;
        let y = (pixel[1] - self.ppy) / self.fy;
        Vec3::new(depth * x, depth * y, depth)
    }

    /// Project a camera-frame point to pixel coordinates. Returns `None`
    /// for points at or behind the image plane.
    pub fn project(&self, point: Vec3) -> Option<[f32; 2]> {
        if point.z <= 0.0 {
            return None;
        }
        let x = point.x / point.z;
        let y = point.y / point.z;
        Some([x * self.fx + self.ppx, y * self.fy + self.ppy])
    }

    /// Normalized image-plane coordinates of a camera-frame point.
    pub fn normalize(point: Vec3) -> [f32; 2] {
        [point.x / point.z, point.y / point.z]
    }
}

/// Rigid transform from one sensor's frame to another's.
///
/// `rotation` is column-major, matching the device calibration layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    pub rotation: [f32; 9],
    pub translation: [f32; 3],
}

impl Extrinsics {
    pub const IDENTITY: Extrinsics = Extrinsics {
        rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        translation: [0.0, 0.0, 0.0],
    };

    /// Transform a point from the source sensor frame to the target frame.
    pub fn transform(&self, point: Vec3) -> Vec3 {
        let rot = Mat3::from_cols_array(&self.rotation);
        rot * point + Vec3::from_array(self.translation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            width: 1280,
            height: 720,
            fx: 640.0,
            fy: 640.0,
            ppx: 640.0,
            ppy: 360.0,
        }
    }

    #[test]
    fn project_deproject_round_trip() {
        let intr = intrinsics();
        let point = intr.deproject([700.0, 400.0], 1.5);
        let pixel = intr.project(point).unwrap();
        assert!((pixel[0] - 700.0).abs() < 1e-4);
        assert!((pixel[1] - 400.0).abs() < 1e-4);
    }

    #[test]
    fn behind_plane_does_not_project() {
        let intr = intrinsics();
        assert!(intr.project(Vec3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn identity_extrinsics_keep_points() {
        let p = Vec3::new(0.1, -0.2, 1.0);
        assert_eq!(Extrinsics::IDENTITY.transform(p), p);
    }

    #[test]
    fn translation_applies_after_rotation() {
        let ext = Extrinsics {
            rotation: Extrinsics::IDENTITY.rotation,
            translation: [0.05, 0.0, 0.0],
        };
        let p = ext.transform(Vec3::new(0.0, 0.0, 1.0));
        assert!((p.x - 0.05).abs() < 1e-6);
        assert!((p.z - 1.0).abs() < 1e-6);
    }
}

//! Pinhole camera model built from a calibration matrix K.

use nalgebra::{Matrix3, Point2, Vector2, Vector3};

/// Undistorted pinhole intrinsics. Immutable for a run and cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Read fx, fy, cx, cy out of a 3x3 K matrix (skew is ignored).
    pub fn from_k(k: &Matrix3<f64>) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Mean focal length, used to turn pixel thresholds into normalized ones.
    pub fn focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }

    /// Pixel to normalized image coordinates (`K⁻¹ [u v 1]ᵀ`, dropped z).
    pub fn normalize(&self, pixel: &Point2<f64>) -> Vector2<f64> {
        Vector2::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
        )
    }

    /// Project a point given in the camera frame. `None` behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Point2<f64>> {
        if p_cam.z <= f64::EPSILON {
            return None;
        }
        Some(Point2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }
}

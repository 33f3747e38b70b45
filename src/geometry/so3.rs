//! SO(3) helpers used by the pose and point refinement problems.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Below this angle the closed forms are replaced by their series expansion.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Rotation from an axis-angle vector (exponential map).
pub fn exp(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Axis-angle vector of a rotation (logarithm map).
pub fn log(rotation: &UnitQuaternion<f64>) -> Vector3<f64> {
    rotation.scaled_axis()
}

/// Right Jacobian `Jr(φ)` of SO(3):
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// so that `exp(φ + δ) ≈ exp(φ) exp(Jr(φ) δ)`.
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;
    let skew_phi = skew(phi);

    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / theta_cu) * (skew_phi * skew_phi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let phi = Vector3::new(0.2, -0.4, 0.1);
        assert_relative_eq!(log(&exp(&phi)), phi, epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_first_order() {
        let phi = Vector3::new(0.3, 0.1, -0.2);
        let delta = Vector3::new(1e-6, -2e-6, 1.5e-6);

        let lhs = exp(&(phi + delta));
        let rhs = exp(&phi) * exp(&(right_jacobian(&phi) * delta));

        assert!(lhs.angle_to(&rhs) < 1e-10);
    }

    #[test]
    fn test_right_jacobian_identity_at_zero() {
        assert_relative_eq!(
            right_jacobian(&Vector3::zeros()),
            Matrix3::identity(),
            epsilon = 1e-12
        );
    }
}

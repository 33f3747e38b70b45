//! Rigid-body transforms.
//!
//! Poses are stored camera-to-world (`T_wc`): `transform_point` maps a point
//! expressed in the camera frame into the world frame. The world frame is the
//! first bootstrap camera.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// Rigid transform with an always-orthonormal rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a 3x3 block and a translation.
    ///
    /// The block does not have to be orthonormal: it is projected onto SO(3)
    /// first, which removes numerical drift accumulated by linear solvers.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(&orthonormalize(&rotation));
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a homogeneous 4x4 matrix.
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let rotation = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = mat.fixed_view::<3, 1>(0, 3).into_owned();
        Self::from_rt(rotation, translation)
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self * other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Camera center in the world frame (for a `T_wc` pose).
    pub fn center(&self) -> Vector3<f64> {
        self.translation
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        self.rotation
            .to_homogeneous()
            .append_translation(&self.translation)
    }

    /// `[R | t]` of this transform as a 3x4 matrix.
    pub fn to_matrix3x4(&self) -> Matrix3x4<f64> {
        let r = self.rotation_matrix();
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Angle of the relative rotation to `other`, in radians.
    pub fn rotation_angle_to(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// Closest rotation (Frobenius norm) to an arbitrary 3x3 matrix.
pub fn orthonormalize(m: &Matrix3<f64>) -> Rotation3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Rotation3::identity();
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    Rotation3::from_matrix_unchecked(r)
}

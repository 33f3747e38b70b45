//! Two-view triangulation, cheirality checks and point refinement.
//!
//! Poses passed in are camera-to-world (`T_wc`), like everywhere else in the
//! crate. Image measurements are either normalized coordinates or pixels,
//! depending on the function.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Matrix4, Owned, Point2, RowVector4, Vector2, Vector3};

use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

/// Homogeneous coordinates with |w| below this are points at infinity.
const MIN_HOMOGENEOUS_W: f64 = 1e-12;

/// A triangulated point with the quantities needed to accept or reject it.
#[derive(Debug, Clone, Copy)]
pub struct Triangulated {
    /// Position in the world frame.
    pub position: Vector3<f64>,
    /// Depth (camera z) in the first view.
    pub depth_a: f64,
    /// Depth (camera z) in the second view.
    pub depth_b: f64,
    /// Angle between the two viewing rays at the point, in radians.
    pub parallax: f64,
}

impl Triangulated {
    /// Positive depth in both views and not farther than `max_depth`.
    pub fn has_valid_depth(&self, max_depth: f64) -> bool {
        self.depth_a > 0.0
            && self.depth_b > 0.0
            && self.depth_a < max_depth
            && self.depth_b < max_depth
    }
}

/// Linear (DLT) triangulation from normalized image coordinates.
///
/// Each view contributes two rows `x·P₃ − P₁`, `y·P₃ − P₂` with
/// `P = [R_cw | t_cw]`; the solution is the right singular vector of the
/// smallest singular value.
pub fn triangulate_linear(
    xa: &Vector2<f64>,
    xb: &Vector2<f64>,
    pose_a: &SE3,
    pose_b: &SE3,
) -> Option<Vector3<f64>> {
    let pa = pose_a.inverse().to_matrix3x4();
    let pb = pose_b.inverse().to_matrix3x4();

    let row = |p: &nalgebra::Matrix3x4<f64>, i: usize| -> RowVector4<f64> { p.row(i).into_owned() };
    let design = Matrix4::from_rows(&[
        xa.x * row(&pa, 2) - row(&pa, 0),
        xa.y * row(&pa, 2) - row(&pa, 1),
        xb.x * row(&pb, 2) - row(&pb, 0),
        xb.y * row(&pb, 2) - row(&pb, 1),
    ]);

    let svd = design.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(3);
    if h[3].abs() < MIN_HOMOGENEOUS_W {
        return None;
    }
    let p = Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);
    p.iter().all(|v| v.is_finite()).then_some(p)
}

/// Triangulate a pixel correspondence and report depths and parallax.
pub fn triangulate_pixels(
    camera: &CameraModel,
    pose_a: &SE3,
    pixel_a: &Point2<f64>,
    pose_b: &SE3,
    pixel_b: &Point2<f64>,
) -> Option<Triangulated> {
    let position = triangulate_linear(
        &camera.normalize(pixel_a),
        &camera.normalize(pixel_b),
        pose_a,
        pose_b,
    )?;
    Some(describe(position, pose_a, pose_b))
}

/// Depths and parallax of a known point seen from two poses.
pub fn describe(position: Vector3<f64>, pose_a: &SE3, pose_b: &SE3) -> Triangulated {
    Triangulated {
        position,
        depth_a: depth(pose_a, &position),
        depth_b: depth(pose_b, &position),
        parallax: bearing_angle(&position, &pose_a.center(), &pose_b.center()),
    }
}

/// Depth of a world point along the optical axis of a `T_wc` pose.
pub fn depth(pose: &SE3, point: &Vector3<f64>) -> f64 {
    pose.inverse().transform_point(point).z
}

/// Angle at `point` between the rays towards two camera centers, in radians.
pub fn bearing_angle(point: &Vector3<f64>, center_a: &Vector3<f64>, center_b: &Vector3<f64>) -> f64 {
    let ray_a = center_a - point;
    let ray_b = center_b - point;
    let denom = ray_a.norm() * ray_b.norm();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (ray_a.dot(&ray_b) / denom).clamp(-1.0, 1.0).acos()
}

/// Reprojection error in pixels, `None` when the point is behind the camera.
pub fn reprojection_error(
    camera: &CameraModel,
    pose: &SE3,
    point: &Vector3<f64>,
    pixel: &Point2<f64>,
) -> Option<f64> {
    let projected = camera.project(&pose.inverse().transform_point(point))?;
    Some((projected - pixel).norm())
}

/// Whether `point` lies in `(0, max_depth)` along every view's optical axis
/// and reprojects within `max_error_px` of every observation.
pub fn is_consistent(
    camera: &CameraModel,
    observations: &[(SE3, Point2<f64>)],
    point: &Vector3<f64>,
    max_depth: f64,
    max_error_px: f64,
) -> bool {
    observations.iter().all(|(pose, pixel)| {
        let z = depth(pose, point);
        z > 0.0
            && z < max_depth
            && reprojection_error(camera, pose, point, pixel).is_some_and(|e| e <= max_error_px)
    })
}

/// Minimize the reprojection error of one point over several views.
///
/// Falls back to `initial` if the optimizer fails or does not improve the
/// cost.
pub fn refine_point(
    camera: &CameraModel,
    observations: &[(SE3, Point2<f64>)],
    initial: Vector3<f64>,
    max_evaluations: usize,
) -> Vector3<f64> {
    if observations.len() < 2 {
        return initial;
    }
    let problem = PointProblem {
        camera: *camera,
        views: observations
            .iter()
            .map(|(pose, pixel)| (pose.inverse(), *pixel))
            .collect(),
        point: initial,
    };
    let Some(initial_cost) = problem.cost() else {
        return initial;
    };

    let (solved, report) = LevenbergMarquardt::new()
        .with_patience(max_evaluations)
        .minimize(problem);

    match solved.cost() {
        Some(cost) if report.termination.was_successful() && cost <= initial_cost => solved.point,
        _ => initial,
    }
}

/// Reprojection residuals of a single point against fixed cameras.
struct PointProblem {
    camera: CameraModel,
    /// World-to-camera transforms with the observed pixel.
    views: Vec<(SE3, Point2<f64>)>,
    point: Vector3<f64>,
}

impl PointProblem {
    fn cost(&self) -> Option<f64> {
        self.residuals().map(|r| 0.5 * r.norm_squared())
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PointProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.point = Vector3::new(params[0], params[1], params[2]);
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_column_slice(self.point.as_slice())
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(2 * self.views.len());
        for (i, (t_cw, pixel)) in self.views.iter().enumerate() {
            let projected = self.camera.project(&t_cw.transform_point(&self.point))?;
            r[2 * i] = projected.x - pixel.x;
            r[2 * i + 1] = projected.y - pixel.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut j = DMatrix::zeros(2 * self.views.len(), 3);
        for (i, (t_cw, _)) in self.views.iter().enumerate() {
            let pc = t_cw.transform_point(&self.point);
            if pc.z <= f64::EPSILON {
                return None;
            }
            let inv_z = 1.0 / pc.z;
            let inv_z2 = inv_z * inv_z;
            let r = t_cw.rotation_matrix();
            let du = Vector3::new(self.camera.fx * inv_z, 0.0, -self.camera.fx * pc.x * inv_z2);
            let dv = Vector3::new(0.0, self.camera.fy * inv_z, -self.camera.fy * pc.y * inv_z2);
            j.row_mut(2 * i).copy_from(&(du.transpose() * r));
            j.row_mut(2 * i + 1).copy_from(&(dv.transpose() * r));
        }
        Some(j)
    }
}

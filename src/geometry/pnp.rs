//! Perspective-n-Point: linear DLT inside RANSAC, refined with
//! Levenberg–Marquardt.
//!
//! Inputs are world points and the pixels they were observed at; the
//! returned pose is camera-to-world (`T_wc`).

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Matrix3x4, Matrix4, Owned, Point2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{VoError, VoResult};
use crate::geometry::ransac::{adaptive_iterations, sample_indices, Consensus, RansacConfig};
use crate::geometry::se3::orthonormalize;
use crate::geometry::{so3, SE3};
use crate::tracking::frame::CameraModel;

/// Minimal sample of the linear solver.
pub const DLT_SAMPLE: usize = 6;

/// Depth floor used while evaluating residuals, so points pushed behind the
/// camera by a trial step produce large errors instead of NaN.
const MIN_DEPTH: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PnpConfig {
    pub ransac: RansacConfig,
    /// Correspondences required before attempting a solve.
    pub min_correspondences: usize,
    /// Inliers required for the pose to be accepted.
    pub min_inliers: usize,
    /// Smallest-to-largest eigenvalue ratio of the point covariance below
    /// which the structure is treated as planar.
    pub planarity_threshold: f64,
    pub refine: bool,
    pub max_refine_evaluations: usize,
}

impl Default for PnpConfig {
    fn default() -> Self {
        Self {
            ransac: RansacConfig {
                max_iterations: 300,
                threshold_px: 4.0,
                ..RansacConfig::default()
            },
            min_correspondences: DLT_SAMPLE,
            min_inliers: 10,
            planarity_threshold: 1e-4,
            refine: true,
            max_refine_evaluations: 100,
        }
    }
}

/// Output of [`solve_pnp_ransac`].
#[derive(Debug, Clone)]
pub struct PnpSolution {
    /// Camera pose (`T_wc`).
    pub pose: SE3,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    /// Mean reprojection error over inliers, in pixels.
    pub mean_reprojection_error: f64,
}

/// Ratio of the smallest to the largest eigenvalue of the point covariance.
pub fn planarity(points: &[Vector3<f64>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let cov = points
        .iter()
        .fold(Matrix3::zeros(), |acc, p| {
            let d = p - mean;
            acc + d * d.transpose()
        })
        / n;
    let eig = cov.symmetric_eigenvalues();
    let max = eig.max();
    if max <= f64::EPSILON {
        return 0.0;
    }
    eig.min().max(0.0) / max
}

/// Linear PnP on all given correspondences.
pub fn dlt(points: &[Vector3<f64>], pixels: &[Point2<f64>], camera: &CameraModel) -> VoResult<SE3> {
    let n = points.len().min(pixels.len());
    if n < DLT_SAMPLE {
        return Err(VoError::InsufficientMatches {
            stage: "pnp",
            found: n,
            required: DLT_SAMPLE,
        });
    }

    // Condition the 3D points: centroid at the origin, mean distance √3.
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n as f64;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n as f64;
    if mean_dist <= f64::EPSILON {
        return Err(VoError::degenerate("pnp points collapse to a single location"));
    }
    let scale = 3f64.sqrt() / mean_dist;
    let mut conditioning = Matrix4::identity() * scale;
    conditioning[(3, 3)] = 1.0;
    conditioning
        .fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&(-scale * centroid));

    let rows = (2 * n).max(12);
    let mut a = DMatrix::<f64>::zeros(rows, 12);
    for (i, (p, px)) in points.iter().zip(pixels).enumerate() {
        let x = (p - centroid) * scale;
        let m = camera.normalize(px);
        let (r0, r1) = (2 * i, 2 * i + 1);
        for k in 0..3 {
            a[(r0, k)] = x[k];
            a[(r1, 4 + k)] = x[k];
            a[(r0, 8 + k)] = -m.x * x[k];
            a[(r1, 8 + k)] = -m.y * x[k];
        }
        a[(r0, 3)] = 1.0;
        a[(r1, 7)] = 1.0;
        a[(r0, 11)] = -m.x;
        a[(r1, 11)] = -m.y;
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| VoError::degenerate("pnp SVD failed"))?;
    let p = v_t.row(v_t.nrows() - 1);
    let conditioned = Matrix3x4::from_row_slice(&p.iter().copied().collect::<Vec<_>>());
    let mut projection = conditioned * conditioning;

    let mut m = projection.fixed_view::<3, 3>(0, 0).into_owned();
    if m.determinant() < 0.0 {
        projection = -projection;
        m = -m;
    }
    let rotation = orthonormalize(&m);
    // Scale of the homogeneous solution: mean singular value of M.
    let s = (rotation.matrix().transpose() * m).trace() / 3.0;
    if !s.is_finite() || s.abs() <= f64::EPSILON {
        return Err(VoError::degenerate("pnp DLT has no scale"));
    }
    let translation = projection.column(3) / s;

    let t_cw = SE3::from_rt(rotation.into_inner(), translation);
    Ok(t_cw.inverse())
}

/// Reprojection error of each correspondence for a `T_wc` pose.
/// Points behind the camera get `f64::INFINITY`.
pub fn reprojection_errors(
    pose: &SE3,
    points: &[Vector3<f64>],
    pixels: &[Point2<f64>],
    camera: &CameraModel,
) -> Vec<f64> {
    let t_cw = pose.inverse();
    points
        .iter()
        .zip(pixels)
        .map(|(p, px)| {
            camera
                .project(&t_cw.transform_point(p))
                .map_or(f64::INFINITY, |proj| (proj - px).norm())
        })
        .collect()
}

fn score(errors: &[f64], threshold: f64) -> (Vec<bool>, f64) {
    let inliers: Vec<bool> = errors.iter().map(|&e| e < threshold).collect();
    let cost = errors.iter().filter(|&&e| e < threshold).map(|e| e * e).sum();
    (inliers, cost)
}

fn select<T: Copy>(values: &[T], mask: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(mask)
        .filter_map(|(v, &keep)| keep.then_some(*v))
        .collect()
}

/// Robust PnP.
///
/// Fails with `InsufficientMatches` below `min_correspondences` and with
/// `DegenerateGeometry` for planar structure or too few inliers.
pub fn solve_pnp_ransac(
    points: &[Vector3<f64>],
    pixels: &[Point2<f64>],
    camera: &CameraModel,
    config: &PnpConfig,
) -> VoResult<PnpSolution> {
    let n = points.len().min(pixels.len());
    let required = config.min_correspondences.max(DLT_SAMPLE);
    if n < required {
        return Err(VoError::InsufficientMatches {
            stage: "pnp",
            found: n,
            required,
        });
    }
    if planarity(points) < config.planarity_threshold {
        return Err(VoError::degenerate("pnp points are coplanar"));
    }

    let threshold = config.ransac.threshold_px;
    let mut rng = config.ransac.rng();
    let mut best: Option<Consensus<SE3>> = None;
    let mut iteration_limit = config.ransac.max_iterations;
    let mut iteration = 0;

    while iteration < iteration_limit {
        iteration += 1;
        let sample = sample_indices(&mut rng, n, DLT_SAMPLE);
        let sample_points: Vec<_> = sample.iter().map(|&i| points[i]).collect();
        if planarity(&sample_points) < config.planarity_threshold {
            continue;
        }
        let sample_pixels: Vec<_> = sample.iter().map(|&i| pixels[i]).collect();
        let Ok(pose) = dlt(&sample_points, &sample_pixels, camera) else {
            continue;
        };
        let (inliers, cost) = score(&reprojection_errors(&pose, points, pixels, camera), threshold);
        if Consensus::offer(&mut best, pose, inliers, cost) {
            if let Some(b) = &best {
                let ratio = b.num_inliers as f64 / n as f64;
                iteration_limit = iteration_limit
                    .min(adaptive_iterations(ratio, config.ransac.confidence, DLT_SAMPLE));
            }
        }
    }

    let best = best.ok_or_else(|| VoError::degenerate("no pnp hypothesis"))?;
    debug!(
        iterations = iteration,
        inliers = best.num_inliers,
        total = n,
        "pnp RANSAC finished"
    );
    if best.num_inliers < config.min_inliers {
        return Err(VoError::degenerate(format!(
            "pnp found {} inliers, {} required",
            best.num_inliers, config.min_inliers
        )));
    }

    let inlier_points = select(points, &best.inliers);
    let inlier_pixels = select(pixels, &best.inliers);
    if planarity(&inlier_points) < config.planarity_threshold {
        return Err(VoError::degenerate("pnp inliers are coplanar"));
    }

    let mut pose = match dlt(&inlier_points, &inlier_pixels, camera) {
        Ok(refit) => {
            let (refit_inliers, _) =
                score(&reprojection_errors(&refit, points, pixels, camera), threshold);
            let refit_count = refit_inliers.iter().filter(|&&b| b).count();
            if refit_count >= best.num_inliers {
                refit
            } else {
                best.model
            }
        }
        Err(_) => best.model,
    };
    if config.refine {
        pose = refine_pose(
            &inlier_points,
            &inlier_pixels,
            camera,
            pose,
            config.max_refine_evaluations,
        );
    }

    let errors = reprojection_errors(&pose, points, pixels, camera);
    let (inliers, cost) = score(&errors, threshold);
    let num_inliers = inliers.iter().filter(|&&b| b).count();
    if num_inliers < config.min_inliers {
        return Err(VoError::degenerate(format!(
            "pnp refinement left {} inliers, {} required",
            num_inliers, config.min_inliers
        )));
    }
    let mean_reprojection_error = errors
        .iter()
        .zip(&inliers)
        .filter_map(|(e, &inlier)| inlier.then_some(*e))
        .sum::<f64>()
        / num_inliers as f64;
    debug!(num_inliers, mean_reprojection_error, cost, "pnp solved");

    Ok(PnpSolution {
        pose,
        inliers,
        num_inliers,
        mean_reprojection_error,
    })
}

/// Minimize pixel reprojection error over the pose. Returns `initial` if the
/// optimizer does not lower the cost.
pub fn refine_pose(
    points: &[Vector3<f64>],
    pixels: &[Point2<f64>],
    camera: &CameraModel,
    initial: SE3,
    max_evaluations: usize,
) -> SE3 {
    let t_cw = initial.inverse();
    let problem = PoseProblem {
        camera: *camera,
        points: points.to_vec(),
        pixels: pixels.to_vec(),
        rotation: so3::log(&t_cw.rotation),
        translation: t_cw.translation,
    };
    let initial_cost = problem.cost();
    let (solved, _report) = LevenbergMarquardt::new()
        .with_patience(max_evaluations)
        .minimize(problem);

    let cost = solved.cost();
    if cost.is_finite() && cost <= initial_cost {
        solved.pose_cw().inverse()
    } else {
        initial
    }
}

/// Pose refinement over `[ω, t]` of the world-to-camera transform.
struct PoseProblem {
    camera: CameraModel,
    points: Vec<Vector3<f64>>,
    pixels: Vec<Point2<f64>>,
    rotation: Vector3<f64>,
    translation: Vector3<f64>,
}

impl PoseProblem {
    fn pose_cw(&self) -> SE3 {
        SE3 {
            rotation: so3::exp(&self.rotation),
            translation: self.translation,
        }
    }

    fn cost(&self) -> f64 {
        0.5 * self.residuals_vec().norm_squared()
    }

    fn residuals_vec(&self) -> DVector<f64> {
        let t_cw = self.pose_cw();
        let mut r = DVector::zeros(2 * self.points.len());
        for (i, (p, px)) in self.points.iter().zip(&self.pixels).enumerate() {
            let pc = t_cw.transform_point(p);
            let z = pc.z.max(MIN_DEPTH);
            r[2 * i] = self.camera.fx * pc.x / z + self.camera.cx - px.x;
            r[2 * i + 1] = self.camera.fy * pc.y / z + self.camera.cy - px.y;
        }
        r
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoseProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.rotation = Vector3::new(params[0], params[1], params[2]);
        self.translation = Vector3::new(params[3], params[4], params[5]);
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_iterator(6, self.rotation.iter().chain(self.translation.iter()).copied())
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_vec())
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let t_cw = self.pose_cw();
        let r = t_cw.rotation_matrix();
        // dp_c/dω = -R [X]× Jr(ω)
        let jr = so3::right_jacobian(&self.rotation);
        let mut j = DMatrix::zeros(2 * self.points.len(), 6);
        for (i, p) in self.points.iter().enumerate() {
            let pc = t_cw.transform_point(p);
            let z = pc.z.max(MIN_DEPTH);
            let inv_z2 = 1.0 / (z * z);
            let d_proj = nalgebra::Matrix2x3::new(
                self.camera.fx / z,
                0.0,
                -self.camera.fx * pc.x * inv_z2,
                0.0,
                self.camera.fy / z,
                -self.camera.fy * pc.y * inv_z2,
            );
            let d_rot = -r * so3::skew(p) * jr;
            j.view_mut((2 * i, 0), (2, 3)).copy_from(&(d_proj * d_rot));
            j.view_mut((2 * i, 3), (2, 3)).copy_from(&d_proj);
        }
        Some(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pixel_noise, SyntheticScene};
    use approx::assert_relative_eq;
    use nalgebra::Vector2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn observations(scene: &SyntheticScene, frame: usize) -> (Vec<Vector3<f64>>, Vec<Point2<f64>>) {
        let pixels = scene
            .points
            .iter()
            .map(|p| scene.project(frame, p).unwrap())
            .collect();
        (scene.points.clone(), pixels)
    }

    fn assert_pose_close(a: &SE3, b: &SE3, tol: f64) {
        assert!(
            (a.translation - b.translation).norm() < tol,
            "translation {} vs {}",
            a.translation,
            b.translation
        );
        assert!(a.rotation_angle_to(b) < tol);
    }

    #[test]
    fn test_dlt_noise_free() {
        let scene = SyntheticScene::two_view(21, 30);
        let (points, pixels) = observations(&scene, 1);

        let pose = dlt(&points, &pixels, &scene.camera).unwrap();
        assert_pose_close(&pose, &scene.poses[1], 1e-8);
    }

    #[test]
    fn test_ransac_with_outliers() {
        let scene = SyntheticScene::two_view(22, 60);
        let (points, mut pixels) = observations(&scene, 1);
        for (i, px) in pixels.iter_mut().enumerate() {
            if i % 5 == 0 {
                *px += Vector2::new(40.0, -35.0);
            }
        }

        let solution = solve_pnp_ransac(&points, &pixels, &scene.camera, &PnpConfig::default())
            .unwrap();

        assert_eq!(solution.num_inliers, 48);
        for (i, &inlier) in solution.inliers.iter().enumerate() {
            assert_eq!(inlier, i % 5 != 0);
        }
        assert_pose_close(&solution.pose, &scene.poses[1], 1e-6);
        assert!(solution.mean_reprojection_error < 1e-6);
    }

    #[test]
    fn test_too_few_correspondences() {
        let scene = SyntheticScene::two_view(23, 5);
        let (points, pixels) = observations(&scene, 1);

        let err = solve_pnp_ransac(&points, &pixels, &scene.camera, &PnpConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            VoError::InsufficientMatches {
                found: 5,
                required: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_coplanar_points_are_degenerate() {
        let mut scene = SyntheticScene::two_view(24, 40);
        for p in &mut scene.points {
            p.z = 10.0;
        }
        let (points, pixels) = observations(&scene, 1);

        let err = solve_pnp_ransac(&points, &pixels, &scene.camera, &PnpConfig::default())
            .unwrap_err();
        assert!(matches!(err, VoError::DegenerateGeometry(_)));
    }

    #[test]
    fn test_deterministic_for_fixed_seed() {
        let scene = SyntheticScene::two_view(25, 80);
        let (points, mut pixels) = observations(&scene, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        for px in &mut pixels {
            *px += pixel_noise(&mut rng, 0.8);
        }
        for px in pixels.iter_mut().step_by(7) {
            *px += Vector2::new(-30.0, 25.0);
        }

        let config = PnpConfig::default();
        let a = solve_pnp_ransac(&points, &pixels, &scene.camera, &config).unwrap();
        let b = solve_pnp_ransac(&points, &pixels, &scene.camera, &config).unwrap();

        assert_eq!(a.inliers, b.inliers);
        assert_relative_eq!(a.pose.translation, b.pose.translation, epsilon = 1e-12);
        assert!(a.pose.rotation_angle_to(&b.pose) < 1e-12);
    }

    #[test]
    fn test_refinement_lowers_error_under_noise() {
        let scene = SyntheticScene::two_view(26, 80);
        let (points, mut pixels) = observations(&scene, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for px in &mut pixels {
            *px += pixel_noise(&mut rng, 1.0);
        }

        let linear = dlt(&points, &pixels, &scene.camera).unwrap();
        let refined = refine_pose(&points, &pixels, &scene.camera, linear, 100);

        let sse = |pose: &SE3| {
            reprojection_errors(pose, &points, &pixels, &scene.camera)
                .iter()
                .map(|e| e * e)
                .sum::<f64>()
        };
        assert!(sse(&refined) <= sse(&linear) + 1e-9);
        assert_pose_close(&refined, &scene.poses[1], 0.05);
    }

    #[test]
    fn test_planarity() {
        let flat: Vec<_> = (0..10)
            .map(|i| Vector3::new(i as f64, (i * i % 7) as f64, 5.0))
            .collect();
        assert!(planarity(&flat) < 1e-12);

        let scene = SyntheticScene::two_view(27, 30);
        assert!(planarity(&scene.points) > 1e-2);
    }
}

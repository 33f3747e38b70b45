//! Essential matrix estimation and relative pose recovery.
//!
//! All coordinates are normalized image coordinates (`K⁻¹ x`). The relative
//! pose maps points from the first camera into the second:
//! `X_b = R X_a + t`.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use tracing::debug;

use crate::error::{VoError, VoResult};
use crate::geometry::ransac::{adaptive_iterations, sample_indices, Consensus, RansacConfig};
use crate::geometry::triangulation::{self, Triangulated};
use crate::geometry::SE3;

/// Minimal sample of the linear solver.
pub const EIGHT_POINT_SAMPLE: usize = 8;

/// A normalized correspondence between two views.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub a: Vector2<f64>,
    pub b: Vector2<f64>,
}

impl Correspondence {
    pub fn new(a: Vector2<f64>, b: Vector2<f64>) -> Self {
        Self { a, b }
    }
}

/// Essential matrix with its RANSAC support.
#[derive(Debug, Clone)]
pub struct EssentialEstimate {
    pub essential: Matrix3<f64>,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

/// The physically valid decomposition of an essential matrix.
#[derive(Debug, Clone)]
pub struct RelativePose {
    /// `R_ba`.
    pub rotation: Matrix3<f64>,
    /// `t_ba`, unit norm.
    pub translation: Vector3<f64>,
    /// Triangulated inliers in the first camera frame, `None` for outliers and
    /// points the solver could not triangulate.
    pub points: Vec<Option<Triangulated>>,
    /// Inliers in front of both cameras for the chosen candidate.
    pub num_in_front: usize,
    /// Same count for the runner-up candidate.
    pub runner_up: usize,
}

impl RelativePose {
    /// Pose of the second camera in the frame of the first (`T_ab`).
    pub fn second_camera_pose(&self) -> SE3 {
        SE3::from_rt(self.rotation, self.translation).inverse()
    }
}

/// Normalized 8-point algorithm with Hartley conditioning and rank-2
/// enforcement. Needs at least eight correspondences.
pub fn eight_point(matches: &[Correspondence]) -> Option<Matrix3<f64>> {
    if matches.len() < EIGHT_POINT_SAMPLE {
        return None;
    }
    let (points_a, t_a) = hartley_normalize(matches.iter().map(|m| m.a));
    let (points_b, t_b) = hartley_normalize(matches.iter().map(|m| m.b));

    // x_bᵀ E x_a = 0 expanded row-major over E. Padded to nine rows so the
    // SVD always exposes the null vector.
    let rows = matches.len().max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (row, (pa, pb)) in points_a.iter().zip(&points_b).enumerate() {
        a[(row, 0)] = pb.x * pa.x;
        a[(row, 1)] = pb.x * pa.y;
        a[(row, 2)] = pb.x;
        a[(row, 3)] = pb.y * pa.x;
        a[(row, 4)] = pb.y * pa.y;
        a[(row, 5)] = pb.y;
        a[(row, 6)] = pa.x;
        a[(row, 7)] = pa.y;
        a[(row, 8)] = 1.0;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let e = v_t.row(v_t.nrows() - 1);
    let e = Matrix3::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8]);

    let e = t_b.transpose() * e * t_a;
    let e = project_to_essential_space(&e)?;
    e.iter().all(|v| v.is_finite()).then_some(e)
}

/// Translate to the centroid and scale so the mean distance is √2.
fn hartley_normalize(
    points: impl Iterator<Item = Vector2<f64>>,
) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let points: Vec<_> = points.collect();
    let n = points.len().max(1) as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_dist < f64::EPSILON {
        1.0
    } else {
        std::f64::consts::SQRT_2 / mean_dist
    };

    let transform = Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    );
    let normalized = points.iter().map(|p| (p - centroid) * scale).collect();
    (normalized, transform)
}

/// Closest matrix with singular values `(σ, σ, 0)`.
fn project_to_essential_space(e: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = e.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let s = svd.singular_values;
    let sigma = 0.5 * (s[0] + s[1]);
    if sigma <= f64::EPSILON {
        return None;
    }
    Some(u * Matrix3::from_diagonal(&Vector3::new(sigma, sigma, 0.0)) * v_t)
}

/// First-order (Sampson) approximation of the squared geometric epipolar
/// error, in normalized units squared.
pub fn sampson_error(e: &Matrix3<f64>, m: &Correspondence) -> f64 {
    let xa = m.a.push(1.0);
    let xb = m.b.push(1.0);
    let e_xa = e * xa;
    let et_xb = e.transpose() * xb;
    let denom = e_xa.x.powi(2) + e_xa.y.powi(2) + et_xb.x.powi(2) + et_xb.y.powi(2);
    if denom < 1e-18 {
        return f64::MAX;
    }
    let num = xb.dot(&e_xa);
    num * num / denom
}

fn score(e: &Matrix3<f64>, matches: &[Correspondence], threshold_sq: f64) -> (Vec<bool>, f64) {
    let mut inliers = Vec::with_capacity(matches.len());
    let mut cost = 0.0;
    for m in matches {
        let err = sampson_error(e, m);
        let inlier = err < threshold_sq;
        if inlier {
            cost += err;
        }
        inliers.push(inlier);
    }
    (inliers, cost)
}

/// Robust essential matrix from normalized correspondences.
///
/// `threshold` is the Sampson distance in normalized units, usually a pixel
/// threshold divided by the focal length.
pub fn estimate_essential(
    matches: &[Correspondence],
    config: &RansacConfig,
    threshold: f64,
) -> VoResult<EssentialEstimate> {
    if matches.len() < EIGHT_POINT_SAMPLE {
        return Err(VoError::InsufficientMatches {
            stage: "essential matrix",
            found: matches.len(),
            required: EIGHT_POINT_SAMPLE,
        });
    }

    let threshold_sq = threshold * threshold;
    let mut rng = config.rng();
    let mut best: Option<Consensus<Matrix3<f64>>> = None;
    let mut iteration_limit = config.max_iterations;
    let mut iteration = 0;

    while iteration < iteration_limit {
        iteration += 1;
        let sample: Vec<Correspondence> = sample_indices(&mut rng, matches.len(), EIGHT_POINT_SAMPLE)
            .into_iter()
            .map(|i| matches[i])
            .collect();
        let Some(e) = eight_point(&sample) else {
            continue;
        };
        let (inliers, cost) = score(&e, matches, threshold_sq);
        if Consensus::offer(&mut best, e, inliers, cost) {
            if let Some(b) = &best {
                let ratio = b.num_inliers as f64 / matches.len() as f64;
                iteration_limit = iteration_limit
                    .min(adaptive_iterations(ratio, config.confidence, EIGHT_POINT_SAMPLE));
            }
        }
    }

    let mut best = best.ok_or_else(|| VoError::degenerate("no essential matrix hypothesis"))?;
    debug!(
        iterations = iteration,
        inliers = best.num_inliers,
        total = matches.len(),
        "essential RANSAC finished"
    );

    // Refit on the whole consensus set; keep it only if support does not drop.
    let consensus: Vec<Correspondence> = matches
        .iter()
        .zip(&best.inliers)
        .filter_map(|(m, &inlier)| inlier.then_some(*m))
        .collect();
    if let Some(refit) = eight_point(&consensus) {
        let (inliers, cost) = score(&refit, matches, threshold_sq);
        let num_inliers = inliers.iter().filter(|&&b| b).count();
        if num_inliers >= best.num_inliers {
            best = Consensus {
                model: refit,
                inliers,
                num_inliers,
                score: cost,
            };
        }
    }

    Ok(EssentialEstimate {
        essential: best.model,
        inliers: best.inliers,
        num_inliers: best.num_inliers,
    })
}

/// The four `(R, t)` factorizations of an essential matrix.
pub fn decompose(e: &Matrix3<f64>) -> Option<[(Matrix3<f64>, Vector3<f64>); 4]> {
    let svd = e.svd(true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;
    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v_t.determinant() < 0.0 {
        v_t.row_mut(2).neg_mut();
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();

    Some([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Pick the decomposition that places most inliers in front of both cameras.
///
/// `ambiguity_ratio` is how many times more supported the winner must be than
/// the runner-up.
pub fn recover_pose(
    e: &Matrix3<f64>,
    matches: &[Correspondence],
    inliers: &[bool],
    ambiguity_ratio: f64,
) -> VoResult<RelativePose> {
    let candidates =
        decompose(e).ok_or_else(|| VoError::degenerate("essential matrix SVD failed"))?;

    let first = SE3::identity();
    let mut evaluated: Vec<RelativePose> = candidates
        .iter()
        .map(|(rotation, translation)| {
            let second = SE3::from_rt(*rotation, *translation).inverse();
            let points: Vec<Option<Triangulated>> = matches
                .iter()
                .zip(inliers)
                .map(|(m, &inlier)| {
                    if !inlier {
                        return None;
                    }
                    triangulation::triangulate_linear(&m.a, &m.b, &first, &second)
                        .map(|p| triangulation::describe(p, &first, &second))
                })
                .collect();
            let num_in_front = points
                .iter()
                .flatten()
                .filter(|t| t.depth_a > 0.0 && t.depth_b > 0.0)
                .count();
            RelativePose {
                rotation: *rotation,
                translation: *translation,
                points,
                num_in_front,
                runner_up: 0,
            }
        })
        .collect();

    evaluated.sort_by(|a, b| b.num_in_front.cmp(&a.num_in_front));
    let runner_up = evaluated.get(1).map_or(0, |c| c.num_in_front);
    let mut best = evaluated.swap_remove(0);
    best.runner_up = runner_up;

    debug!(
        in_front = best.num_in_front,
        runner_up, "cheirality check over four candidates"
    );

    if best.num_in_front == 0 {
        return Err(VoError::degenerate(
            "no pose candidate places points in front of both cameras",
        ));
    }
    if (best.num_in_front as f64) < ambiguity_ratio * runner_up as f64 {
        return Err(VoError::degenerate(format!(
            "ambiguous pose: {} vs {} points in front",
            best.num_in_front, runner_up
        )));
    }

    let norm = best.translation.norm();
    if norm <= f64::EPSILON {
        return Err(VoError::degenerate("zero baseline"));
    }
    best.translation /= norm;
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::skew;
    use crate::testing::SyntheticScene;
    use approx::assert_relative_eq;

    fn correspondences(scene: &SyntheticScene) -> Vec<Correspondence> {
        scene
            .points
            .iter()
            .map(|p| {
                Correspondence::new(
                    scene.normalized(0, p).unwrap(),
                    scene.normalized(1, p).unwrap(),
                )
            })
            .collect()
    }

    /// `R_ba`, `t_ba` of the scene's second camera.
    fn true_relative(scene: &SyntheticScene) -> (Matrix3<f64>, Vector3<f64>) {
        let t_ba = scene.poses[1].inverse().compose(&scene.poses[0]);
        (t_ba.rotation_matrix(), t_ba.translation)
    }

    #[test]
    fn test_eight_point_satisfies_epipolar_constraint() {
        let scene = SyntheticScene::two_view(7, 40);
        let matches = correspondences(&scene);
        let e = eight_point(&matches).unwrap();

        for m in &matches {
            assert!(sampson_error(&e, m) < 1e-16);
        }

        let (r, t) = true_relative(&scene);
        let expected = skew(&t) * r;
        let scale = expected.norm() / e.norm();
        let sign = if (expected - e * scale).norm() < (expected + e * scale).norm() {
            1.0
        } else {
            -1.0
        };
        assert_relative_eq!(e * scale * sign, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_eight_point_needs_eight() {
        let scene = SyntheticScene::two_view(7, 7);
        assert!(eight_point(&correspondences(&scene)).is_none());
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let scene = SyntheticScene::two_view(11, 60);
        let mut matches = correspondences(&scene);
        // Corrupt every fourth correspondence.
        for (i, m) in matches.iter_mut().enumerate() {
            if i % 4 == 0 {
                m.b += Vector2::new(0.05, -0.04);
            }
        }

        let estimate = estimate_essential(&matches, &RansacConfig::default(), 1.0 / 500.0).unwrap();

        assert_eq!(estimate.num_inliers, 45);
        for (i, &inlier) in estimate.inliers.iter().enumerate() {
            assert_eq!(inlier, i % 4 != 0, "index {i}");
        }
    }

    #[test]
    fn test_too_few_correspondences() {
        let scene = SyntheticScene::two_view(3, 5);
        let err = estimate_essential(&correspondences(&scene), &RansacConfig::default(), 0.002)
            .unwrap_err();
        assert!(matches!(
            err,
            VoError::InsufficientMatches {
                found: 5,
                required: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_recover_pose_matches_ground_truth() {
        let scene = SyntheticScene::two_view(5, 50);
        let matches = correspondences(&scene);
        let e = eight_point(&matches).unwrap();
        let inliers = vec![true; matches.len()];

        let pose = recover_pose(&e, &matches, &inliers, 1.5).unwrap();
        let (r, t) = true_relative(&scene);

        assert_relative_eq!(pose.rotation, r, epsilon = 1e-6);
        assert!(pose.translation.angle(&t) < 1e-6);
        assert_eq!(pose.num_in_front, 50);
        assert!(pose.points.iter().all(|p| p.is_some()));
    }

    #[test]
    fn test_decompose_yields_rotations() {
        let scene = SyntheticScene::two_view(5, 20);
        let e = eight_point(&correspondences(&scene)).unwrap();
        for (r, t) in decompose(&e).unwrap() {
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-9);
            assert_relative_eq!(t.norm(), 1.0, epsilon = 1e-9);
        }
    }
}

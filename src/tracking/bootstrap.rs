//! Two-view map initialization.
//!
//! Matches the keypoints of two frames, estimates the essential matrix with
//! RANSAC, picks the physically valid relative pose and triangulates the
//! inliers. The first camera defines the world frame and the baseline has
//! unit length; metric scale is not observable from one camera.

use nalgebra::{Point2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{VoError, VoResult};
use crate::geometry::essential::{estimate_essential, recover_pose, EIGHT_POINT_SAMPLE};
use crate::geometry::{triangulation, Correspondence, RansacConfig, SE3};
use crate::map::{Landmark, Landmarks, VoState};
use crate::tracking::frame::{CameraModel, Frame};
use crate::tracking::matching::{DescriptorMatcher, MatcherConfig};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub matcher: MatcherConfig,
    /// Essential matrix RANSAC; `threshold_px` is a Sampson distance.
    pub ransac: RansacConfig,
    pub min_matches: usize,
    pub min_inliers: usize,
    /// Median parallax of the triangulated inliers, in degrees.
    pub min_parallax_deg: f64,
    /// Largest accepted depth, in baselines.
    pub max_depth: f64,
    pub max_reprojection_px: f64,
    pub min_landmarks: usize,
    /// Support of the best pose candidate over the runner-up.
    pub ambiguity_ratio: f64,
    pub refine_points: bool,
    pub max_refine_evaluations: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            ransac: RansacConfig {
                max_iterations: 1000,
                threshold_px: 1.0,
                ..RansacConfig::default()
            },
            min_matches: 30,
            min_inliers: 20,
            min_parallax_deg: 1.0,
            max_depth: 50.0,
            max_reprojection_px: 4.0,
            min_landmarks: 30,
            ambiguity_ratio: 1.5,
            refine_points: true,
            max_refine_evaluations: 30,
        }
    }
}

/// An initialized map.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// Landmarks at their second-view pixels, pose of the second camera.
    pub state: VoState,
    /// Pose of the first camera.
    pub first_pose: SE3,
    /// First-view pixel of every landmark, index-aligned with the landmarks.
    pub first_pixels: Vec<Point2<f64>>,
    pub inlier_count: usize,
    /// Unit direction from the first to the second camera center, in world
    /// coordinates.
    pub translation_direction: Vector3<f64>,
    pub median_parallax_deg: f64,
}

impl Bootstrap {
    /// Re-express the map in a world frame where the first camera sits at
    /// `anchor` and distances are multiplied by `scale`.
    pub fn anchored(self, anchor: &SE3, scale: f64) -> Self {
        let second = self.state.pose;
        let second = anchor.compose(&SE3 {
            rotation: second.rotation,
            translation: second.translation * scale,
        });
        let landmarks = self
            .state
            .landmarks
            .iter()
            .map(|l| Landmark::new(l.pixel, anchor.transform_point(&(l.position * scale))))
            .collect();
        Self {
            state: VoState::new(landmarks, second),
            first_pose: *anchor,
            translation_direction: anchor.rotation * self.translation_direction,
            ..self
        }
    }
}

pub struct Bootstrapper {
    camera: CameraModel,
    config: BootstrapConfig,
    matcher: DescriptorMatcher,
}

impl Bootstrapper {
    pub fn new(camera: CameraModel, config: BootstrapConfig) -> Self {
        Self {
            camera,
            matcher: DescriptorMatcher::new(config.matcher),
            config,
        }
    }

    /// Initialize from two frames by matching their descriptors.
    pub fn bootstrap(&self, first: &Frame, second: &Frame) -> VoResult<Bootstrap> {
        let matches = self.matcher.match_features(&first.features, &second.features);
        debug!(
            first = first.index,
            second = second.index,
            matches = matches.len(),
            "bootstrap matching"
        );
        let required = self.config.min_matches.max(EIGHT_POINT_SAMPLE);
        if matches.len() < required {
            return Err(VoError::InsufficientMatches {
                stage: "bootstrap",
                found: matches.len(),
                required,
            });
        }
        let (kps1, kps2): (Vec<_>, Vec<_>) = matches
            .iter()
            .map(|m| {
                (
                    first.features.keypoints[m.query].position,
                    second.features.keypoints[m.train].position,
                )
            })
            .unzip();
        self.bootstrap_from_matches(&kps1, &kps2)
    }

    /// Initialize from index-aligned pixel correspondences.
    pub fn bootstrap_from_matches(
        &self,
        kps1: &[Point2<f64>],
        kps2: &[Point2<f64>],
    ) -> VoResult<Bootstrap> {
        let n = kps1.len().min(kps2.len());
        if n < EIGHT_POINT_SAMPLE {
            return Err(VoError::InsufficientMatches {
                stage: "bootstrap",
                found: n,
                required: EIGHT_POINT_SAMPLE,
            });
        }

        let matches: Vec<Correspondence> = kps1[..n]
            .iter()
            .zip(&kps2[..n])
            .map(|(a, b)| Correspondence::new(self.camera.normalize(a), self.camera.normalize(b)))
            .collect();
        let threshold = self.config.ransac.threshold_px / self.camera.focal();
        let estimate = estimate_essential(&matches, &self.config.ransac, threshold)?;
        if estimate.num_inliers < self.config.min_inliers {
            return Err(VoError::degenerate(format!(
                "essential matrix has {} inliers, {} required",
                estimate.num_inliers, self.config.min_inliers
            )));
        }

        let relative = recover_pose(
            &estimate.essential,
            &matches,
            &estimate.inliers,
            self.config.ambiguity_ratio,
        )?;
        let first_pose = SE3::identity();
        let second_pose = relative.second_camera_pose();

        let mut parallaxes: Vec<f64> = relative
            .points
            .iter()
            .flatten()
            .filter(|t| t.depth_a > 0.0 && t.depth_b > 0.0)
            .map(|t| t.parallax.to_degrees())
            .collect();
        let median_parallax_deg = median(&mut parallaxes);
        if median_parallax_deg < self.config.min_parallax_deg {
            return Err(VoError::degenerate(format!(
                "median parallax {median_parallax_deg:.2} deg is below {:.2} deg",
                self.config.min_parallax_deg
            )));
        }

        let mut landmarks = Landmarks::new();
        let mut first_pixels = Vec::new();
        for (i, triangulated) in relative.points.iter().enumerate() {
            let Some(t) = triangulated else { continue };
            if !t.has_valid_depth(self.config.max_depth) {
                continue;
            }
            let views = [(first_pose, kps1[i]), (second_pose, kps2[i])];
            let Some(position) = self.accept_point(&views, t.position) else {
                continue;
            };
            landmarks.push(Landmark::new(kps2[i], position));
            first_pixels.push(kps1[i]);
        }

        if landmarks.len() < self.config.min_landmarks {
            return Err(VoError::degenerate(format!(
                "only {} of {} inliers triangulated, {} required",
                landmarks.len(),
                estimate.num_inliers,
                self.config.min_landmarks
            )));
        }

        info!(
            matches = n,
            inliers = estimate.num_inliers,
            landmarks = landmarks.len(),
            parallax_deg = median_parallax_deg,
            "map bootstrapped"
        );

        Ok(Bootstrap {
            translation_direction: second_pose.center().normalize(),
            state: VoState::new(landmarks, second_pose),
            first_pose,
            first_pixels,
            inlier_count: estimate.num_inliers,
            median_parallax_deg,
        })
    }

    /// Refined position of a triangulated inlier, or `None` if it leaves the
    /// depth range or stops reprojecting onto its pixels.
    fn accept_point(
        &self,
        views: &[(SE3, Point2<f64>)],
        position: Vector3<f64>,
    ) -> Option<Vector3<f64>> {
        let position = if self.config.refine_points {
            triangulation::refine_point(
                &self.camera,
                views,
                position,
                self.config.max_refine_evaluations,
            )
        } else {
            position
        };
        triangulation::is_consistent(
            &self.camera,
            views,
            &position,
            self.config.max_depth,
            self.config.max_reprojection_px,
        )
        .then_some(position)
    }
}

/// Median of a sample, 0 for an empty one. Reorders `values`.
fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

//! Camera pose from the tracked landmark set.
//!
//! Wraps robust PnP: the landmark pixels in the current frame and their world
//! positions give the camera pose. Outliers are reported but stay in the
//! landmark set; a landmark that disagrees with one pose may agree with the
//! next.

use tracing::debug;

use crate::error::VoResult;
use crate::geometry::pnp::{solve_pnp_ransac, PnpConfig};
use crate::geometry::SE3;
use crate::map::VoState;
use crate::tracking::frame::CameraModel;

/// Pose of the current frame with its PnP support.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    /// `T_wc`.
    pub pose: SE3,
    /// Index-aligned with the landmarks of the input state.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    pub mean_reprojection_error: f64,
}

impl PoseEstimate {
    pub fn inlier_ratio(&self) -> f64 {
        if self.inliers.is_empty() {
            0.0
        } else {
            self.num_inliers as f64 / self.inliers.len() as f64
        }
    }
}

pub struct PoseEstimator {
    camera: CameraModel,
    config: PnpConfig,
}

impl PoseEstimator {
    pub fn new(camera: CameraModel, config: PnpConfig) -> Self {
        Self { camera, config }
    }

    /// Estimate `T_wc` for the frame whose pixels `state.landmarks` holds.
    pub fn estimate(&self, state: &VoState) -> VoResult<PoseEstimate> {
        let points = state.landmarks.positions();
        let pixels = state.landmarks.pixels();
        let solution = solve_pnp_ransac(&points, &pixels, &self.camera, &self.config)?;

        debug!(
            inliers = solution.num_inliers,
            total = points.len(),
            error_px = solution.mean_reprojection_error,
            "pose estimated"
        );

        Ok(PoseEstimate {
            pose: solution.pose,
            inliers: solution.inliers,
            num_inliers: solution.num_inliers,
            mean_reprojection_error: solution.mean_reprojection_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoError;
    use crate::map::{Landmark, Landmarks};
    use crate::testing::SyntheticScene;
    use approx::assert_relative_eq;

    fn state_at(scene: &SyntheticScene, frame: usize) -> VoState {
        let landmarks: Landmarks = scene
            .points
            .iter()
            .filter_map(|p| Some(Landmark::new(scene.visible(frame, p)?, *p)))
            .collect();
        VoState::new(landmarks, SE3::identity())
    }

    #[test]
    fn test_estimate_recovers_pose() {
        let scene = SyntheticScene::sideways(5, 200, 10, 0.3);
        let estimator = PoseEstimator::new(scene.camera, PnpConfig::default());

        let state = state_at(&scene, 6);
        let estimate = estimator.estimate(&state).unwrap();

        assert_eq!(estimate.inliers.len(), state.num_landmarks());
        assert_eq!(estimate.num_inliers, state.num_landmarks());
        assert_relative_eq!(estimate.inlier_ratio(), 1.0);
        assert_relative_eq!(
            estimate.pose.translation,
            scene.poses[6].translation,
            epsilon = 1e-6
        );
        assert!(estimate.mean_reprojection_error < 1e-6);
    }

    #[test]
    fn test_outliers_are_flagged_not_removed() {
        let scene = SyntheticScene::sideways(6, 200, 10, 0.3);
        let estimator = PoseEstimator::new(scene.camera, PnpConfig::default());
        let mut state = state_at(&scene, 3);
        let n = state.num_landmarks();
        let corrupted: Landmarks = state
            .landmarks
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let mut l = *l;
                if i % 10 == 0 {
                    l.pixel.x += 40.0;
                }
                l
            })
            .collect();
        state.landmarks = corrupted;

        let estimate = estimator.estimate(&state).unwrap();

        assert_eq!(state.num_landmarks(), n);
        for (i, &inlier) in estimate.inliers.iter().enumerate() {
            assert_eq!(inlier, i % 10 != 0, "landmark {i}");
        }
    }

    #[test]
    fn test_too_few_landmarks() {
        let scene = SyntheticScene::sideways(7, 4, 2, 0.3);
        let estimator = PoseEstimator::new(scene.camera, PnpConfig::default());
        let state = state_at(&scene, 0);

        assert!(matches!(
            estimator.estimate(&state),
            Err(VoError::InsufficientMatches { .. })
        ));
    }
}

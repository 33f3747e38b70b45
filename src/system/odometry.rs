//! Visual odometry pipeline - main entry point.
//!
//! `VisualOdometry` is the top-level struct that users interact with. It owns
//! the stages, the landmark state, the candidate pool and the previous frame,
//! and runs one frame at a time: landmark tracking, pose estimation, then
//! candidate triangulation.

use std::time::Instant;

use image::GrayImage;
use tracing::{debug, info, warn};

use crate::config::VoConfig;
use crate::error::{VoError, VoResult};
use crate::geometry::{triangulation, SE3};
use crate::map::{CandidatePool, VoState};
use crate::tracking::frame::{CameraModel, FeatureExtractor, FeatureGrid, Frame};
use crate::tracking::{
    Bootstrap, Bootstrapper, CandidateManager, FrameOutput, KltTracker, LandmarkTracker,
    PointTracker, PoseEstimator, TimingStats, TrackingMetrics, TrackingState,
};

/// Old landmark and new bootstrap point closer than this in the anchor frame
/// are taken to be the same scene point.
const SCALE_MATCH_RADIUS_PX: f64 = 2.0;
/// Fewer shared points than this and the new map keeps unit scale.
const MIN_SCALE_PAIRS: usize = 8;

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1e3
}

/// Monocular visual odometry over a sequence of frames.
pub struct VisualOdometry<T: PointTracker = KltTracker> {
    extractor: FeatureExtractor,
    tracker: T,
    bootstrapper: Bootstrapper,
    landmark_tracker: LandmarkTracker,
    pose_estimator: PoseEstimator,
    candidates: CandidateManager,

    /// Landmarks and pose of the last localized frame.
    state: Option<VoState>,
    pool: CandidatePool,
    /// The last frame handed to the pipeline.
    prev: Option<Frame>,
    tracking_state: TrackingState,
    /// `(frame index, T_wc)` of every localized frame.
    trajectory: Vec<(usize, SE3)>,
}

impl VisualOdometry<KltTracker> {
    /// Pipeline with the pyramidal KLT tracker.
    pub fn new(camera: CameraModel, config: &VoConfig) -> Self {
        Self::with_tracker(camera, config, KltTracker::new(config.klt))
    }
}

impl<T: PointTracker> VisualOdometry<T> {
    pub fn with_tracker(camera: CameraModel, config: &VoConfig, tracker: T) -> Self {
        Self {
            extractor: FeatureExtractor::new(config.features.clone()),
            tracker,
            bootstrapper: Bootstrapper::new(camera, config.bootstrap),
            landmark_tracker: LandmarkTracker::new(config.landmarks),
            pose_estimator: PoseEstimator::new(camera, config.pnp),
            candidates: CandidateManager::new(camera, config.triangulation),
            state: None,
            pool: CandidatePool::new(),
            prev: None,
            tracking_state: TrackingState::NotInitialized,
            trajectory: Vec::new(),
        }
    }

    /// Detect features and build a frame.
    pub fn extract(&self, index: usize, image: GrayImage) -> Frame {
        Frame::new(index, image, &self.extractor)
    }

    /// Initialize the map from two frames.
    ///
    /// If frames were localized before, the new map is attached to the
    /// trajectory at the pose of `first`. When `first` was never localized
    /// the latest known pose stands in for it, and `first` gets no
    /// trajectory entry.
    pub fn bootstrap(&mut self, first: Frame, second: Frame) -> VoResult<FrameOutput> {
        let start = Instant::now();
        let bootstrap = match self.bootstrapper.bootstrap(&first, &second) {
            Ok(bootstrap) => bootstrap,
            Err(err) => {
                warn!(
                    first = first.index,
                    second = second.index,
                    error = %err,
                    "bootstrap failed"
                );
                self.state = None;
                self.pool = CandidatePool::new();
                self.prev = Some(second);
                if self.tracking_state.is_tracking() {
                    self.tracking_state = TrackingState::Lost;
                }
                return Err(err);
            }
        };

        // Only the very first view of a run is new to the trajectory. A
        // re-bootstrap starts from a frame that either has its pose already
        // or was never localized.
        let first_run = self.trajectory.is_empty();
        let bootstrap = self.attach(bootstrap, &first);
        let Bootstrap {
            state,
            first_pose,
            inlier_count,
            ..
        } = bootstrap;

        if first_run {
            self.trajectory.push((first.index, first_pose));
        }
        self.trajectory.push((second.index, state.pose));

        let new_keypoints = self.landmark_tracker.new_keypoints(&second, &state.landmarks);
        let update = self.candidates.update(
            &self.tracker,
            &second,
            &second,
            state,
            CandidatePool::new(),
            &new_keypoints,
            second.index,
        );

        let metrics = TrackingMetrics {
            n_features: second.num_features(),
            n_tracked: update.state.num_landmarks(),
            n_inliers: inlier_count,
            ..TrackingMetrics::default()
        }
        .with_motion(&first_pose, &update.state.pose);
        let output = FrameOutput {
            frame_index: second.index,
            state: TrackingState::Ok,
            pose: update.state.pose,
            landmarks: update.state.landmarks.clone(),
            num_candidates: update.pool.len(),
            metrics,
            timing: TimingStats {
                total_ms: elapsed_ms(start),
                ..TimingStats::zero()
            },
        };

        self.state = Some(update.state);
        self.pool = update.pool;
        self.prev = Some(second);
        self.tracking_state = TrackingState::Ok;
        Ok(output)
    }

    /// Bootstrap again with the last frame the pipeline saw as the first view.
    pub fn rebootstrap(&mut self, second: Frame) -> VoResult<FrameOutput> {
        let Some(first) = self.prev.take() else {
            self.prev = Some(second);
            return Err(VoError::NotInitialized);
        };
        self.bootstrap(first, second)
    }

    /// Localize one frame and update the map.
    ///
    /// A failure drops the state and marks the pipeline lost; the frame is
    /// kept so that `rebootstrap` can start from it.
    pub fn process_frame(&mut self, frame: Frame) -> VoResult<FrameOutput> {
        let (Some(state), Some(prev)) = (self.state.take(), self.prev.take()) else {
            self.prev = Some(frame);
            return Err(VoError::NotInitialized);
        };
        let start = Instant::now();
        let prev_pose = state.pose;

        let t = Instant::now();
        let tracked = self.landmark_tracker.track(&self.tracker, &prev, &frame, state);
        let track_ms = elapsed_ms(t);

        let t = Instant::now();
        let estimate = match self.pose_estimator.estimate(&tracked.state) {
            Ok(estimate) => estimate,
            Err(err) => {
                warn!(frame = frame.index, error = %err, "frame could not be localized");
                self.pool = CandidatePool::new();
                self.prev = Some(frame);
                self.tracking_state = TrackingState::Lost;
                return Err(err);
            }
        };
        let pose_ms = elapsed_ms(t);

        let t = Instant::now();
        let n_tracked = tracked.state.num_landmarks();
        let update = self.candidates.update(
            &self.tracker,
            &prev,
            &frame,
            tracked.state.with_pose(estimate.pose),
            std::mem::take(&mut self.pool),
            &tracked.new_keypoints,
            frame.index,
        );
        let triangulate_ms = elapsed_ms(t);

        let tracking_state = if tracked.needs_rebootstrap {
            TrackingState::Weak
        } else {
            TrackingState::Ok
        };
        let metrics = TrackingMetrics {
            n_features: frame.num_features(),
            n_tracked,
            n_lost: tracked.num_lost,
            n_inliers: estimate.num_inliers,
            inlier_ratio: estimate.inlier_ratio(),
            reproj_error_mean_px: estimate.mean_reprojection_error,
            n_promoted: update.promoted,
            n_discarded: update.discarded,
            ..TrackingMetrics::default()
        }
        .with_motion(&prev_pose, &estimate.pose);
        let timing = TimingStats {
            total_ms: elapsed_ms(start),
            track_ms,
            pose_ms,
            triangulate_ms,
        };

        debug!(
            frame = frame.index,
            landmarks = update.state.num_landmarks(),
            candidates = update.pool.len(),
            inliers = estimate.num_inliers,
            total_ms = timing.total_ms,
            "frame processed"
        );

        let output = FrameOutput {
            frame_index: frame.index,
            state: tracking_state,
            pose: estimate.pose,
            landmarks: update.state.landmarks.clone(),
            num_candidates: update.pool.len(),
            metrics,
            timing,
        };

        self.trajectory.push((frame.index, estimate.pose));
        self.state = Some(update.state);
        self.pool = update.pool;
        self.prev = Some(frame);
        self.tracking_state = tracking_state;
        Ok(output)
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracking_state
    }

    pub fn state(&self) -> Option<&VoState> {
        self.state.as_ref()
    }

    pub fn candidates(&self) -> &CandidatePool {
        &self.pool
    }

    /// `(frame index, T_wc)` of every localized frame, in processing order.
    pub fn trajectory(&self) -> &[(usize, SE3)] {
        &self.trajectory
    }

    /// Move a fresh bootstrap into the world frame of the existing
    /// trajectory. The first bootstrap defines the world frame.
    fn attach(&self, bootstrap: Bootstrap, first: &Frame) -> Bootstrap {
        let known = self
            .trajectory
            .iter()
            .rev()
            .find(|(index, _)| *index == first.index)
            .map(|(_, pose)| *pose);
        let anchor = match (known, self.trajectory.last()) {
            (Some(pose), _) => pose,
            (None, Some((last, pose))) => {
                warn!(
                    frame = first.index,
                    anchor = *last,
                    "frame was never localized, continuity through re-bootstrap is approximate"
                );
                *pose
            }
            (None, None) => return bootstrap,
        };

        let scale = self
            .state
            .as_ref()
            .filter(|old| old.pose == anchor)
            .and_then(|old| rescale_factor(old, &bootstrap, first.width(), first.height()))
            .unwrap_or(1.0);
        info!(
            frame = first.index,
            scale, "re-bootstrapped map attached to trajectory"
        );
        bootstrap.anchored(&anchor, scale)
    }
}

/// Scale that maps the unit-baseline bootstrap onto the old map: the median
/// depth ratio over points both maps observe at the same pixel of the anchor
/// frame.
fn rescale_factor(old: &VoState, bootstrap: &Bootstrap, width: u32, height: u32) -> Option<f64> {
    let grid = FeatureGrid::new(bootstrap.first_pixels.iter().copied(), width, height);
    let mut ratios: Vec<f64> = old
        .landmarks
        .iter()
        .filter_map(|landmark| {
            let nearest = grid
                .get_features_in_area(landmark.pixel.x, landmark.pixel.y, SCALE_MATCH_RADIUS_PX)
                .into_iter()
                .min_by(|&a, &b| {
                    let da = (bootstrap.first_pixels[a] - landmark.pixel).norm_squared();
                    let db = (bootstrap.first_pixels[b] - landmark.pixel).norm_squared();
                    da.total_cmp(&db)
                })?;
            let old_depth = triangulation::depth(&old.pose, &landmark.position);
            let new_point = bootstrap.state.landmarks.as_slice()[nearest].position;
            let new_depth = triangulation::depth(&bootstrap.first_pose, &new_point);
            (old_depth > 0.0 && new_depth > 0.0).then(|| old_depth / new_depth)
        })
        .collect();
    if ratios.len() < MIN_SCALE_PAIRS {
        debug!(pairs = ratios.len(), "too few shared points to carry scale over");
        return None;
    }
    ratios.sort_unstable_by(|a, b| a.total_cmp(b));
    Some(ratios[ratios.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Landmark, Landmarks};
    use crate::testing::{LayeredWorld, SceneTracker, SyntheticScene, HEIGHT, WIDTH};
    use crate::tracking::frame::FeatureSet;
    use approx::assert_relative_eq;

    const SIGMA: f64 = 0.3;

    fn pipeline(scene: &SyntheticScene) -> VisualOdometry<SceneTracker> {
        VisualOdometry::with_tracker(
            scene.camera,
            &VoConfig::default(),
            SceneTracker::new(scene, SIGMA),
        )
    }

    #[test]
    fn test_straight_line_trajectory_stays_bounded() {
        let scene = SyntheticScene::sideways(31, 600, 100, 0.1);
        let mut vo = pipeline(&scene);

        let boot = vo.bootstrap(scene.frame(0, SIGMA), scene.frame(5, SIGMA)).unwrap();
        // The bootstrap baseline is 0.5 m and becomes the unit of the map.
        let meters_per_unit = 0.5;
        assert_relative_eq!(boot.pose.center().norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(boot.pose.center().normalize().x, 1.0, epsilon = 1e-3);

        let mut worst = 0.0f64;
        for i in 6..100 {
            let output = vo.process_frame(scene.frame(i, SIGMA)).unwrap();
            assert_eq!(output.state, TrackingState::Ok, "frame {i}");
            assert_eq!(output.landmarks.pixels().len(), output.landmarks.positions().len());
            assert_eq!(vo.candidates().current_positions().len(), vo.candidates().first_poses().len());

            let estimated = output.pose.center() * meters_per_unit;
            let error = (estimated - scene.poses[i].center()).norm();
            worst = worst.max(error);
        }

        // 9.9 m travelled.
        assert!(worst < 1.0, "trajectory error reached {worst} m");
        assert_eq!(vo.trajectory().len(), 2 + 94);
        assert_eq!(vo.trajectory().last().map(|(i, _)| *i), Some(99));
    }

    #[test]
    fn test_default_frontend_on_rendered_frames() {
        // 0.1 m per frame in front of planes 5-12 m away.
        let step = 0.1;
        let world = LayeredWorld::new();
        let mut vo = VisualOdometry::new(world.camera, &VoConfig::default());
        let render = |vo: &VisualOdometry, i: usize| vo.extract(i, world.render(step * i as f64));

        let (first, second) = (render(&vo, 0), render(&vo, 4));
        let boot = vo.bootstrap(first, second).unwrap();
        assert!(boot.landmarks.len() >= 30, "{} landmarks", boot.landmarks.len());
        let direction = boot.pose.center();
        assert!(direction.x > 0.95, "bootstrap direction {direction:?}");

        // The 0.4 m bootstrap baseline is the map unit.
        for i in 5..=10 {
            let frame = render(&vo, i);
            let output = vo.process_frame(frame).unwrap();
            assert!(output.state.is_tracking());
            let expected = step * i as f64 / 0.4;
            let center = output.pose.center();
            assert!(
                (center.x - expected).abs() < 0.25 * expected
                    && center.y.abs() < 0.25 * expected
                    && center.z.abs() < 0.25 * expected,
                "frame {i}: {center:?}, expected x = {expected}"
            );
        }
        assert_eq!(vo.trajectory().len(), 8);
    }

    #[test]
    fn test_process_before_bootstrap_fails() {
        let scene = SyntheticScene::sideways(32, 50, 2, 0.1);
        let mut vo = pipeline(&scene);

        assert!(matches!(
            vo.process_frame(scene.frame(0, SIGMA)),
            Err(VoError::NotInitialized)
        ));
        assert_eq!(vo.tracking_state(), TrackingState::NotInitialized);
    }

    #[test]
    fn test_lost_frame_then_rebootstrap() {
        let scene = SyntheticScene::sideways(33, 400, 30, 0.1);
        let mut vo = pipeline(&scene);
        vo.bootstrap(scene.frame(0, SIGMA), scene.frame(5, SIGMA)).unwrap();
        vo.process_frame(scene.frame(6, SIGMA)).unwrap();

        // A frame the tracker knows nothing about loses every landmark.
        let blank = Frame::from_parts(1000, GrayImage::new(WIDTH, HEIGHT), FeatureSet::default());
        assert!(vo.process_frame(blank).is_err());
        assert_eq!(vo.tracking_state(), TrackingState::Lost);
        assert!(vo.state().is_none());
        assert!(matches!(
            vo.process_frame(scene.frame(8, SIGMA)),
            Err(VoError::NotInitialized)
        ));

        let output = vo.rebootstrap(scene.frame(14, SIGMA)).unwrap();
        assert_eq!(output.frame_index, 14);
        assert_eq!(vo.tracking_state(), TrackingState::Ok);
        // Frame 8 was never localized, so it has no pose of its own; the
        // new map hangs off the last localized one.
        let indices: Vec<usize> = vo.trajectory().iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 5, 6, 14]);
        let (_, frame6) = vo.trajectory()[2];
        assert_relative_eq!(
            (output.pose.center() - frame6.center()).norm(),
            1.0,
            epsilon = 1e-9
        );

        assert!(vo.process_frame(scene.frame(15, SIGMA)).is_ok());
    }

    #[test]
    fn test_rescale_factor_recovers_map_scale() {
        let scene = SyntheticScene::sideways(34, 300, 12, 0.1);
        let (first, second) = (4, 9);
        let ids: Vec<usize> = (0..scene.points.len())
            .filter(|&id| scene.observe(first, id, 0.0).is_some() && scene.observe(second, id, 0.0).is_some())
            .collect();
        let kps1: Vec<_> = ids.iter().filter_map(|&id| scene.observe(first, id, 0.0)).collect();
        let kps2: Vec<_> = ids.iter().filter_map(|&id| scene.observe(second, id, 0.0)).collect();
        let bootstrap = Bootstrapper::new(scene.camera, Default::default())
            .bootstrap_from_matches(&kps1, &kps2)
            .unwrap();
        let old = VoState::new(
            ids.iter()
                .map(|&id| Landmark::new(scene.observe(first, id, 0.0).unwrap(), scene.points[id]))
                .collect::<Landmarks>(),
            scene.poses[first],
        );

        let scale = rescale_factor(&old, &bootstrap, WIDTH, HEIGHT).unwrap();

        // Unit baseline in the bootstrap, 0.5 m in the scene.
        assert_relative_eq!(scale, 0.5, epsilon = 1e-6);
    }
}

//! Candidate tracking, triangulation and promotion to landmarks.
//!
//! Every candidate remembers where and from which pose it was first seen.
//! Once the rays from that first observation and from the current one meet
//! at a wide enough angle the point is triangulated and becomes a landmark.
//! Candidates that are lost, or whose wide-angle triangulation lands behind
//! a camera or implausibly far away, are dropped.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geometry::{triangulation, SE3};
use crate::map::{Candidate, CandidatePool, Landmark, VoState};
use crate::tracking::frame::{CameraModel, FeatureGrid, Frame};
use crate::tracking::point_tracker::PointTracker;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Bearing angle between first and current ray needed for promotion.
    pub min_parallax_deg: f64,
    /// Frames a candidate must be tracked before it may be promoted.
    pub min_track_length: usize,
    pub max_depth: f64,
    pub max_reprojection_px: f64,
    /// New keypoints closer than this to a candidate or landmark are skipped.
    pub min_keypoint_distance: f64,
    pub max_candidates: usize,
    pub refine: bool,
    pub max_refine_evaluations: usize,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            min_parallax_deg: 2.0,
            min_track_length: 1,
            max_depth: 50.0,
            max_reprojection_px: 4.0,
            min_keypoint_distance: 10.0,
            max_candidates: 2000,
            refine: true,
            max_refine_evaluations: 30,
        }
    }
}

/// Outcome of one candidate pass.
#[derive(Debug, Clone)]
pub struct CandidateUpdate {
    pub state: VoState,
    pub pool: CandidatePool,
    pub promoted: usize,
    pub discarded: usize,
}

enum Verdict {
    Promote(Landmark),
    Retain(Candidate),
    Discard,
}

pub struct CandidateManager {
    camera: CameraModel,
    config: TriangulationConfig,
}

impl CandidateManager {
    pub fn new(camera: CameraModel, config: TriangulationConfig) -> Self {
        Self { camera, config }
    }

    /// Advance the pool to `curr`, promote what can be triangulated and seed
    /// new candidates. `state.pose` must already be the pose of `curr`.
    #[allow(clippy::too_many_arguments)]
    pub fn update<T: PointTracker + ?Sized>(
        &self,
        tracker: &T,
        prev: &Frame,
        curr: &Frame,
        state: VoState,
        pool: CandidatePool,
        new_keypoints: &[Point2<f64>],
        frame_index: usize,
    ) -> CandidateUpdate {
        let (mut landmarks, pose) = state.into_parts();
        let tracked = tracker.track(prev, curr, &pool.current_positions());

        let mut retained = CandidatePool::new();
        let mut promoted = 0;
        let mut discarded = 0;
        // A short tracker answer loses the tail, like `Landmarks::retain_tracked`.
        let tracked = tracked.into_iter().chain(std::iter::repeat(None));
        for (candidate, position) in pool.into_iter().zip(tracked) {
            let verdict = match position {
                Some(position) => self.judge(candidate.advanced(position), &pose),
                None => Verdict::Discard,
            };
            match verdict {
                Verdict::Promote(landmark) => {
                    landmarks.push(landmark);
                    promoted += 1;
                }
                Verdict::Retain(candidate) => retained.push(candidate),
                Verdict::Discard => discarded += 1,
            }
        }

        let mut occupied = FeatureGrid::new(
            retained
                .iter()
                .map(|c| c.current)
                .chain(landmarks.iter().map(|l| l.pixel)),
            curr.width(),
            curr.height(),
        );
        let mut added = 0;
        for p in new_keypoints {
            if retained.len() >= self.config.max_candidates {
                break;
            }
            if occupied.has_neighbor_within(p, self.config.min_keypoint_distance) {
                continue;
            }
            occupied.insert(*p);
            retained.push(Candidate::new(*p, pose, frame_index));
            added += 1;
        }

        debug!(
            frame = frame_index,
            candidates = retained.len(),
            added,
            discarded,
            "candidate pool updated"
        );
        if promoted > 0 {
            info!(
                frame = frame_index,
                promoted,
                landmarks = landmarks.len(),
                "candidates promoted"
            );
        }

        CandidateUpdate {
            state: VoState::new(landmarks, pose),
            pool: retained,
            promoted,
            discarded,
        }
    }

    fn judge(&self, candidate: Candidate, pose: &SE3) -> Verdict {
        let Some(t) = triangulation::triangulate_pixels(
            &self.camera,
            &candidate.first_pose,
            &candidate.first,
            pose,
            &candidate.current,
        ) else {
            return Verdict::Retain(candidate);
        };

        if t.parallax.to_degrees() <= self.config.min_parallax_deg {
            return Verdict::Retain(candidate);
        }
        if !t.has_valid_depth(self.config.max_depth) {
            return Verdict::Discard;
        }
        if candidate.track_length < self.config.min_track_length {
            return Verdict::Retain(candidate);
        }

        let views = [(candidate.first_pose, candidate.first), (*pose, candidate.current)];
        let position = if self.config.refine {
            triangulation::refine_point(
                &self.camera,
                &views,
                t.position,
                self.config.max_refine_evaluations,
            )
        } else {
            t.position
        };
        let consistent = triangulation::is_consistent(
            &self.camera,
            &views,
            &position,
            self.config.max_depth,
            self.config.max_reprojection_px,
        );
        if !consistent {
            return Verdict::Discard;
        }
        Verdict::Promote(Landmark::new(candidate.current, position))
    }
}

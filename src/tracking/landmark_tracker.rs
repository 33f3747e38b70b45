//! Carries the landmark set from one frame to the next.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::map::{Landmarks, VoState};
use crate::tracking::frame::{FeatureGrid, Frame};
use crate::tracking::point_tracker::PointTracker;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkTrackerConfig {
    /// Keypoints closer than this to a tracked landmark are not new.
    pub min_keypoint_distance: f64,
    pub max_new_keypoints: usize,
    /// Below this many survivors the map should be re-bootstrapped.
    pub min_landmarks: usize,
}

impl Default for LandmarkTrackerConfig {
    fn default() -> Self {
        Self {
            min_keypoint_distance: 10.0,
            max_new_keypoints: 500,
            min_landmarks: 30,
        }
    }
}

/// The state after tracking, before the pose is updated.
#[derive(Debug, Clone)]
pub struct TrackedLandmarks {
    /// Landmarks at their pixels in the current frame; the pose is still the
    /// previous frame's.
    pub state: VoState,
    /// Current-frame keypoints away from every tracked landmark, strongest
    /// first.
    pub new_keypoints: Vec<Point2<f64>>,
    pub num_lost: usize,
    pub needs_rebootstrap: bool,
}

pub struct LandmarkTracker {
    config: LandmarkTrackerConfig,
}

impl LandmarkTracker {
    pub fn new(config: LandmarkTrackerConfig) -> Self {
        Self { config }
    }

    /// Keypoints of `frame` away from every landmark pixel, strongest first.
    pub fn new_keypoints(&self, frame: &Frame, landmarks: &Landmarks) -> Vec<Point2<f64>> {
        let occupied = FeatureGrid::new(landmarks.iter().map(|l| l.pixel), frame.width(), frame.height());
        frame
            .features
            .positions()
            .filter(|p| !occupied.has_neighbor_within(p, self.config.min_keypoint_distance))
            .take(self.config.max_new_keypoints)
            .collect()
    }

    pub fn track<T: PointTracker + ?Sized>(
        &self,
        tracker: &T,
        prev: &Frame,
        curr: &Frame,
        state: VoState,
    ) -> TrackedLandmarks {
        let pixels = state.landmarks.pixels();
        let tracked = tracker.track(prev, curr, &pixels);
        let (mut landmarks, pose) = state.into_parts();
        let num_lost = landmarks.retain_tracked(&tracked);

        let new_keypoints = self.new_keypoints(curr, &landmarks);
        let needs_rebootstrap = landmarks.len() < self.config.min_landmarks;
        debug!(
            frame = curr.index,
            tracked = landmarks.len(),
            lost = num_lost,
            new_keypoints = new_keypoints.len(),
            "landmarks tracked"
        );
        if needs_rebootstrap {
            warn!(
                frame = curr.index,
                landmarks = landmarks.len(),
                minimum = self.config.min_landmarks,
                "landmark set is thin, re-bootstrap advised"
            );
        }

        TrackedLandmarks {
            state: VoState::new(landmarks, pose),
            new_keypoints,
            num_lost,
            needs_rebootstrap,
        }
    }
}

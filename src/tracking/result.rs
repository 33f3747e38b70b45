//! Per-frame results and diagnostics.
//!
//! These types describe what happened while processing a single frame:
//! - high level tracking state (OK / WEAK / LOST)
//! - the estimated pose and the landmark set it was estimated from
//! - correspondence counts and reprojection statistics
//! - timing information for profiling

use crate::geometry::SE3;
use crate::map::Landmarks;
use crate::tracking::TrackingState;

/// Summary of one processed (or bootstrapped) frame.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub frame_index: usize,
    pub state: TrackingState,
    /// Camera pose (`T_wc`).
    pub pose: SE3,
    /// Landmarks after the frame, including freshly promoted ones.
    pub landmarks: Landmarks,
    pub num_candidates: usize,
    pub metrics: TrackingMetrics,
    pub timing: TimingStats,
}

impl FrameOutput {
    /// The landmark set dropped below its minimum size.
    pub fn needs_rebootstrap(&self) -> bool {
        self.state == TrackingState::Weak
    }
}

/// Scalar metrics useful for judging tracking quality.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackingMetrics {
    pub n_features: usize,
    /// Landmarks that survived point tracking into this frame.
    pub n_tracked: usize,
    /// Landmarks lost by point tracking.
    pub n_lost: usize,
    pub n_inliers: usize,
    pub inlier_ratio: f64,
    pub reproj_error_mean_px: f64,
    pub n_promoted: usize,
    pub n_discarded: usize,
    /// Camera displacement since the previous frame, in map units.
    pub delta_translation: f64,
    pub delta_rotation_deg: f64,
}

impl TrackingMetrics {
    /// Fill the motion fields from the previous and current pose.
    pub fn with_motion(mut self, previous: &SE3, current: &SE3) -> Self {
        self.delta_translation = (current.center() - previous.center()).norm();
        self.delta_rotation_deg = previous.rotation_angle_to(current).to_degrees();
        self
    }
}

/// Timing breakdown for a frame, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingStats {
    pub total_ms: f64,
    pub track_ms: f64,
    pub pose_ms: f64,
    pub triangulate_ms: f64,
}

impl TimingStats {
    pub fn zero() -> Self {
        Self::default()
    }
}

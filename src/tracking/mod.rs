//! Tracking: turns incoming frames into camera poses.
//!
//! This module implements the per-frame stages of the odometry loop:
//! - Frame processing (FAST + BRIEF extraction, spatial grid)
//! - Two-view bootstrap (essential matrix, cheirality, triangulation)
//! - Landmark tracking (pyramidal KLT or descriptor re-matching)
//! - Pose estimation (PnP-RANSAC + LM refinement)
//! - Candidate triangulation and promotion to landmarks

pub mod bootstrap;
pub mod candidates;
pub mod frame;
pub mod klt;
pub mod landmark_tracker;
pub mod matching;
pub mod point_tracker;
pub mod pose_estimation;
pub mod result;
pub mod state;

pub use bootstrap::{Bootstrap, BootstrapConfig, Bootstrapper};
pub use candidates::{CandidateManager, CandidateUpdate, TriangulationConfig};
pub use klt::{KltConfig, KltTracker};
pub use landmark_tracker::{LandmarkTracker, LandmarkTrackerConfig, TrackedLandmarks};
pub use point_tracker::{DescriptorTracker, DescriptorTrackerConfig, PointTracker};
pub use pose_estimation::{PoseEstimate, PoseEstimator};
pub use result::{FrameOutput, TimingStats, TrackingMetrics};
pub use state::TrackingState;

//! Odometry orchestration.
//!
//! This module contains the top-level `VisualOdometry` pipeline that owns the
//! per-frame stages and threads the state from one frame to the next.

mod odometry;

pub use odometry::VisualOdometry;

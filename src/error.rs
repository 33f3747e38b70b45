//! Error taxonomy of the estimation core.
//!
//! Only frame-level failures are errors. Losing a single landmark or
//! rejecting a candidate is a local filtering decision and never surfaces
//! here.

use thiserror::Error;

/// Frame-level failures of the odometry pipeline.
#[derive(Debug, Error)]
pub enum VoError {
    /// Matching or tracking produced fewer correspondences than the stage needs.
    #[error("{stage}: insufficient correspondences ({found} found, {required} required)")]
    InsufficientMatches {
        stage: &'static str,
        found: usize,
        required: usize,
    },
    /// No numerically stable solution exists for the given correspondences.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),
    /// A frame was submitted while no bootstrapped state is available.
    #[error("pipeline is not initialized; bootstrap first")]
    NotInitialized,
}

impl VoError {
    pub fn degenerate(msg: impl Into<String>) -> Self {
        Self::DegenerateGeometry(msg.into())
    }
}

pub type VoResult<T> = std::result::Result<T, VoError>;

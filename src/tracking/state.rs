//! Tracking state machine of the odometry pipeline.

/// Health of the pipeline after the latest frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No bootstrapped map yet.
    #[default]
    NotInitialized,
    /// Pose estimated and enough landmarks remain.
    Ok,
    /// Pose estimated, but the landmark set fell below its minimum and the
    /// map should be re-bootstrapped.
    Weak,
    /// The last frame could not be localized.
    Lost,
}

impl TrackingState {
    /// Whether the pipeline holds a state that can take the next frame.
    pub fn is_tracking(self) -> bool {
        matches!(self, Self::Ok | Self::Weak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_not_initialized() {
        assert_eq!(TrackingState::default(), TrackingState::NotInitialized);
        assert!(!TrackingState::default().is_tracking());
        assert!(TrackingState::Weak.is_tracking());
        assert!(!TrackingState::Lost.is_tracking());
    }
}

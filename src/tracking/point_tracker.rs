//! Frame-to-frame point correspondence.

use imageproc::filter::gaussian_blur_f32;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::tracking::frame::features::BriefExtractor;
use crate::tracking::frame::Frame;
use crate::tracking::matching::{DescriptorMatcher, MatcherConfig};

/// Re-locates pixels of `prev` in `curr`.
///
/// The output is index-aligned with `points`; `None` means the point has no
/// confident correspondence and is lost.
pub trait PointTracker {
    fn track(&self, prev: &Frame, curr: &Frame, points: &[Point2<f64>]) -> Vec<Option<Point2<f64>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorTrackerConfig {
    pub matcher: MatcherConfig,
    /// Search window around the previous position, in pixels.
    pub search_radius: f64,
    /// A previous keypoint this close to the query lends its descriptor.
    pub snap_distance: f64,
    pub blur_sigma: f32,
}

impl Default for DescriptorTrackerConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            search_radius: 30.0,
            snap_distance: 1.0,
            blur_sigma: 2.0,
        }
    }
}

/// Tracks by re-matching BRIEF descriptors against keypoints of the current
/// frame near the previous position.
pub struct DescriptorTracker {
    config: DescriptorTrackerConfig,
    matcher: DescriptorMatcher,
    brief: BriefExtractor,
}

impl DescriptorTracker {
    pub fn new(config: DescriptorTrackerConfig) -> Self {
        Self {
            matcher: DescriptorMatcher::new(config.matcher),
            brief: BriefExtractor::new(),
            config,
        }
    }
}

impl Default for DescriptorTracker {
    fn default() -> Self {
        Self::new(DescriptorTrackerConfig::default())
    }
}

impl PointTracker for DescriptorTracker {
    fn track(&self, prev: &Frame, curr: &Frame, points: &[Point2<f64>]) -> Vec<Option<Point2<f64>>> {
        let mut smoothed = None;
        points
            .iter()
            .map(|p| {
                let snapped = prev
                    .grid
                    .get_features_in_area(p.x, p.y, self.config.snap_distance)
                    .into_iter()
                    .min_by(|&a, &b| {
                        let da = (prev.features.keypoints[a].position - p).norm_squared();
                        let db = (prev.features.keypoints[b].position - p).norm_squared();
                        da.total_cmp(&db)
                    });
                let descriptor = match snapped {
                    Some(idx) => prev.features.descriptors[idx],
                    None => {
                        let image = smoothed
                            .get_or_insert_with(|| gaussian_blur_f32(&prev.image, self.config.blur_sigma));
                        self.brief.compute(image, p)?
                    }
                };
                let idx = self
                    .matcher
                    .match_in_radius(&descriptor, p, curr, self.config.search_radius)?;
                Some(curr.features.keypoints[idx].position)
            })
            .collect()
    }
}

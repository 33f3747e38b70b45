//! Brute-force and windowed BRIEF matching.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::tracking::frame::{BriefDescriptor, FeatureSet, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Largest Hamming distance accepted for a match.
    pub max_distance: u32,
    /// Lowe ratio between best and second-best distance.
    pub nn_ratio: f32,
    /// Keep only matches that are mutual nearest neighbours.
    pub cross_check: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_distance: 64,
            nn_ratio: 0.8,
            cross_check: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    /// Index in the first set.
    pub query: usize,
    /// Index in the second set.
    pub train: usize,
    pub distance: u32,
}

/// Nearest and second-nearest candidate: `(index, best, second)`.
fn best_two<'a>(
    descriptor: &BriefDescriptor,
    candidates: impl Iterator<Item = (usize, &'a BriefDescriptor)>,
) -> Option<(usize, u32, u32)> {
    let mut best: Option<(usize, u32)> = None;
    let mut second = u32::MAX;
    for (idx, other) in candidates {
        let d = descriptor.hamming_distance(other);
        match best {
            Some((_, bd)) if d >= bd => second = second.min(d),
            Some((_, bd)) => {
                second = bd;
                best = Some((idx, d));
            }
            None => best = Some((idx, d)),
        }
    }
    best.map(|(idx, d)| (idx, d, second))
}

pub struct DescriptorMatcher {
    config: MatcherConfig,
}

impl DescriptorMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    fn accept(&self, best: u32, second: u32) -> bool {
        best <= self.config.max_distance
            && (second == u32::MAX || (best as f32) < self.config.nn_ratio * second as f32)
    }

    /// Match every descriptor of `a` against all of `b`.
    pub fn match_features(&self, a: &FeatureSet, b: &FeatureSet) -> Vec<FeatureMatch> {
        let forward: Vec<Option<(usize, u32)>> = a
            .descriptors
            .iter()
            .map(|d| {
                best_two(d, b.descriptors.iter().enumerate())
                    .filter(|&(_, best, second)| self.accept(best, second))
                    .map(|(idx, best, _)| (idx, best))
            })
            .collect();

        let backward: Vec<Option<usize>> = if self.config.cross_check {
            b.descriptors
                .iter()
                .map(|d| best_two(d, a.descriptors.iter().enumerate()).map(|(idx, _, _)| idx))
                .collect()
        } else {
            Vec::new()
        };

        forward
            .into_iter()
            .enumerate()
            .filter_map(|(query, m)| {
                let (train, distance) = m?;
                if self.config.cross_check && backward[train] != Some(query) {
                    return None;
                }
                Some(FeatureMatch {
                    query,
                    train,
                    distance,
                })
            })
            .collect()
    }

    /// Best keypoint of `frame` within `radius` pixels of `position`.
    pub fn match_in_radius(
        &self,
        descriptor: &BriefDescriptor,
        position: &Point2<f64>,
        frame: &Frame,
        radius: f64,
    ) -> Option<usize> {
        let candidates = frame.grid.get_features_in_area(position.x, position.y, radius);
        let (idx, best, second) = best_two(
            descriptor,
            candidates
                .into_iter()
                .map(|i| (i, &frame.features.descriptors[i])),
        )?;
        self.accept(best, second).then_some(idx)
    }
}

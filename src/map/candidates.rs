//! Candidate keypoints waiting for enough parallax to be triangulated.

use nalgebra::Point2;

use crate::geometry::SE3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Position in the latest frame (`C`).
    pub current: Point2<f64>,
    /// Position when first observed (`F`).
    pub first: Point2<f64>,
    /// Camera pose at the first observation (`T`).
    pub first_pose: SE3,
    pub first_frame: usize,
    /// Frames the candidate has been tracked through since creation.
    pub track_length: usize,
}

impl Candidate {
    /// A fresh candidate: current and first position coincide.
    pub fn new(position: Point2<f64>, pose: SE3, frame: usize) -> Self {
        Self {
            current: position,
            first: position,
            first_pose: pose,
            first_frame: frame,
            track_length: 0,
        }
    }

    /// The same candidate re-located in a new frame.
    pub fn advanced(self, position: Point2<f64>) -> Self {
        Self {
            current: position,
            track_length: self.track_length + 1,
            ..self
        }
    }
}

/// The candidate set. Its `C`, `F` and `T` views share one index space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePool {
    entries: Vec<Candidate>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, candidate: Candidate) {
        self.entries.push(candidate);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.entries.iter()
    }

    /// `C`.
    pub fn current_positions(&self) -> Vec<Point2<f64>> {
        self.entries.iter().map(|c| c.current).collect()
    }

    /// `F`.
    pub fn first_positions(&self) -> Vec<Point2<f64>> {
        self.entries.iter().map(|c| c.first).collect()
    }

    /// `T`.
    pub fn first_poses(&self) -> Vec<SE3> {
        self.entries.iter().map(|c| c.first_pose).collect()
    }

    /// Drop the newest candidates beyond `max`.
    pub fn truncate(&mut self, max: usize) {
        self.entries.truncate(max);
    }
}

impl FromIterator<Candidate> for CandidatePool {
    fn from_iter<I: IntoIterator<Item = Candidate>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for CandidatePool {
    type Item = Candidate;
    type IntoIter = std::vec::IntoIter<Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a CandidatePool {
    type Item = &'a Candidate;
    type IntoIter = std::slice::Iter<'a, Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

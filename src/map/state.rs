//! Landmarks and the per-frame odometry state.

use nalgebra::{Point2, Vector3};

use crate::geometry::SE3;

/// A triangulated world point with its pixel in the latest frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    /// Current 2D projection, updated by tracking every frame.
    pub pixel: Point2<f64>,
    /// World position; fixed once triangulated.
    pub position: Vector3<f64>,
}

impl Landmark {
    pub fn new(pixel: Point2<f64>, position: Vector3<f64>) -> Self {
        Self { pixel, position }
    }
}

/// The landmark set. The 2D (`P`) and 3D (`X`) views share one index space
/// because each entry carries both halves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Landmarks {
    entries: Vec<Landmark>,
}

impl Landmarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, landmark: Landmark) {
        self.entries.push(landmark);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Landmark> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Landmark] {
        &self.entries
    }

    /// `P`: current pixels.
    pub fn pixels(&self) -> Vec<Point2<f64>> {
        self.entries.iter().map(|l| l.pixel).collect()
    }

    /// `X`: world positions.
    pub fn positions(&self) -> Vec<Vector3<f64>> {
        self.entries.iter().map(|l| l.position).collect()
    }

    /// Apply a tracking result index-aligned with the landmarks: survivors
    /// take their new pixel, `None` entries are dropped. World positions are
    /// never touched. Returns how many landmarks were removed.
    ///
    /// Entries past the end of `tracked` count as lost.
    pub fn retain_tracked(&mut self, tracked: &[Option<Point2<f64>>]) -> usize {
        let before = self.entries.len();
        let mut updates = tracked.iter();
        self.entries.retain_mut(|landmark| match updates.next().copied().flatten() {
            Some(pixel) => {
                landmark.pixel = pixel;
                true
            }
            None => false,
        });
        before - self.entries.len()
    }
}

impl FromIterator<Landmark> for Landmarks {
    fn from_iter<I: IntoIterator<Item = Landmark>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<Landmark> for Landmarks {
    fn extend<I: IntoIterator<Item = Landmark>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl<'a> IntoIterator for &'a Landmarks {
    type Item = &'a Landmark;
    type IntoIter = std::slice::Iter<'a, Landmark>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Landmarks plus the current camera pose (`T_wc`).
#[derive(Debug, Clone, PartialEq)]
pub struct VoState {
    pub landmarks: Landmarks,
    pub pose: SE3,
}

impl VoState {
    pub fn new(landmarks: Landmarks, pose: SE3) -> Self {
        Self { landmarks, pose }
    }

    /// The same landmarks at a new pose.
    pub fn with_pose(self, pose: SE3) -> Self {
        Self { pose, ..self }
    }

    pub fn into_parts(self) -> (Landmarks, SE3) {
        (self.landmarks, self.pose)
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn landmarks(n: usize) -> Landmarks {
        (0..n)
            .map(|i| {
                Landmark::new(
                    Point2::new(i as f64, 0.0),
                    Vector3::new(0.0, 0.0, 10.0 + i as f64),
                )
            })
            .collect()
    }

    #[test]
    fn test_views_stay_aligned() {
        let lms = landmarks(4);
        let pixels = lms.pixels();
        let positions = lms.positions();

        assert_eq!(pixels.len(), positions.len());
        for (i, (p, x)) in pixels.iter().zip(&positions).enumerate() {
            assert_eq!(p.x, i as f64);
            assert_eq!(x.z, 10.0 + i as f64);
        }
    }

    #[test]
    fn test_retain_tracked_updates_and_drops() {
        let mut lms = landmarks(4);
        let tracked = [
            Some(Point2::new(5.0, 5.0)),
            None,
            Some(Point2::new(7.0, 7.0)),
            None,
        ];

        let removed = lms.retain_tracked(&tracked);

        assert_eq!(removed, 2);
        assert_eq!(lms.len(), 2);
        assert_eq!(lms.pixels(), vec![Point2::new(5.0, 5.0), Point2::new(7.0, 7.0)]);
        assert_eq!(
            lms.positions(),
            vec![Vector3::new(0.0, 0.0, 10.0), Vector3::new(0.0, 0.0, 12.0)]
        );
    }

    #[test]
    fn test_retain_tracked_short_input_drops_tail() {
        let mut lms = landmarks(3);
        let removed = lms.retain_tracked(&[Some(Point2::new(1.0, 1.0))]);

        assert_eq!(removed, 2);
        assert_eq!(lms.len(), 1);
        assert_eq!(lms.pixels().len(), lms.positions().len());
    }

    #[test]
    fn test_with_pose_keeps_landmarks() {
        let state = VoState::new(landmarks(3), SE3::identity());
        let pose = SE3 {
            translation: Vector3::new(1.0, 2.0, 3.0),
            ..SE3::identity()
        };
        let moved = state.clone().with_pose(pose);

        assert_eq!(moved.landmarks, state.landmarks);
        assert_eq!(moved.pose, pose);
    }
}

//! FAST corners ranked by Harris response, with BRIEF descriptors.

use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use nalgebra::Point2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Half size of the square patch BRIEF samples from.
pub const PATCH_RADIUS: i32 = 15;

const HARRIS_K: f32 = 0.04;
const HARRIS_RADIUS: i32 = 3;
const PATTERN_SEED: u64 = 0x0b51_ef00;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// FAST intensity threshold.
    pub fast_threshold: u8,
    /// Side of the non-maximum suppression cells, in pixels.
    pub nms_cell_size: u32,
    pub max_features: usize,
    /// Gaussian smoothing applied before sampling BRIEF tests.
    pub blur_sigma: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            nms_cell_size: 8,
            max_features: 2000,
            blur_sigma: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub position: Point2<f64>,
    /// Harris response; larger is stronger.
    pub response: f32,
}

/// 256 binary intensity tests packed into four words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BriefDescriptor(pub [u64; 4]);

impl BriefDescriptor {
    pub fn hamming_distance(&self, other: &Self) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints with their descriptors, index-aligned and sorted strongest first.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<BriefDescriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = Point2<f64>> + '_ {
        self.keypoints.iter().map(|kp| kp.position)
    }

    pub fn push(&mut self, keypoint: KeyPoint, descriptor: BriefDescriptor) {
        self.keypoints.push(keypoint);
        self.descriptors.push(descriptor);
    }
}

/// Fixed BRIEF sampling pattern.
pub struct BriefExtractor {
    pattern: Vec<(i32, i32, i32, i32)>,
}

impl Default for BriefExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl BriefExtractor {
    /// Test pairs drawn from an isotropic Gaussian (σ = S/5 for an S×S patch),
    /// clipped to the patch. The seed is fixed so descriptors are comparable
    /// across runs.
    pub fn new() -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(PATTERN_SEED);
        let sigma = (2 * PATCH_RADIUS + 1) as f64 / 5.0;
        let mut gaussian = || {
            // Irwin–Hall approximation of a unit normal.
            let z: f64 = (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0;
            ((z * sigma).round() as i32).clamp(-PATCH_RADIUS, PATCH_RADIUS)
        };
        let pattern = (0..256)
            .map(|_| (gaussian(), gaussian(), gaussian(), gaussian()))
            .collect();
        Self { pattern }
    }

    /// Descriptor of a keypoint on a pre-smoothed image, `None` near the border.
    pub fn compute(&self, smoothed: &GrayImage, position: &Point2<f64>) -> Option<BriefDescriptor> {
        let (width, height) = smoothed.dimensions();
        let cx = position.x.round() as i32;
        let cy = position.y.round() as i32;
        if cx < PATCH_RADIUS
            || cy < PATCH_RADIUS
            || cx >= width as i32 - PATCH_RADIUS
            || cy >= height as i32 - PATCH_RADIUS
        {
            return None;
        }

        let mut words = [0u64; 4];
        for (i, &(x1, y1, x2, y2)) in self.pattern.iter().enumerate() {
            let a = smoothed.get_pixel((cx + x1) as u32, (cy + y1) as u32).0[0];
            let b = smoothed.get_pixel((cx + x2) as u32, (cy + y2) as u32).0[0];
            if a < b {
                words[i / 64] |= 1 << (i % 64);
            }
        }
        Some(BriefDescriptor(words))
    }
}

/// Detects keypoints and describes them.
pub struct FeatureExtractor {
    config: FeatureConfig,
    brief: BriefExtractor,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            config,
            brief: BriefExtractor::new(),
        }
    }

    /// FAST-9 corners, one per NMS cell, strongest `max_features` kept.
    pub fn detect(&self, image: &GrayImage) -> Vec<KeyPoint> {
        let (width, height) = image.dimensions();
        let margin = (HARRIS_RADIUS + 1) as u32;
        if width <= 2 * margin || height <= 2 * margin {
            return Vec::new();
        }

        let cell = self.config.nms_cell_size.max(1);
        let cols = width.div_ceil(cell) as usize;
        let rows = height.div_ceil(cell) as usize;
        let mut best: Vec<Option<KeyPoint>> = vec![None; cols * rows];

        for corner in corners_fast9(image, self.config.fast_threshold) {
            if corner.x < margin
                || corner.y < margin
                || corner.x >= width - margin
                || corner.y >= height - margin
            {
                continue;
            }
            let response = harris_response(image, corner.x as i32, corner.y as i32);
            let slot = &mut best[(corner.y / cell) as usize * cols + (corner.x / cell) as usize];
            if slot.map_or(true, |kp| response > kp.response) {
                *slot = Some(KeyPoint {
                    position: Point2::new(corner.x as f64, corner.y as f64),
                    response,
                });
            }
        }

        let mut keypoints: Vec<KeyPoint> = best.into_iter().flatten().collect();
        keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
        keypoints.truncate(self.config.max_features);
        keypoints
    }

    /// Detect and describe. Keypoints too close to the border for a
    /// descriptor are dropped.
    pub fn extract(&self, image: &GrayImage) -> FeatureSet {
        let smoothed = gaussian_blur_f32(image, self.config.blur_sigma);
        let mut features = FeatureSet::default();
        for kp in self.detect(image) {
            if let Some(descriptor) = self.brief.compute(&smoothed, &kp.position) {
                features.push(kp, descriptor);
            }
        }
        features
    }
}

/// `det(M) - k trace(M)²` of the structure tensor over a 7x7 window.
fn harris_response(image: &GrayImage, x: i32, y: i32) -> f32 {
    let at = |px: i32, py: i32| image.get_pixel(px as u32, py as u32).0[0] as f32;
    let (mut sxx, mut syy, mut sxy) = (0.0f32, 0.0f32, 0.0f32);
    for dy in -HARRIS_RADIUS..=HARRIS_RADIUS {
        for dx in -HARRIS_RADIUS..=HARRIS_RADIUS {
            let (px, py) = (x + dx, y + dy);
            let ix = 0.5 * (at(px + 1, py) - at(px - 1, py));
            let iy = 0.5 * (at(px, py + 1) - at(px, py - 1));
            sxx += ix * ix;
            syy += iy * iy;
            sxy += ix * iy;
        }
    }
    let trace = sxx + syy;
    sxx * syy - sxy * sxy - HARRIS_K * trace * trace
}

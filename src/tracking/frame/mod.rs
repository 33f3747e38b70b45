//! Per-frame data: camera model, features and their spatial index.

pub mod camera;
pub mod features;
pub mod grid;
pub mod pyramid;

use std::cell::OnceCell;

use image::GrayImage;

pub use camera::CameraModel;
pub use features::{BriefDescriptor, FeatureConfig, FeatureExtractor, FeatureSet, KeyPoint};
pub use grid::FeatureGrid;
pub use pyramid::ImagePyramid;

/// An input image with the features extracted from it.
pub struct Frame {
    /// Position in the input sequence.
    pub index: usize,
    pub image: GrayImage,
    pub features: FeatureSet,
    /// Spatial index over `features.keypoints`.
    pub grid: FeatureGrid,
    pyramid: OnceCell<ImagePyramid>,
}

impl Frame {
    pub fn new(index: usize, image: GrayImage, extractor: &FeatureExtractor) -> Self {
        let features = extractor.extract(&image);
        Self::from_parts(index, image, features)
    }

    /// Assemble a frame from already extracted features.
    pub fn from_parts(index: usize, image: GrayImage, features: FeatureSet) -> Self {
        let (width, height) = image.dimensions();
        let grid = FeatureGrid::new(features.positions(), width, height);
        Self {
            index,
            image,
            features,
            grid,
            pyramid: OnceCell::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Image pyramid, built on first use and shared by every later caller.
    /// The depth of the first request is kept.
    pub fn pyramid(&self, levels: usize) -> &ImagePyramid {
        self.pyramid
            .get_or_init(|| ImagePyramid::build(&self.image, levels))
    }
}

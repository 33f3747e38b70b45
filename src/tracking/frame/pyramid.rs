//! Gaussian image pyramid.

use image::imageops::{resize, FilterType};
use image::GrayImage;
use imageproc::filter::gaussian_blur_f32;

/// Coarser levels stop before either side drops below this.
const MIN_LEVEL_SIDE: u32 = 8;

/// Blurred and halved copies of an image, finest level first.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    pub levels: Vec<GrayImage>,
}

impl ImagePyramid {
    pub fn build(image: &GrayImage, levels: usize) -> Self {
        let mut pyramid = vec![image.clone()];
        for _ in 1..levels.max(1) {
            let Some(last) = pyramid.last() else { break };
            let (w, h) = (last.width() / 2, last.height() / 2);
            if w < MIN_LEVEL_SIDE || h < MIN_LEVEL_SIDE {
                break;
            }
            let next = resize(&gaussian_blur_f32(last, 1.0), w, h, FilterType::Triangle);
            pyramid.push(next);
        }
        Self { levels: pyramid }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

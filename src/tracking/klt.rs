//! Pyramidal Lucas–Kanade point tracking with a forward–backward check.

use image::GrayImage;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::tracking::frame::{Frame, ImagePyramid};
use crate::tracking::point_tracker::PointTracker;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KltConfig {
    /// Half width of the square integration window.
    pub window_radius: i32,
    /// Pyramid levels including the full-resolution image.
    pub levels: usize,
    pub max_iterations: usize,
    /// Stop iterating once the update is shorter than this, in pixels.
    pub epsilon: f64,
    /// Minimum eigenvalue of the per-pixel structure tensor.
    pub min_eigenvalue: f64,
    /// Largest forward–backward round-trip error, in pixels.
    pub max_fb_error: f64,
}

impl Default for KltConfig {
    fn default() -> Self {
        Self {
            window_radius: 7,
            levels: 3,
            max_iterations: 30,
            epsilon: 0.01,
            min_eigenvalue: 0.1,
            max_fb_error: 1.0,
        }
    }
}

/// Bilinear intensity lookup, clamped to the image.
fn sample(image: &GrayImage, x: f64, y: f64) -> f64 {
    let (w, h) = image.dimensions();
    let x = x.clamp(0.0, (w - 1) as f64);
    let y = y.clamp(0.0, (h - 1) as f64);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let p = |px: u32, py: u32| image.get_pixel(px, py).0[0] as f64;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

fn inside(image: &GrayImage, p: &Point2<f64>, margin: f64) -> bool {
    p.x >= margin
        && p.y >= margin
        && p.x <= image.width() as f64 - 1.0 - margin
        && p.y <= image.height() as f64 - 1.0 - margin
}

pub struct KltTracker {
    config: KltConfig,
}

impl Default for KltTracker {
    fn default() -> Self {
        Self::new(KltConfig::default())
    }
}

impl KltTracker {
    pub fn new(config: KltConfig) -> Self {
        Self { config }
    }

    /// Track one point from `from` to `to`; `None` when the window is
    /// untextured or leaves the image.
    fn track_point(
        &self,
        from: &ImagePyramid,
        to: &ImagePyramid,
        point: &Point2<f64>,
    ) -> Option<Point2<f64>> {
        let levels = from.len().min(to.len());
        let r = self.config.window_radius;
        let n = ((2 * r + 1) * (2 * r + 1)) as f64;
        let mut guess = Vector2::zeros();

        for level in (0..levels).rev() {
            let prev = &from.levels[level];
            let next = &to.levels[level];
            let scale = f64::from(1u32 << level);
            let p = point / scale;
            if !inside(prev, &p, 1.0) {
                return None;
            }

            // Template and gradients around p.
            let mut template = Vec::with_capacity(n as usize);
            let (mut gxx, mut gxy, mut gyy) = (0.0, 0.0, 0.0);
            for dy in -r..=r {
                for dx in -r..=r {
                    let (x, y) = (p.x + dx as f64, p.y + dy as f64);
                    let ix = 0.5 * (sample(prev, x + 1.0, y) - sample(prev, x - 1.0, y));
                    let iy = 0.5 * (sample(prev, x, y + 1.0) - sample(prev, x, y - 1.0));
                    gxx += ix * ix;
                    gxy += ix * iy;
                    gyy += iy * iy;
                    template.push((sample(prev, x, y), ix, iy));
                }
            }
            let det = gxx * gyy - gxy * gxy;
            let trace = gxx + gyy;
            let min_eig = 0.5 * (trace - (trace * trace - 4.0 * det).max(0.0).sqrt());
            if min_eig / n < self.config.min_eigenvalue || det.abs() < f64::EPSILON {
                return None;
            }

            let mut flow = Vector2::zeros();
            for _ in 0..self.config.max_iterations {
                let q = p + guess + flow;
                if !inside(next, &q, 0.0) {
                    return None;
                }
                let (mut bx, mut by) = (0.0, 0.0);
                let mut k = 0;
                for dy in -r..=r {
                    for dx in -r..=r {
                        let (value, ix, iy) = template[k];
                        k += 1;
                        let diff = value - sample(next, q.x + dx as f64, q.y + dy as f64);
                        bx += ix * diff;
                        by += iy * diff;
                    }
                }
                let step = Vector2::new(gyy * bx - gxy * by, gxx * by - gxy * bx) / det;
                flow += step;
                if step.norm() < self.config.epsilon {
                    break;
                }
            }

            guess += flow;
            if level > 0 {
                guess *= 2.0;
            }
        }

        let tracked = point + guess;
        inside(&to.levels[0], &tracked, 0.0).then_some(tracked)
    }
}

impl PointTracker for KltTracker {
    fn track(&self, prev: &Frame, curr: &Frame, points: &[Point2<f64>]) -> Vec<Option<Point2<f64>>> {
        if points.is_empty() {
            return Vec::new();
        }
        let from = prev.pyramid(self.config.levels);
        let to = curr.pyramid(self.config.levels);
        points
            .iter()
            .map(|p| {
                let forward = self.track_point(from, to, p)?;
                let backward = self.track_point(to, from, &forward)?;
                ((backward - p).norm() <= self.config.max_fb_error).then_some(forward)
            })
            .collect()
    }
}

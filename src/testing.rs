//! Synthetic scenes shared by the unit tests.

use image::GrayImage;
use nalgebra::{Point2, UnitQuaternion, Vector2, Vector3};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::geometry::SE3;
use crate::tracking::frame::{BriefDescriptor, CameraModel, FeatureSet, Frame, KeyPoint};
use crate::tracking::point_tracker::PointTracker;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;

pub fn camera() -> CameraModel {
    CameraModel::new(500.0, 500.0, 320.0, 240.0)
}

/// Static point cloud observed by a sequence of `T_wc` poses.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub camera: CameraModel,
    pub points: Vec<Vector3<f64>>,
    pub poses: Vec<SE3>,
}

impl SyntheticScene {
    /// Two cameras with a 1 m sideways baseline and a small rotation.
    pub fn two_view(seed: u64, num_points: usize) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let poses = vec![
            SE3::identity(),
            SE3 {
                rotation: UnitQuaternion::from_euler_angles(0.01, -0.03, 0.005),
                translation: Vector3::new(1.0, 0.0, 0.0),
            },
        ];
        let points = (0..num_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-3.0..4.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(6.0..20.0),
                )
            })
            .collect();
        Self {
            camera: camera(),
            points,
            poses,
        }
    }

    /// Camera sliding along +x by `step` per frame in front of a wide wall of
    /// points.
    pub fn sideways(seed: u64, num_points: usize, num_frames: usize, step: f64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let span = step * num_frames as f64;
        let poses = (0..num_frames)
            .map(|i| SE3 {
                rotation: UnitQuaternion::identity(),
                translation: Vector3::new(step * i as f64, 0.0, 0.0),
            })
            .collect();
        let points = (0..num_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-6.0..span + 6.0),
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(8.0..16.0),
                )
            })
            .collect();
        Self {
            camera: camera(),
            points,
            poses,
        }
    }

    /// Pixel of a world point in a frame, `None` behind the camera.
    pub fn project(&self, frame: usize, point: &Vector3<f64>) -> Option<Point2<f64>> {
        let p_cam = self.poses[frame].inverse().transform_point(point);
        self.camera.project(&p_cam)
    }

    /// Pixel of a world point if it falls inside the image.
    pub fn visible(&self, frame: usize, point: &Vector3<f64>) -> Option<Point2<f64>> {
        self.project(frame, point).filter(|px| {
            px.x >= 0.0 && px.y >= 0.0 && px.x < WIDTH as f64 && px.y < HEIGHT as f64
        })
    }

    pub fn normalized(&self, frame: usize, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.project(frame, point).map(|px| self.camera.normalize(&px))
    }

    /// Noisy observation of point `id` in `frame`. The noise depends only on
    /// `(frame, id)`, so repeated calls agree.
    pub fn observe(&self, frame: usize, id: usize, sigma: f64) -> Option<Point2<f64>> {
        let pixel = self.visible(frame, &self.points[id])?;
        if sigma <= 0.0 {
            return Some(pixel);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(((frame as u64) << 32) | id as u64);
        Some(pixel + pixel_noise(&mut rng, sigma))
    }

    /// A frame whose keypoints are the visible scene points, each carrying
    /// the descriptor of its point id.
    pub fn frame(&self, frame: usize, sigma: f64) -> Frame {
        let mut features = FeatureSet::default();
        for id in 0..self.points.len() {
            if let Some(position) = self.observe(frame, id, sigma) {
                features.push(
                    KeyPoint {
                        position,
                        response: 1.0,
                    },
                    point_descriptor(id),
                );
            }
        }
        Frame::from_parts(frame, GrayImage::new(WIDTH, HEIGHT), features)
    }
}

pub fn point_descriptor(id: usize) -> BriefDescriptor {
    BriefDescriptor(ChaCha8Rng::seed_from_u64(id as u64 + 1).gen())
}

/// Tracker with perfect data association: a pixel of the previous frame is
/// identified with the scene point observed there and re-observed in the
/// current frame. `Frame::index` selects the scene pose.
pub struct SceneTracker {
    /// `observations[frame][id]`.
    observations: Vec<Vec<Option<Point2<f64>>>>,
}

impl SceneTracker {
    pub fn new(scene: &SyntheticScene, sigma: f64) -> Self {
        let observations = (0..scene.poses.len())
            .map(|frame| {
                (0..scene.points.len())
                    .map(|id| scene.observe(frame, id, sigma))
                    .collect()
            })
            .collect();
        Self { observations }
    }

    fn identify(&self, frame: usize, pixel: &Point2<f64>) -> Option<usize> {
        self.observations.get(frame)?.iter().position(|observed| {
            observed.is_some_and(|o| (o - pixel).norm_squared() < 1e-12)
        })
    }
}

impl PointTracker for SceneTracker {
    fn track(&self, prev: &Frame, curr: &Frame, points: &[Point2<f64>]) -> Vec<Option<Point2<f64>>> {
        points
            .iter()
            .map(|p| {
                let id = self.identify(prev.index, p)?;
                *self.observations.get(curr.index)?.get(id)?
            })
            .collect()
    }
}

/// Zero-mean Gaussian-ish pixel noise from the sum of uniforms.
pub fn pixel_noise(rng: &mut ChaCha8Rng, sigma: f64) -> Vector2<f64> {
    let mut draw = || (0..4).map(|_| rng.gen_range(-1.0..1.0)).sum::<f64>() * sigma * 0.866;
    Vector2::new(draw(), draw())
}

/// Fronto-parallel textured rectangles at different depths, seen by a camera
/// with identity rotation sliding along +x. Every rectangle is covered by
/// random-intensity blocks that project to about `BLOCK_PX` pixels, so block
/// junctions give corners at every depth.
pub struct LayeredWorld {
    pub camera: CameraModel,
    pub width: u32,
    pub height: u32,
    /// Nearest first; the last one fills the background.
    layers: Vec<Layer>,
}

struct Layer {
    depth: f64,
    x: (f64, f64),
    y: (f64, f64),
    block: f64,
    seed: u64,
}

const BLOCK_PX: f64 = 8.0;

impl LayeredWorld {
    pub fn new() -> Self {
        let camera = CameraModel::new(250.0, 250.0, 160.0, 120.0);
        let layer = |depth: f64, x: (f64, f64), y: (f64, f64), seed: u64| Layer {
            depth,
            x,
            y,
            block: depth * BLOCK_PX / camera.fx,
            seed,
        };
        Self {
            camera,
            width: 320,
            height: 240,
            layers: vec![
                layer(5.0, (-2.6, -0.6), (-1.8, 0.6), 1),
                layer(7.0, (0.2, 3.4), (-0.6, 2.0), 2),
                layer(9.0, (-1.0, 2.5), (-3.5, -1.5), 3),
                layer(12.0, (-100.0, 100.0), (-100.0, 100.0), 4),
            ],
        }
    }

    /// Image seen from camera center `(x, 0, 0)`, 3x3 supersampled.
    pub fn render(&self, x: f64) -> GrayImage {
        const OFFSETS: [f64; 3] = [-1.0 / 3.0, 0.0, 1.0 / 3.0];
        GrayImage::from_fn(self.width, self.height, |u, v| {
            let mut sum = 0.0;
            for du in OFFSETS {
                for dv in OFFSETS {
                    let nx = (u as f64 + du - self.camera.cx) / self.camera.fx;
                    let ny = (v as f64 + dv - self.camera.cy) / self.camera.fy;
                    sum += self.intensity(x, nx, ny);
                }
            }
            image::Luma([(sum / 9.0).round() as u8])
        })
    }

    fn intensity(&self, x: f64, nx: f64, ny: f64) -> f64 {
        for layer in &self.layers {
            let (wx, wy) = (x + nx * layer.depth, ny * layer.depth);
            if wx < layer.x.0 || wx >= layer.x.1 || wy < layer.y.0 || wy >= layer.y.1 {
                continue;
            }
            let i = (wx / layer.block).floor() as i64 as u64;
            let j = (wy / layer.block).floor() as i64 as u64;
            let h = mix(layer.seed ^ i.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ j.wrapping_mul(0xc2b2_ae3d_27d4_eb4f));
            return 30.0 + (h % 200) as f64;
        }
        0.0
    }
}

/// splitmix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

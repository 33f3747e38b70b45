use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, Trim};
use image::GrayImage;
use nalgebra::{Matrix3, Matrix4};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

const KITTI_SEQUENCE: &str = "05";
const MALAGA_IMAGES: &str = "malaga-urban-dataset-extract-07_rectified_800x600_Images";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Kitti,
    Malaga,
    Parking,
}

impl DatasetKind {
    /// Frame pair the map is bootstrapped from when the run config does not
    /// name one.
    pub fn default_bootstrap_frames(self) -> [usize; 2] {
        match self {
            Self::Kitti => [0, 4],
            Self::Malaga | Self::Parking => [0, 2],
        }
    }
}

/// What the runner processes and where it writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset: DatasetKind,
    pub root: PathBuf,
    #[serde(default)]
    pub bootstrap_frames: Option<[usize; 2]>,
    /// Last frame to process (inclusive); defaults to the end of the sequence.
    #[serde(default)]
    pub last_frame: Option<usize>,
    /// YAML file with a `VoConfig`; defaults apply when absent.
    #[serde(default)]
    pub vo_config: Option<PathBuf>,
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

fn default_output() -> PathBuf {
    PathBuf::from("trajectory.csv")
}

impl RunConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn bootstrap_frames(&self) -> [usize; 2] {
        self.bootstrap_frames
            .unwrap_or_else(|| self.dataset.default_bootstrap_frames())
    }
}

/// An image sequence with its calibration and optional ground truth.
#[derive(Debug)]
pub struct Dataset {
    pub kind: DatasetKind,
    images: Vec<PathBuf>,
    pub camera: CameraModel,
    /// `T_wc` per frame, empty when the dataset ships none.
    pub groundtruth: Vec<SE3>,
}

impl Dataset {
    pub fn open<P: AsRef<Path>>(kind: DatasetKind, root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            bail!("Dataset root {} does not exist", root.display());
        }

        let (images, camera, groundtruth_path) = match kind {
            DatasetKind::Kitti => (
                list_images(&root.join(KITTI_SEQUENCE).join("image_0"), |name| {
                    name.ends_with(".png")
                })?,
                CameraModel::new(718.856, 718.856, 607.1928, 185.2157),
                Some(root.join("poses").join(format!("{KITTI_SEQUENCE}.txt"))),
            ),
            DatasetKind::Malaga => (
                list_images(&root.join(MALAGA_IMAGES), |name| name.ends_with("_left.png"))?,
                CameraModel::new(621.18428, 621.18428, 404.0076, 309.05989),
                None,
            ),
            DatasetKind::Parking => (
                list_images(&root.join("images"), |name| {
                    name.starts_with("img_") && name.ends_with(".png")
                })?,
                load_camera(&root.join("K.txt"))?,
                Some(root.join("poses.txt")),
            ),
        };
        if images.is_empty() {
            bail!("No images found for {:?} under {}", kind, root.display());
        }

        let groundtruth = match groundtruth_path {
            Some(path) => load_groundtruth(&path).unwrap_or_else(|e| {
                warn!("Could not load ground truth: {:#}. Continuing without it.", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        Ok(Self {
            kind,
            images,
            camera,
            groundtruth,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn load_frame(&self, idx: usize) -> Result<GrayImage> {
        let path = self
            .images
            .get(idx)
            .with_context(|| format!("No frame at index {}", idx))?;
        let image = image::open(path).with_context(|| format!("Failed to read image {:?}", path))?;
        Ok(image.into_luma8())
    }

    pub fn groundtruth_pose(&self, idx: usize) -> Option<&SE3> {
        self.groundtruth.get(idx)
    }
}

fn list_images(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;
    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let keep_it = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(&keep);
        if keep_it {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Numbers of a small text matrix separated by commas and/or whitespace.
fn parse_numbers(text: &str) -> Result<Vec<f64>> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .with_context(|| format!("Invalid number {:?}", s))
        })
        .collect()
}

pub fn parse_camera(text: &str) -> Result<CameraModel> {
    let values = parse_numbers(text)?;
    if values.len() != 9 {
        bail!("Expected 9 intrinsics entries, found {}", values.len());
    }
    let k = Matrix3::from_row_slice(&values);
    if k[(0, 0)] <= 0.0 || k[(1, 1)] <= 0.0 {
        bail!("Focal lengths must be positive");
    }
    Ok(CameraModel::from_k(&k))
}

fn load_camera(path: &Path) -> Result<CameraModel> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_camera(&text).with_context(|| format!("Invalid calibration in {}", path.display()))
}

/// Rows of a row-major 3x4 `[R | t]` per frame (KITTI pose format).
fn load_groundtruth(path: &Path) -> Result<Vec<SE3>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut poses = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let values: Vec<f64> = rec
            .iter()
            .filter(|field| !field.is_empty())
            .map(|field| field.parse::<f64>())
            .collect::<std::result::Result<_, _>>()?;
        if values.len() < 12 {
            continue;
        }
        let mut m = Matrix4::identity();
        for r in 0..3 {
            for c in 0..4 {
                m[(r, c)] = values[r * 4 + c];
            }
        }
        poses.push(SE3::from_matrix(m));
    }
    Ok(poses)
}

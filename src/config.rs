//! Odometry configuration, loadable from YAML.
//!
//! Every section falls back to its defaults, so a file only needs the values
//! it changes:
//!
//! ```yaml
//! tracker: descriptor
//! bootstrap:
//!   min_parallax_deg: 2.0
//! triangulation:
//!   min_track_length: 3
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::PnpConfig;
use crate::tracking::frame::FeatureConfig;
use crate::tracking::{
    BootstrapConfig, DescriptorTrackerConfig, KltConfig, LandmarkTrackerConfig, TriangulationConfig,
};

/// Point tracker used for landmarks and candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    #[default]
    Klt,
    Descriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoConfig {
    pub features: FeatureConfig,
    pub tracker: TrackerKind,
    pub klt: KltConfig,
    pub descriptor_tracker: DescriptorTrackerConfig,
    pub bootstrap: BootstrapConfig,
    pub landmarks: LandmarkTrackerConfig,
    pub pnp: PnpConfig,
    pub triangulation: TriangulationConfig,
}

impl VoConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Invalid odometry configuration")
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize odometry configuration")
    }
}

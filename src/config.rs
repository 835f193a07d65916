//! Runtime configuration, loadable from YAML.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::detection::DetectionFilterConfig;
use crate::geometry::PnpConfig;
use crate::tracking::KltConfig;

/// How far (ns) the matched color/depth frame may lag behind a detection.
pub const FRAME_MATCH_STALENESS_NS: u64 = 500_000_000;

/// Top-level tracker configuration. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub camera_info_topic: String,
    pub image_topic: String,
    pub depth_topic: String,

    /// A tracked pose is accepted only with strictly more inliers than this.
    pub min_tracking_inliers: usize,
    /// A tracked pose is accepted only with mean reprojection error strictly below this.
    pub max_tracking_reproj_error: f64,

    pub klt: KltConfig,
    pub pnp: PnpConfig,
    pub detection: DetectionFilterConfig,

    /// Directory holding `<model>.obj` meshes.
    pub mesh_dir: PathBuf,
    pub models: Vec<String>,
    /// Parent frame of broadcast object transforms.
    pub camera_frame: String,
    pub visualize: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            camera_info_topic: "/camera/camera_info".to_string(),
            image_topic: "/camera/image_raw".to_string(),
            depth_topic: "/camera/depth_registered/image_raw".to_string(),
            min_tracking_inliers: 8,
            max_tracking_reproj_error: 3.0,
            klt: KltConfig::default(),
            pnp: PnpConfig::default(),
            detection: DetectionFilterConfig::default(),
            mesh_dir: PathBuf::from("data/mesh/"),
            models: vec!["drill".to_string()],
            camera_frame: "camera_rgb_optical_frame".to_string(),
            visualize: false,
        }
    }
}

impl TrackerConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse tracker config")
    }

    /// Path of the mesh file for `model`.
    pub fn mesh_path(&self, model: &str) -> PathBuf {
        self.mesh_dir.join(format!("{model}.obj"))
    }
}

//! Rerun-based visualization for object pose tracking.
//!
//! Entity hierarchy:
//!     status                    - Tracked objects and gate outcomes
//!     camera/
//!         image                 - Live color frame (grayscale)
//!         image/<model>/axes    - Projected X/Y/Z pose axes (red/green/blue)
//!         image/<model>/points  - Tracked keypoints (green accepted, orange rejected)
//!         seed/<model>          - Silhouette mask used for the last seeding
//!     world/
//!         <name>                - Broadcast object transforms
//!     plots/
//!         <model>/inliers       - PnP inlier count
//!         <model>/reproj_error  - Mean inlier reprojection error

use anyhow::{Context, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use rerun::{RecordingStream, external::glam};
use tracing::warn;

use crate::detection::StampedTransform;
use crate::geometry::{SE3, SilhouetteMask, project_axes};
use crate::tracking::frame::{CameraModel, to_grayscale};
use crate::tracking::result::{GateOutcome, ObjectUpdate};

const AXIS_COLORS: [[u8; 3]; 3] = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];
const ACCEPTED_COLOR: [u8; 3] = [0, 255, 0];
const REJECTED_COLOR: [u8; 3] = [255, 140, 0];

pub struct RerunVisualizer {
    rec: RecordingStream,
    start_timestamp_ns: Option<u64>,
}

impl RerunVisualizer {
    /// Spawn a viewer process and connect to it.
    pub fn new(app_name: &str) -> Result<Self> {
        let rec = rerun::RecordingStreamBuilder::new(app_name)
            .spawn()
            .context("Failed to spawn rerun viewer")?;
        Ok(Self::from_stream(rec))
    }

    pub fn from_stream(rec: RecordingStream) -> Self {
        rec.log_static("world", &rerun::ViewCoordinates::RDF()).ok();
        Self {
            rec,
            start_timestamp_ns: None,
        }
    }

    /// Set the current timestamp for all subsequent logs (relative to the first frame).
    pub fn set_time(&mut self, timestamp_ns: u64) {
        let start_ns = *self.start_timestamp_ns.get_or_insert(timestamp_ns);
        let relative_sec = timestamp_ns.saturating_sub(start_ns) as f64 / 1e9;
        self.rec.set_duration_secs("time", relative_sec);
    }

    /// Log the live color frame.
    pub fn log_image(&self, image: &Mat) {
        let data = to_grayscale(image)
            .map_err(anyhow::Error::from)
            .and_then(|gray| Ok(mat_to_image_data(&gray)?));
        match data {
            Ok((data, width, height)) => {
                self.rec
                    .log("camera/image", &rerun::Image::from_l8(data, [width, height]))
                    .ok();
            }
            Err(e) => warn!("Failed to log image: {}", e),
        }
    }

    /// Log the seeding mask of `model`.
    pub fn log_seed_mask(&self, model: &str, mask: &SilhouetteMask) {
        self.rec
            .log(
                format!("camera/seed/{model}"),
                &rerun::Image::from_l8(mask.as_bytes().to_vec(), [mask.width, mask.height]),
            )
            .ok();
    }

    /// Log keypoints, pose axes and gate statistics for one object update.
    pub fn log_object_update(&self, update: &ObjectUpdate, camera: &CameraModel) {
        let model = &update.model;
        let color = if update.outcome.is_accepted() {
            ACCEPTED_COLOR
        } else {
            REJECTED_COLOR
        };

        let points: Vec<[f32; 2]> = update.points.points2d.iter().map(|p| [p.x, p.y]).collect();
        self.rec
            .log(
                format!("camera/image/{model}/points"),
                &rerun::Points2D::new(points)
                    .with_colors([color])
                    .with_radii([3.0f32]),
            )
            .ok();

        if let Some(axes) = update.pose.as_ref().and_then(|pose| project_axes(pose, camera)) {
            let o = [axes.origin.x as f32, axes.origin.y as f32];
            let strips: Vec<Vec<[f32; 2]>> = [axes.x, axes.y, axes.z]
                .iter()
                .map(|tip| vec![o, [tip.x as f32, tip.y as f32]])
                .collect();
            self.rec
                .log(
                    format!("camera/image/{model}/axes"),
                    &rerun::LineStrips2D::new(strips)
                        .with_colors(AXIS_COLORS)
                        .with_radii([1.5f32]),
                )
                .ok();
        }

        if let GateOutcome::Accepted {
            inliers,
            reproj_error,
        }
        | GateOutcome::Rejected {
            inliers,
            reproj_error,
        } = update.outcome
        {
            self.rec
                .log(
                    format!("plots/{model}/inliers"),
                    &rerun::Scalars::new([inliers as f64]),
                )
                .ok();
            self.rec
                .log(
                    format!("plots/{model}/reproj_error"),
                    &rerun::Scalars::new([reproj_error]),
                )
                .ok();
        }
    }

    /// Log a status line summarizing the latest updates.
    pub fn log_status(&self, updates: &[ObjectUpdate]) {
        let parts: Vec<String> = updates
            .iter()
            .map(|u| {
                let outcome = match u.outcome {
                    GateOutcome::Accepted { inliers, reproj_error } => {
                        format!("**OK** {inliers} inl / {reproj_error:.2}px")
                    }
                    GateOutcome::Rejected { inliers, reproj_error } => {
                        format!("rejected {inliers} inl / {reproj_error:.2}px")
                    }
                    GateOutcome::SolverFailed => "no pose".to_string(),
                };
                format!("{}: {} tracks, {}", u.model, u.points.len(), outcome)
            })
            .collect();

        self.rec
            .log(
                "status",
                &rerun::TextDocument::new(parts.join(" | "))
                    .with_media_type(rerun::MediaType::markdown()),
            )
            .ok();
    }

    /// Log broadcast object transforms in the camera frame.
    pub fn log_object_transforms(&self, transforms: &[StampedTransform]) {
        for t in transforms {
            let (translation, rotation) = to_glam(&t.transform);
            self.rec
                .log(
                    format!("world/{}", t.child),
                    &rerun::Transform3D::from_translation_rotation(translation, rotation)
                        .with_axis_length(0.1),
                )
                .ok();
        }
    }
}

fn to_glam(pose: &SE3) -> (glam::Vec3, glam::Quat) {
    let translation = glam::Vec3::new(
        pose.translation.x as f32,
        pose.translation.y as f32,
        pose.translation.z as f32,
    );
    let rotation = glam::Quat::from_xyzw(
        pose.rotation.coords.x as f32,
        pose.rotation.coords.y as f32,
        pose.rotation.coords.z as f32,
        pose.rotation.w as f32,
    );
    (translation, rotation)
}

/// Convert OpenCV Mat to image data (bytes, width, height)
fn mat_to_image_data(mat: &Mat) -> Result<(Vec<u8>, u32, u32), opencv::Error> {
    let rows = mat.rows() as u32;
    let cols = mat.cols() as u32;
    let data = mat.data_bytes()?.to_vec();
    Ok((data, cols, rows))
}

//! Per-object KLT keypoint tracking.
//!
//! A tracker is seeded from a silhouette mask and a depth map: Shi-Tomasi
//! corners inside the mask are lifted to 3D through the depth map and
//! stored in the object frame. From then on the 2D positions are advanced
//! frame-to-frame with pyramidal Lucas-Kanade flow while the 3D positions
//! stay fixed, giving the 2D-3D correspondences for PnP.

use nalgebra::Vector3;
use opencv::core::{Mat, Point2f, Size, TermCriteria, Vector};
use opencv::prelude::*;
use opencv::{imgproc, video};
use serde::Deserialize;
use tracing::debug;

use crate::error::Result;
use crate::geometry::{SE3, SilhouetteMask};
use crate::tracking::frame::{CameraModel, StampedImage, depth_at, to_grayscale};

/// Corner detection and optical-flow parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KltConfig {
    pub max_corners: i32,
    pub quality_level: f64,
    pub min_distance: f64,
    pub block_size: i32,
    /// Side length of the LK search window, in pixels.
    pub window_size: i32,
    pub max_pyramid_level: i32,
    pub max_iterations: i32,
    pub epsilon: f64,
    pub min_eigen_threshold: f64,
}

impl Default for KltConfig {
    fn default() -> Self {
        Self {
            max_corners: 500,
            quality_level: 0.01,
            min_distance: 5.0,
            block_size: 3,
            window_size: 21,
            max_pyramid_level: 3,
            max_iterations: 30,
            epsilon: 0.01,
            min_eigen_threshold: 1e-4,
        }
    }
}

/// Current track set: parallel arrays indexed by track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedPoints {
    pub ids: Vec<u64>,
    pub points2d: Vec<Point2f>,
    /// Positions in the object frame.
    pub points3d: Vec<Vector3<f64>>,
}

impl TrackedPoints {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Keep only the tracks for which `keep[i]` is true, moving 2D points to `moved`.
    fn retain_moved(&mut self, moved: &[Point2f], keep: &[bool]) {
        let mut ids = Vec::with_capacity(self.ids.len());
        let mut points2d = Vec::with_capacity(self.ids.len());
        let mut points3d = Vec::with_capacity(self.ids.len());
        for (i, (&k, &p)) in keep.iter().zip(moved).enumerate().take(self.ids.len()) {
            if k {
                ids.push(self.ids[i]);
                points2d.push(p);
                points3d.push(self.points3d[i]);
            }
        }
        self.ids = ids;
        self.points2d = points2d;
        self.points3d = points3d;
    }
}

/// Everything needed to seed a tracker from one detection.
pub struct SeedInput<'a> {
    /// Color frame matched to the detection timestamp.
    pub image: &'a StampedImage,
    /// Depth frame matched to the detection timestamp.
    pub depth: &'a Mat,
    pub camera: &'a CameraModel,
    /// Detected object pose (T_co).
    pub pose: &'a SE3,
    pub mask: &'a SilhouetteMask,
}

/// A 2D keypoint tracker with 3D object-frame anchors.
pub trait KeypointTracker: Send {
    /// Reseed from `seed`, then advance through `frames` (oldest first).
    ///
    /// Returns the number of surviving tracks.
    fn init_points_and_fastforward(
        &mut self,
        seed: SeedInput<'_>,
        frames: &[&StampedImage],
    ) -> Result<usize>;

    /// Advance all tracks to `image` and remember it as the last image.
    fn process_frame(&mut self, image: &StampedImage) -> Result<TrackedPoints>;

    fn last_image(&self) -> Option<&StampedImage>;

    fn has_tracking(&self) -> bool;

    fn tracked_points(&self) -> &TrackedPoints;
}

/// Pyramidal Lucas-Kanade tracker over OpenCV.
pub struct KltTracker {
    config: KltConfig,
    tracks: TrackedPoints,
    next_id: u64,
    /// Grayscale copy of the last image the tracks were advanced to.
    last_image: Option<StampedImage>,
    has_tracking: bool,
}

impl KltTracker {
    pub fn new(config: KltConfig) -> Self {
        Self {
            config,
            tracks: TrackedPoints::default(),
            next_id: 0,
            last_image: None,
            has_tracking: false,
        }
    }

    /// Corners inside the mask with valid depth, anchored in the object frame.
    ///
    /// Ids continue from `next_id`; nothing on `self` changes.
    fn detect_seed_points(&self, seed: &SeedInput<'_>, gray: &Mat) -> Result<TrackedPoints> {
        let mask = seed.mask.to_mat()?;
        let mut corners = Vector::<Point2f>::new();
        imgproc::good_features_to_track(
            gray,
            &mut corners,
            self.config.max_corners,
            self.config.quality_level,
            self.config.min_distance,
            &mask,
            self.config.block_size,
            false,
            0.04,
        )?;

        let pose_inv = seed.pose.inverse();
        let mut tracks = TrackedPoints::default();
        for corner in corners.iter() {
            let (x, y) = (corner.x.round() as i32, corner.y.round() as i32);
            let Some(z) = depth_at(seed.depth, x, y)? else {
                continue;
            };
            let p_cam = seed
                .camera
                .backproject(f64::from(corner.x), f64::from(corner.y), z);
            tracks.ids.push(self.next_id + tracks.ids.len() as u64);
            tracks.points2d.push(corner);
            tracks.points3d.push(pose_inv.transform_point(&p_cam));
        }

        debug!(
            corners = corners.len(),
            with_depth = tracks.len(),
            "Seeded keypoints"
        );
        Ok(tracks)
    }

    /// Advance the tracks from the last image to `frame`.
    fn step(&mut self, frame: &StampedImage) -> Result<()> {
        let gray = to_grayscale(&frame.image)?;
        if let Some(prev) = &self.last_image {
            advance_tracks(&self.config, &mut self.tracks, &prev.image, &gray)?;
        }
        self.last_image = Some(StampedImage::new(frame.timestamp_ns, gray));
        Ok(())
    }
}

/// Move `tracks` from `prev` to `next` with pyramidal LK, dropping lost points.
///
/// `tracks` is only modified once the flow computation has succeeded.
fn advance_tracks(config: &KltConfig, tracks: &mut TrackedPoints, prev: &Mat, next: &Mat) -> Result<()> {
    if tracks.is_empty() {
        return Ok(());
    }
    let prev_pts: Vector<Point2f> = tracks.points2d.iter().copied().collect();
    let mut next_pts = Vector::<Point2f>::new();
    let mut status = Vector::<u8>::new();
    let mut err = Vector::<f32>::new();
    let criteria = TermCriteria::new(
        opencv::core::TermCriteria_COUNT + opencv::core::TermCriteria_EPS,
        config.max_iterations,
        config.epsilon,
    )?;
    video::calc_optical_flow_pyr_lk(
        prev,
        next,
        &prev_pts,
        &mut next_pts,
        &mut status,
        &mut err,
        Size::new(config.window_size, config.window_size),
        config.max_pyramid_level,
        criteria,
        0,
        config.min_eigen_threshold,
    )?;

    let (cols, rows) = (next.cols() as f32, next.rows() as f32);
    let moved = next_pts.to_vec();
    let keep: Vec<bool> = status
        .iter()
        .zip(&moved)
        .map(|(s, p)| s == 1 && p.x >= 0.0 && p.y >= 0.0 && p.x < cols && p.y < rows)
        .collect();
    tracks.retain_moved(&moved, &keep);
    Ok(())
}

impl Default for KltTracker {
    fn default() -> Self {
        Self::new(KltConfig::default())
    }
}

impl KeypointTracker for KltTracker {
    fn init_points_and_fastforward(
        &mut self,
        seed: SeedInput<'_>,
        frames: &[&StampedImage],
    ) -> Result<usize> {
        // Build the new state aside so a failed reseed keeps the current tracks.
        let gray = to_grayscale(&seed.image.image)?;
        let mut tracks = self.detect_seed_points(&seed, &gray)?;
        let allocated = tracks.len() as u64;
        let mut last = StampedImage::new(seed.image.timestamp_ns, gray);

        for frame in frames {
            let next = to_grayscale(&frame.image)?;
            advance_tracks(&self.config, &mut tracks, &last.image, &next)?;
            last = StampedImage::new(frame.timestamp_ns, next);
        }

        self.next_id += allocated;
        self.tracks = tracks;
        self.last_image = Some(last);
        self.has_tracking = true;
        debug!(
            replayed = frames.len(),
            tracks = self.tracks.len(),
            "Fast-forwarded keypoints"
        );
        Ok(self.tracks.len())
    }

    fn process_frame(&mut self, image: &StampedImage) -> Result<TrackedPoints> {
        self.step(image)?;
        Ok(self.tracks.clone())
    }

    fn last_image(&self) -> Option<&StampedImage> {
        self.last_image.as_ref()
    }

    fn has_tracking(&self) -> bool {
        self.has_tracking
    }

    fn tracked_points(&self) -> &TrackedPoints {
        &self.tracks
    }
}

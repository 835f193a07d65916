//! Inbound event types.
//!
//! Producers (sensor drivers, detectors, sequence replay) send these to the
//! tracker's event thread over a channel; events from one producer are
//! handled in the order sent.

use crate::detection::DetectionBatch;
use crate::tracking::frame::{CameraModel, StampedImage};

/// Camera intrinsics as delivered by the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraInfo {
    /// Row-major 3x3 intrinsic matrix.
    pub k: [f64; 9],
    pub width: u32,
    pub height: u32,
}

impl CameraInfo {
    /// `None` if `k` is singular.
    pub fn to_camera_model(&self) -> Option<CameraModel> {
        CameraModel::from_row_major(self.k, self.width, self.height)
    }
}

#[derive(Debug)]
pub enum TrackerEvent {
    CameraInfo(CameraInfo),
    /// Color (1- or 3-channel) frame.
    Image(StampedImage),
    /// Depth frame, 16-bit millimetres or 32-bit float metres.
    Depth(StampedImage),
    Detections(DetectionBatch),
}

impl TrackerEvent {
    pub fn timestamp_ns(&self) -> Option<u64> {
        match self {
            Self::CameraInfo(_) => None,
            Self::Image(frame) | Self::Depth(frame) => Some(frame.timestamp_ns),
            Self::Detections(batch) => Some(batch.timestamp_ns),
        }
    }
}

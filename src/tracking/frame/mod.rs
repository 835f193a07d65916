//! Frame-level types: camera intrinsics, timestamped images and pixel access.

pub mod camera;

pub use camera::CameraModel;

use opencv::core::{CV_16UC1, CV_32FC1, CV_8UC1, Mat};
use opencv::imgproc;
use opencv::prelude::*;

use crate::error::{Result, TrackingError};

/// 16-bit depth maps store millimetres.
const DEPTH_U16_PER_METRE: f64 = 1000.0;

/// An image (color or depth) tagged with its capture time.
#[derive(Debug)]
pub struct StampedImage {
    /// Capture timestamp in nanoseconds.
    pub timestamp_ns: u64,
    pub image: Mat,
}

impl StampedImage {
    pub fn new(timestamp_ns: u64, image: Mat) -> Self {
        Self {
            timestamp_ns,
            image,
        }
    }

    /// Deep copy of the underlying pixel buffer.
    pub fn try_clone(&self) -> opencv::Result<Self> {
        Ok(Self {
            timestamp_ns: self.timestamp_ns,
            image: self.image.try_clone()?,
        })
    }
}

/// Single-channel 8-bit copy of a 1-, 3- or 4-channel image.
pub fn to_grayscale(image: &Mat) -> Result<Mat> {
    let code = match image.channels() {
        1 if image.typ() == CV_8UC1 => return Ok(image.try_clone()?),
        3 => imgproc::COLOR_BGR2GRAY,
        4 => imgproc::COLOR_BGRA2GRAY,
        _ => return Err(TrackingError::UnsupportedImage(image.typ())),
    };
    let mut gray = Mat::default();
    imgproc::cvt_color_def(image, &mut gray, code)?;
    Ok(gray)
}

/// Depth in metres at pixel `(x, y)`.
///
/// Accepts 16-bit millimetre and 32-bit float metre depth maps. Returns
/// `None` outside the image and for missing readings (zero, negative, NaN).
pub fn depth_at(depth: &Mat, x: i32, y: i32) -> Result<Option<f64>> {
    if x < 0 || y < 0 || x >= depth.cols() || y >= depth.rows() {
        return Ok(None);
    }
    let metres = match depth.typ() {
        CV_16UC1 => f64::from(*depth.at_2d::<u16>(y, x)?) / DEPTH_U16_PER_METRE,
        CV_32FC1 => f64::from(*depth.at_2d::<f32>(y, x)?),
        other => return Err(TrackingError::UnsupportedImage(other)),
    };
    Ok((metres.is_finite() && metres > 0.0).then_some(metres))
}

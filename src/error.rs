use thiserror::Error;

/// Failures inside the tracking core.
///
/// None of these is fatal to a session: the coordinator logs them and
/// carries on with the next object, detection or frame.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("camera intrinsics have not been received yet")]
    CameraNotSet,

    #[error("no frame within {bound_ns} ns at or after timestamp {stamp_ns}")]
    MissingFrame { stamp_ns: u64, bound_ns: u64 },

    #[error("no tracker registered for model '{0}'")]
    UnknownModel(String),

    #[error("a tracker for model '{0}' is already registered")]
    DuplicateModel(String),

    #[error("PnP requires at least {required} 2D-3D correspondences, got {actual}")]
    InsufficientCorrespondences { required: usize, actual: usize },

    #[error("mismatched correspondence lengths: {points3d} 3D vs {points2d} 2D")]
    MismatchedCorrespondences { points3d: usize, points2d: usize },

    #[error("PnP solver did not find a pose")]
    SolverFailed,

    #[error("unsupported image type {0}")]
    UnsupportedImage(i32),

    #[error("OpenCV: {0}")]
    OpenCv(#[from] opencv::Error),
}

pub type Result<T> = std::result::Result<T, TrackingError>;

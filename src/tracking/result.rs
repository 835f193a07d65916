//! Outcomes of seeding batches and per-frame updates.
//!
//! The coordinator never returns errors from its public operations; these
//! reports carry what happened, per object, for logging and visualization.

use crate::error::TrackingError;
use crate::geometry::{SE3, SilhouetteMask};
use crate::tracking::history::PruneCounts;
use crate::tracking::klt::TrackedPoints;

/// Result of gating one solver run.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Accepted { inliers: usize, reproj_error: f64 },
    Rejected { inliers: usize, reproj_error: f64 },
    /// The solver produced no pose (too few correspondences or no consensus).
    SolverFailed,
}

impl GateOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Per-object result of one live color frame.
#[derive(Debug, Clone)]
pub struct ObjectUpdate {
    pub model: String,
    pub timestamp_ns: u64,
    pub points: TrackedPoints,
    pub outcome: GateOutcome,
    /// Current pose after this update (unchanged unless accepted).
    pub pose: Option<SE3>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeededObject {
    pub model: String,
    pub num_tracks: usize,
    pub replayed_frames: usize,
    /// Silhouette the seed keypoints were sampled from.
    pub mask: SilhouetteMask,
}

#[derive(Debug)]
pub struct SkippedPose {
    pub model: String,
    pub reason: TrackingError,
}

/// What one detection batch did to the trackers and the history.
#[derive(Debug, Default)]
pub struct SeedingReport {
    pub timestamp_ns: u64,
    /// Set when the whole batch was skipped; nothing was mutated.
    pub aborted: Option<TrackingError>,
    pub seeded: Vec<SeededObject>,
    pub skipped: Vec<SkippedPose>,
    pub pruned: PruneCounts,
}

impl SeedingReport {
    pub(crate) fn aborted(timestamp_ns: u64, reason: TrackingError) -> Self {
        Self {
            timestamp_ns,
            aborted: Some(reason),
            ..Self::default()
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}

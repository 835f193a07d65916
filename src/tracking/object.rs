use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::geometry::{SE3, TriangleMesh};
use crate::tracking::klt::KeypointTracker;
use crate::tracking::state::TrackingState;

/// A rigid object model registered for tracking.
#[derive(Debug, Clone)]
pub struct ObjectModel {
    pub label: String,
    pub mesh: Arc<TriangleMesh>,
}

impl ObjectModel {
    pub fn new(label: impl Into<String>, mesh: TriangleMesh) -> Self {
        Self {
            label: label.into(),
            mesh: Arc::new(mesh),
        }
    }
}

/// Most recent accepted pose of an object.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseState {
    /// Object pose in the camera frame (T_co).
    pub pose: SE3,
    /// Timestamp of the detection or frame that produced it.
    pub timestamp_ns: u64,
}

/// Runtime state of one registered object.
pub struct TrackedObject {
    pub model: ObjectModel,
    /// Never held while taking the history lock.
    pub(crate) keypoints: Mutex<Box<dyn KeypointTracker>>,
    pub(crate) pose: RwLock<Option<PoseState>>,
}

impl TrackedObject {
    pub fn new(model: ObjectModel, keypoints: Box<dyn KeypointTracker>) -> Self {
        Self {
            model,
            keypoints: Mutex::new(keypoints),
            pose: RwLock::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.model.label
    }

    pub fn current_pose(&self) -> Option<PoseState> {
        self.pose.read().clone()
    }

    pub fn has_tracking(&self) -> bool {
        self.keypoints.lock().has_tracking()
    }

    pub fn state(&self) -> TrackingState {
        TrackingState::from_has_tracking(self.has_tracking())
    }
}

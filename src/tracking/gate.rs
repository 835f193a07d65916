use crate::config::TrackerConfig;
use crate::geometry::PoseEstimate;

/// Threshold gate on solver output. Both bounds are strict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseGate {
    pub min_inliers: usize,
    pub max_reproj_error: f64,
}

impl PoseGate {
    pub fn new(min_inliers: usize, max_reproj_error: f64) -> Self {
        Self {
            min_inliers,
            max_reproj_error,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.min_tracking_inliers, config.max_tracking_reproj_error)
    }

    pub fn accepts(&self, inliers: usize, reproj_error: f64) -> bool {
        inliers > self.min_inliers && reproj_error < self.max_reproj_error
    }

    pub fn accepts_estimate(&self, estimate: &PoseEstimate) -> bool {
        self.accepts(estimate.num_inliers(), estimate.reproj_error)
    }
}

impl Default for PoseGate {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

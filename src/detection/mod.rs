//! Detected object poses and the filtering applied before seeding.

pub mod transforms;

pub use transforms::{ObjectTransformRegistry, StampedTransform};

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::geometry::SE3;

/// One pose hypothesis from the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPose {
    pub model: String,
    /// Object pose in the camera frame (T_co).
    pub pose: SE3,
    pub confidence: f64,
}

/// All poses detected in one sensor snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBatch {
    pub timestamp_ns: u64,
    pub poses: Vec<DetectedPose>,
}

impl DetectionBatch {
    pub fn new(timestamp_ns: u64, poses: Vec<DetectedPose>) -> Self {
        Self {
            timestamp_ns,
            poses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectionFilterConfig {
    /// Keep only the highest-confidence pose of each model.
    pub best_pose_only: bool,
    /// Drop poses below this confidence.
    pub min_confidence: f64,
}

impl Default for DetectionFilterConfig {
    fn default() -> Self {
        Self {
            best_pose_only: true,
            min_confidence: 0.0,
        }
    }
}

/// Applies [`DetectionFilterConfig`] to incoming batches.
#[derive(Debug, Clone, Default)]
pub struct DetectionFilter {
    config: DetectionFilterConfig,
}

impl DetectionFilter {
    pub fn new(config: DetectionFilterConfig) -> Self {
        Self { config }
    }

    /// Filter `poses`, preserving the detector's order among survivors.
    pub fn apply(&self, poses: Vec<DetectedPose>) -> Vec<DetectedPose> {
        let confident: Vec<DetectedPose> = poses
            .into_iter()
            .filter(|p| p.confidence >= self.config.min_confidence)
            .collect();
        if !self.config.best_pose_only {
            return confident;
        }

        // Index of the best pose per model; ties keep the earliest.
        let mut best: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, p) in confident.iter().enumerate() {
            best.entry(p.model.as_str())
                .and_modify(|b| {
                    if p.confidence > confident[*b].confidence {
                        *b = i;
                    }
                })
                .or_insert(i);
        }
        let mut keep: Vec<usize> = best.into_values().collect();
        keep.sort_unstable();

        keep.into_iter().map(|i| confident[i].clone()).collect()
    }

    pub fn apply_batch(&self, batch: DetectionBatch) -> DetectionBatch {
        DetectionBatch {
            timestamp_ns: batch.timestamp_ns,
            poses: self.apply(batch.poses),
        }
    }
}

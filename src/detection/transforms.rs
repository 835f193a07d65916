//! Named object transforms for periodic broadcast.

use std::collections::BTreeMap;

use crate::detection::DetectionBatch;
use crate::geometry::SE3;

/// A parent→child transform stamped for broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedTransform {
    pub parent: String,
    pub child: String,
    pub timestamp_ns: u64,
    /// Child pose expressed in the parent frame.
    pub transform: SE3,
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    pose: SE3,
    updated_ns: u64,
}

/// Latest pose per broadcast name.
///
/// Detections are named `<model>_<n>`, with `n` counting from 1 per model
/// inside each batch, so a new batch overwrites the previous batch's
/// entries of the same name. Explicit names (tracked poses, objects held
/// in a gripper) are set through [`ObjectTransformRegistry::set_named`].
#[derive(Debug, Clone)]
pub struct ObjectTransformRegistry {
    parent_frame: String,
    entries: BTreeMap<String, Entry>,
}

impl ObjectTransformRegistry {
    pub fn new(parent_frame: impl Into<String>) -> Self {
        Self {
            parent_frame: parent_frame.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn parent_frame(&self) -> &str {
        &self.parent_frame
    }

    /// Record every pose of `batch`; returns the assigned names in order.
    pub fn record_batch(&mut self, batch: &DetectionBatch) -> Vec<String> {
        let mut counters: BTreeMap<&str, u32> = BTreeMap::new();
        let mut names = Vec::with_capacity(batch.poses.len());
        for detection in &batch.poses {
            let n = counters.entry(detection.model.as_str()).or_insert(0);
            *n += 1;
            let name = format!("{}_{}", detection.model, n);
            self.entries.insert(
                name.clone(),
                Entry {
                    pose: detection.pose.clone(),
                    updated_ns: batch.timestamp_ns,
                },
            );
            names.push(name);
        }
        names
    }

    /// Insert or replace the transform broadcast under `name`.
    pub fn set_named(&mut self, name: impl Into<String>, pose: SE3, timestamp_ns: u64) {
        self.entries.insert(
            name.into(),
            Entry {
                pose,
                updated_ns: timestamp_ns,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&SE3> {
        self.entries.get(name).map(|e| &e.pose)
    }

    /// Timestamp of the last update of `name`.
    pub fn updated_at(&self, name: &str) -> Option<u64> {
        self.entries.get(name).map(|e| e.updated_ns)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry stamped with the broadcast time `now_ns`, sorted by name.
    pub fn stamped_transforms(&self, now_ns: u64) -> Vec<StampedTransform> {
        self.entries
            .iter()
            .map(|(name, entry)| StampedTransform {
                parent: self.parent_frame.clone(),
                child: name.clone(),
                timestamp_ns: now_ns,
                transform: entry.pose.clone(),
            })
            .collect()
    }
}

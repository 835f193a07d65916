//! Rolling, time-ordered frame buffers.
//!
//! The coordinator keeps one `FrameStore` behind a single mutex; every
//! search-then-erase sequence runs inside one lock acquisition.

use std::collections::VecDeque;

use opencv::core::Mat;
use opencv::prelude::*;
use tracing::warn;

use crate::tracking::frame::StampedImage;

/// A frame together with its capture timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub timestamp_ns: u64,
    pub frame: T,
}

impl Stamped<Mat> {
    /// Deep copy as a standalone image.
    pub fn to_image(&self) -> opencv::Result<StampedImage> {
        Ok(StampedImage::new(self.timestamp_ns, self.frame.try_clone()?))
    }
}

/// Append-only buffer of frames with non-decreasing timestamps.
#[derive(Debug)]
pub struct FrameHistory<T> {
    frames: VecDeque<Stamped<T>>,
}

impl<T> FrameHistory<T> {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }

    /// Append a frame at the tail.
    ///
    /// Returns `false` (and keeps the buffer unchanged) if the timestamp is
    /// older than the current tail.
    pub fn push(&mut self, timestamp_ns: u64, frame: T) -> bool {
        if let Some(last) = self.frames.back() {
            if timestamp_ns < last.timestamp_ns {
                return false;
            }
        }
        self.frames.push_back(Stamped {
            timestamp_ns,
            frame,
        });
        true
    }

    /// Index of the first frame whose timestamp is >= `timestamp_ns`.
    pub fn find_first_at_or_after(&self, timestamp_ns: u64) -> Option<usize> {
        let idx = self
            .frames
            .partition_point(|f| f.timestamp_ns < timestamp_ns);
        (idx < self.frames.len()).then_some(idx)
    }

    /// Number of frames strictly older than `timestamp_ns`.
    pub fn count_before(&self, timestamp_ns: u64) -> usize {
        self.frames
            .partition_point(|f| f.timestamp_ns < timestamp_ns)
    }

    /// Remove every frame with index < `index`. Returns how many were removed.
    pub fn prune_up_to(&mut self, index: usize) -> usize {
        let n = index.min(self.frames.len());
        self.frames.drain(..n);
        n
    }

    /// Remove every frame older than `timestamp_ns`.
    pub fn prune_before(&mut self, timestamp_ns: u64) -> usize {
        let idx = self.count_before(timestamp_ns);
        self.prune_up_to(idx)
    }

    pub fn get(&self, index: usize) -> Option<&Stamped<T>> {
        self.frames.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stamped<T>> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn latest_timestamp(&self) -> Option<u64> {
        self.frames.back().map(|f| f.timestamp_ns)
    }
}

impl<T> Default for FrameHistory<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Indices of the color and depth frames matched to a detection timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMatch {
    pub color_index: usize,
    pub depth_index: usize,
}

/// Counts of frames dropped by a prune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneCounts {
    pub color: usize,
    pub depth: usize,
}

/// Depth and color histories shared by every object tracker.
#[derive(Debug, Default)]
pub struct FrameStore<T = Mat> {
    pub color: FrameHistory<T>,
    pub depth: FrameHistory<T>,
}

impl<T> FrameStore<T> {
    pub fn new() -> Self {
        Self {
            color: FrameHistory::new(),
            depth: FrameHistory::new(),
        }
    }

    pub fn append_color(&mut self, timestamp_ns: u64, frame: T) -> bool {
        let ok = self.color.push(timestamp_ns, frame);
        if !ok {
            warn!(
                timestamp_ns,
                latest_ns = self.color.latest_timestamp(),
                "Dropping out-of-order color frame"
            );
        }
        ok
    }

    pub fn append_depth(&mut self, timestamp_ns: u64, frame: T) -> bool {
        let ok = self.depth.push(timestamp_ns, frame);
        if !ok {
            warn!(
                timestamp_ns,
                latest_ns = self.depth.latest_timestamp(),
                "Dropping out-of-order depth frame"
            );
        }
        ok
    }

    /// Find the first color and depth frames at or after `timestamp_ns`.
    ///
    /// Returns `None` if either history has no such frame, or if either
    /// candidate is more than `max_offset_ns` newer than the query.
    pub fn match_frames(&self, timestamp_ns: u64, max_offset_ns: u64) -> Option<FrameMatch> {
        let color_index = self.color.find_first_at_or_after(timestamp_ns)?;
        let depth_index = self.depth.find_first_at_or_after(timestamp_ns)?;

        let color_ts = self.color.get(color_index)?.timestamp_ns;
        let depth_ts = self.depth.get(depth_index)?.timestamp_ns;
        if color_ts - timestamp_ns > max_offset_ns || depth_ts - timestamp_ns > max_offset_ns {
            return None;
        }

        Some(FrameMatch {
            color_index,
            depth_index,
        })
    }

    /// Drop frames older than `timestamp_ns` from both histories.
    ///
    /// Each history is searched on its own, so unsynchronized color and
    /// depth streams are pruned consistently.
    pub fn prune_before(&mut self, timestamp_ns: u64) -> PruneCounts {
        PruneCounts {
            color: self.color.prune_before(timestamp_ns),
            depth: self.depth.prune_before(timestamp_ns),
        }
    }
}

impl FrameStore<Mat> {
    pub fn append_color_image(&mut self, frame: StampedImage) -> bool {
        self.append_color(frame.timestamp_ns, frame.image)
    }

    pub fn append_depth_image(&mut self, frame: StampedImage) -> bool {
        self.append_depth(frame.timestamp_ns, frame.image)
    }
}

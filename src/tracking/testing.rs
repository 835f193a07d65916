//! Test doubles for the coordinator's trait seams.

use std::sync::Arc;

use nalgebra::Vector3;
use opencv::core::Point2f;
use parking_lot::Mutex;

use crate::error::Result;
use crate::tracking::frame::StampedImage;
use crate::tracking::klt::{KeypointTracker, SeedInput, TrackedPoints};

/// Calls observed by the fake keypoint trackers.
#[derive(Debug, Default)]
pub(crate) struct Calls {
    /// (seed frame timestamp, replayed frame timestamps)
    pub seeds: Vec<(u64, Vec<u64>)>,
    pub processed: Vec<u64>,
}

pub(crate) struct FakeKeypoints {
    calls: Arc<Mutex<Calls>>,
    points: TrackedPoints,
    last: Option<StampedImage>,
    has_tracking: bool,
}

impl FakeKeypoints {
    pub(crate) fn new(calls: Arc<Mutex<Calls>>) -> Self {
        let n = 12;
        Self {
            calls,
            points: TrackedPoints {
                ids: (0..n).collect(),
                points2d: vec![Point2f::new(0.0, 0.0); n as usize],
                points3d: vec![Vector3::zeros(); n as usize],
            },
            last: None,
            has_tracking: false,
        }
    }
}

impl KeypointTracker for FakeKeypoints {
    fn init_points_and_fastforward(
        &mut self,
        seed: SeedInput<'_>,
        frames: &[&StampedImage],
    ) -> Result<usize> {
        assert!(seed.mask.count() > 0);
        self.calls.lock().seeds.push((
            seed.image.timestamp_ns,
            frames.iter().map(|f| f.timestamp_ns).collect(),
        ));
        let last = frames.last().copied().unwrap_or(seed.image);
        self.last = Some(last.try_clone()?);
        self.has_tracking = true;
        Ok(self.points.len())
    }

    fn process_frame(&mut self, image: &StampedImage) -> Result<TrackedPoints> {
        self.calls.lock().processed.push(image.timestamp_ns);
        self.last = Some(image.try_clone()?);
        Ok(self.points.clone())
    }

    fn last_image(&self) -> Option<&StampedImage> {
        self.last.as_ref()
    }

    fn has_tracking(&self) -> bool {
        self.has_tracking
    }

    fn tracked_points(&self) -> &TrackedPoints {
        &self.points
    }
}


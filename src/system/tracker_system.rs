//! Tracker system: the coordinator plus its event thread.
//!
//! `TrackerSystem` is the entry point for users: it owns the `Tracker`,
//! spawns the thread that consumes sensor and detection events, and exposes
//! pose queries for transform broadcast.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::RwLock;
use tracing::warn;

use crate::config::TrackerConfig;
use crate::detection::{DetectionFilter, ObjectTransformRegistry, StampedTransform};
use crate::tracking::{ObjectModel, PoseState, Tracker};
use crate::viz::RerunVisualizer;

use super::event_loop::EventProcessor;
use super::messages::TrackerEvent;
use super::shared_state::SharedState;

/// Input streams the tracker listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTopics {
    pub camera_info: String,
    pub image: String,
    pub depth: String,
}

impl StreamTopics {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            camera_info: config.camera_info_topic.clone(),
            image: config.image_topic.clone(),
            depth: config.depth_topic.clone(),
        }
    }
}

pub struct TrackerSystem {
    shared: Arc<SharedState>,
    tracker: Arc<Tracker>,
    registry: Arc<RwLock<ObjectTransformRegistry>>,
    topics: StreamTopics,

    /// Kept so the channel stays open while the system lives.
    sender: Sender<TrackerEvent>,

    event_thread: Option<JoinHandle<()>>,
}

impl TrackerSystem {
    /// Start a system with the OpenCV-backed coordinator.
    pub fn spawn(config: &TrackerConfig, visualizer: Option<RerunVisualizer>) -> Self {
        Self::with_tracker(config, Tracker::new(config), visualizer)
    }

    pub fn with_tracker(
        config: &TrackerConfig,
        tracker: Tracker,
        visualizer: Option<RerunVisualizer>,
    ) -> Self {
        let shared = SharedState::new();
        let tracker = Arc::new(tracker);
        let registry = Arc::new(RwLock::new(ObjectTransformRegistry::new(
            config.camera_frame.clone(),
        )));
        let (sender, receiver) = unbounded::<TrackerEvent>();

        let processor = EventProcessor {
            tracker: tracker.clone(),
            registry: registry.clone(),
            filter: DetectionFilter::new(config.detection.clone()),
            shared: shared.clone(),
            visualizer,
        };
        let event_thread = thread::Builder::new()
            .name("tracker-events".to_string())
            .spawn(move || processor.run(receiver));
        let event_thread = match event_thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to spawn tracker event thread: {}", e);
                None
            }
        };

        Self {
            shared,
            tracker,
            registry,
            topics: StreamTopics::from_config(config),
            sender,
            event_thread,
        }
    }

    /// A sender for producers. Events from one sender are handled in order.
    pub fn sender(&self) -> Sender<TrackerEvent> {
        self.sender.clone()
    }

    /// Queue one event. Returns `false` once the event thread is gone.
    pub fn send(&self, event: TrackerEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn add_tracker(&self, model: ObjectModel) -> bool {
        self.tracker.add_tracker(model)
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn current_pose(&self, model: &str) -> Option<PoseState> {
        self.tracker.current_pose(model)
    }

    pub fn current_poses(&self) -> Vec<(String, PoseState)> {
        self.tracker.current_poses()
    }

    /// Streams currently subscribed: camera info until intrinsics arrive,
    /// image and depth afterwards.
    pub fn active_topics(&self) -> Vec<String> {
        if self.shared.is_camera_ready() {
            vec![self.topics.image.clone(), self.topics.depth.clone()]
        } else {
            vec![self.topics.camera_info.clone()]
        }
    }

    /// Every known object transform, stamped with `now_ns`.
    pub fn object_transforms(&self, now_ns: u64) -> Vec<StampedTransform> {
        self.registry.read().stamped_transforms(now_ns)
    }

    /// Override the transform broadcast under `name`.
    pub fn set_object_transform(&self, name: &str, state: PoseState) {
        self.registry
            .write()
            .set_named(name, state.pose, state.timestamp_ns);
    }

    /// Stop the event thread and wait for it.
    ///
    /// Events still queued when the thread notices the flag are dropped.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.event_thread.take() {
            if handle.join().is_err() {
                warn!("Tracker event thread panicked");
            }
        }
    }
}

impl Drop for TrackerSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! The tracker's event thread.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::detection::{DetectionBatch, DetectionFilter, ObjectTransformRegistry};
use crate::tracking::Tracker;
use crate::tracking::frame::StampedImage;
use crate::viz::RerunVisualizer;

use super::messages::{CameraInfo, TrackerEvent};
use super::shared_state::SharedState;

/// Timeout for receiving events (allows checking the shutdown flag).
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Period of the object transform broadcast.
const BROADCAST_PERIOD: Duration = Duration::from_millis(100);

pub(crate) struct EventProcessor {
    pub tracker: Arc<Tracker>,
    pub registry: Arc<RwLock<ObjectTransformRegistry>>,
    pub filter: DetectionFilter,
    pub shared: Arc<SharedState>,
    pub visualizer: Option<RerunVisualizer>,
}

impl EventProcessor {
    /// Main loop: handle events until shutdown or until every sender is gone.
    pub fn run(mut self, receiver: Receiver<TrackerEvent>) {
        info!("Tracker event thread started");
        let mut last_broadcast = Instant::now();

        loop {
            if self.shared.is_shutdown_requested() {
                info!("Tracker event thread received shutdown signal");
                break;
            }

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(event) => {
                    self.handle(event);
                    self.shared.record_event();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Event channel closed");
                    break;
                }
            }

            if last_broadcast.elapsed() >= BROADCAST_PERIOD {
                self.broadcast();
                last_broadcast = Instant::now();
            }
        }
    }

    pub fn handle(&mut self, event: TrackerEvent) {
        match event {
            TrackerEvent::Image(_) | TrackerEvent::Depth(_) if !self.shared.is_camera_ready() => {
                debug!(timestamp_ns = event.timestamp_ns(), "Image streams not open yet");
            }
            TrackerEvent::CameraInfo(info) => self.handle_camera_info(info),
            TrackerEvent::Depth(frame) => {
                self.tracker.handle_depth(frame);
            }
            TrackerEvent::Image(frame) => self.handle_image(frame),
            TrackerEvent::Detections(batch) => self.handle_detections(batch),
        }
    }

    fn handle_camera_info(&mut self, info: CameraInfo) {
        if self.shared.is_camera_ready() {
            debug!("Camera info stream already closed");
            return;
        }
        let Some(camera) = info.to_camera_model() else {
            warn!("Ignoring camera info with a singular intrinsic matrix");
            return;
        };
        if self.tracker.set_camera(camera) {
            self.shared.set_camera_ready();
            info!("Closed camera info stream; image and depth streams open");
        }
    }

    fn handle_image(&mut self, frame: StampedImage) {
        let timestamp_ns = frame.timestamp_ns;
        if let Some(viz) = self.visualizer.as_mut() {
            viz.set_time(timestamp_ns);
            viz.log_image(&frame.image);
        }

        let updates = self.tracker.handle_image(frame);

        {
            let mut registry = self.registry.write();
            for update in updates.iter().filter(|u| u.outcome.is_accepted()) {
                if let Some(pose) = &update.pose {
                    registry.set_named(update.model.clone(), pose.clone(), timestamp_ns);
                }
            }
        }

        if let (Some(viz), Some(camera)) = (self.visualizer.as_ref(), self.tracker.camera()) {
            for update in &updates {
                viz.log_object_update(update, &camera);
            }
            if !updates.is_empty() {
                viz.log_status(&updates);
            }
        }
    }

    fn handle_detections(&mut self, batch: DetectionBatch) {
        let received = batch.poses.len();
        let batch = self.filter.apply_batch(batch);
        let names = self.registry.write().record_batch(&batch);
        debug!(
            timestamp_ns = batch.timestamp_ns,
            received,
            kept = batch.poses.len(),
            ?names,
            "Detections received"
        );
        if batch.poses.is_empty() {
            return;
        }

        let report = self
            .tracker
            .generate_tracking_points(batch.timestamp_ns, &batch.poses);
        if let Some(viz) = &self.visualizer {
            for seeded in &report.seeded {
                viz.log_seed_mask(&seeded.model, &seeded.mask);
            }
        }
        if !report.is_aborted() {
            info!(
                timestamp_ns = report.timestamp_ns,
                seeded = report.seeded.len(),
                skipped = report.skipped.len(),
                "Seeding batch done"
            );
        }
    }

    fn broadcast(&self) {
        let registry = self.registry.read();
        if registry.is_empty() {
            return;
        }
        let transforms = registry.stamped_transforms(wall_clock_ns());
        debug!(count = transforms.len(), parent = registry.parent_frame(), "Broadcasting object transforms");
        if let Some(viz) = &self.visualizer {
            viz.log_object_transforms(&transforms);
        }
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

//! Tracking coordinator: owns per-object state and the frame history.
//!
//! Locks, in the order they may be nested:
//! - `history`: both frame histories; every search + erase happens under
//!   one acquisition.
//! - `track_times`: `last_track_time` of every object.
//! - each object's keypoint tracker; never held while taking `history`.

use std::collections::{BTreeMap, HashMap};
use std::collections::btree_map::Entry;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{FRAME_MATCH_STALENESS_NS, TrackerConfig};
use crate::detection::DetectedPose;
use crate::error::{Result, TrackingError};
use crate::geometry::{PoseSolver, RansacPnpSolver, mesh_pose_to_mask};
use crate::tracking::frame::{CameraModel, StampedImage};
use crate::tracking::gate::PoseGate;
use crate::tracking::history::FrameStore;
use crate::tracking::klt::{KeypointTracker, KltTracker, SeedInput};
use crate::tracking::object::{ObjectModel, PoseState, TrackedObject};
use crate::tracking::result::{GateOutcome, ObjectUpdate, SeededObject, SeedingReport, SkippedPose};
use crate::tracking::state::TrackingState;

/// Builds a fresh keypoint tracker for each registered object.
pub type KeypointTrackerFactory = Box<dyn Fn() -> Box<dyn KeypointTracker> + Send + Sync>;

/// Frames copied out of the history for one detection batch.
struct SeedSnapshot {
    color: StampedImage,
    depth: StampedImage,
    /// Color frames newer than `color` and older than `cutoff_ns`, oldest first.
    replay: Vec<StampedImage>,
    cutoff_ns: u64,
}

pub struct Tracker {
    gate: PoseGate,
    camera: OnceLock<CameraModel>,
    history: Mutex<FrameStore>,
    objects: RwLock<BTreeMap<String, Arc<TrackedObject>>>,
    track_times: Mutex<HashMap<String, u64>>,
    solver: Box<dyn PoseSolver>,
    new_keypoint_tracker: KeypointTrackerFactory,
}

impl Tracker {
    /// Coordinator with OpenCV KLT trackers and RANSAC PnP.
    pub fn new(config: &TrackerConfig) -> Self {
        let klt = config.klt.clone();
        Self::with_components(
            PoseGate::from_config(config),
            Box::new(RansacPnpSolver::new(config.pnp.clone())),
            Box::new(move || -> Box<dyn KeypointTracker> { Box::new(KltTracker::new(klt.clone())) }),
        )
    }

    pub fn with_components(
        gate: PoseGate,
        solver: Box<dyn PoseSolver>,
        new_keypoint_tracker: KeypointTrackerFactory,
    ) -> Self {
        Self {
            gate,
            camera: OnceLock::new(),
            history: Mutex::new(FrameStore::new()),
            objects: RwLock::new(BTreeMap::new()),
            track_times: Mutex::new(HashMap::new()),
            solver,
            new_keypoint_tracker,
        }
    }

    /// Fix the camera intrinsics. Only the first call has an effect.
    pub fn set_camera(&self, camera: CameraModel) -> bool {
        let first = self.camera.set(camera).is_ok();
        if first {
            info!(
                fx = camera.fx(),
                fy = camera.fy(),
                width = camera.width,
                height = camera.height,
                "Camera intrinsics set"
            );
        } else {
            debug!("Ignoring repeated camera info");
        }
        first
    }

    pub fn camera(&self) -> Option<CameraModel> {
        self.camera.get().copied()
    }

    /// Register a model. Returns `false`, leaving the existing entry
    /// untouched, if the label is already registered.
    pub fn add_tracker(&self, model: ObjectModel) -> bool {
        let mut objects = self.objects.write();
        match objects.entry(model.label.clone()) {
            Entry::Occupied(_) => {
                warn!(model = %model.label, "{}", TrackingError::DuplicateModel(model.label.clone()));
                false
            }
            Entry::Vacant(slot) => {
                info!(
                    model = %model.label,
                    triangles = model.mesh.num_triangles(),
                    "Registered tracker"
                );
                let keypoints = (self.new_keypoint_tracker)();
                slot.insert(Arc::new(TrackedObject::new(model, keypoints)));
                true
            }
        }
    }

    /// Store a depth frame. Returns `false` if it was out of order.
    pub fn handle_depth(&self, frame: StampedImage) -> bool {
        self.history.lock().append_depth_image(frame)
    }

    /// Advance every seeded object to a live color frame, then store it.
    pub fn handle_image(&self, frame: StampedImage) -> Vec<ObjectUpdate> {
        let mut updates = Vec::new();
        if let Some(camera) = self.camera.get() {
            for object in self.objects_snapshot() {
                if let Some(update) = self.update_object(&object, &frame, camera) {
                    updates.push(update);
                }
            }
        }

        self.history.lock().append_color_image(frame);
        updates
    }

    fn update_object(
        &self,
        object: &TrackedObject,
        frame: &StampedImage,
        camera: &CameraModel,
    ) -> Option<ObjectUpdate> {
        let points = {
            let mut keypoints = object.keypoints.lock();
            if !keypoints.has_tracking() {
                return None;
            }
            match keypoints.process_frame(frame) {
                Ok(points) => points,
                Err(e) => {
                    warn!(model = object.label(), error = %e, "Keypoint tracking failed");
                    return None;
                }
            }
        };

        self.track_times
            .lock()
            .insert(object.label().to_string(), frame.timestamp_ns);

        let prior = object.current_pose();
        let solved = self.solver.solve(
            &points.points3d,
            &points.points2d,
            camera,
            prior.as_ref().map(|p| &p.pose),
        );

        let outcome = match solved {
            Ok(estimate) => {
                let inliers = estimate.num_inliers();
                let reproj_error = estimate.reproj_error;
                if self.gate.accepts_estimate(&estimate) {
                    *object.pose.write() = Some(PoseState {
                        pose: estimate.pose,
                        timestamp_ns: frame.timestamp_ns,
                    });
                    GateOutcome::Accepted {
                        inliers,
                        reproj_error,
                    }
                } else {
                    debug!(
                        model = object.label(),
                        inliers,
                        reproj_error,
                        "Tracked pose rejected"
                    );
                    GateOutcome::Rejected {
                        inliers,
                        reproj_error,
                    }
                }
            }
            Err(e) => {
                debug!(model = object.label(), error = %e, "Pose solve failed");
                GateOutcome::SolverFailed
            }
        };

        Some(ObjectUpdate {
            model: object.label().to_string(),
            timestamp_ns: frame.timestamp_ns,
            points,
            outcome,
            pose: object.current_pose().map(|p| p.pose),
        })
    }

    /// Seed trackers from a batch of detected poses and catch them up to
    /// the most advanced tracker through the buffered frames.
    pub fn generate_tracking_points(
        &self,
        timestamp_ns: u64,
        poses: &[DetectedPose],
    ) -> SeedingReport {
        let Some(camera) = self.camera.get() else {
            warn!(timestamp_ns, "Detections before camera info; skipping batch");
            return SeedingReport::aborted(timestamp_ns, TrackingError::CameraNotSet);
        };

        let snapshot = match self.snapshot_for_seeding(timestamp_ns) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(timestamp_ns, error = %e, "Skipping detection batch");
                return SeedingReport::aborted(timestamp_ns, e);
            }
        };

        let mut report = SeedingReport {
            timestamp_ns,
            ..SeedingReport::default()
        };
        for detected in poses {
            match self.seed_object(detected, &snapshot, camera, timestamp_ns) {
                Ok(seeded) => report.seeded.push(seeded),
                Err(reason) => {
                    warn!(model = %detected.model, error = %reason, "Skipping detected pose");
                    report.skipped.push(SkippedPose {
                        model: detected.model.clone(),
                        reason,
                    });
                }
            }
        }

        report.pruned = self.history.lock().prune_before(snapshot.cutoff_ns);
        debug!(
            cutoff_ns = snapshot.cutoff_ns,
            pruned_color = report.pruned.color,
            pruned_depth = report.pruned.depth,
            "Pruned frame history"
        );
        report
    }

    fn snapshot_for_seeding(&self, timestamp_ns: u64) -> Result<SeedSnapshot> {
        let missing = || TrackingError::MissingFrame {
            stamp_ns: timestamp_ns,
            bound_ns: FRAME_MATCH_STALENESS_NS,
        };

        let history = self.history.lock();
        let matched = history
            .match_frames(timestamp_ns, FRAME_MATCH_STALENESS_NS)
            .ok_or_else(missing)?;
        let cutoff_ns = self
            .track_times
            .lock()
            .values()
            .copied()
            .max()
            .unwrap_or(timestamp_ns);

        let color = history.color.get(matched.color_index).ok_or_else(missing)?;
        let depth = history.depth.get(matched.depth_index).ok_or_else(missing)?;
        let replay = history
            .color
            .iter()
            .skip(matched.color_index + 1)
            .take_while(|f| f.timestamp_ns < cutoff_ns)
            .filter(|f| f.timestamp_ns > color.timestamp_ns)
            .map(|f| f.to_image())
            .collect::<opencv::Result<Vec<_>>>()?;

        Ok(SeedSnapshot {
            color: color.to_image()?,
            depth: depth.to_image()?,
            replay,
            cutoff_ns,
        })
    }

    fn seed_object(
        &self,
        detected: &DetectedPose,
        snapshot: &SeedSnapshot,
        camera: &CameraModel,
        timestamp_ns: u64,
    ) -> Result<SeededObject> {
        let object = self
            .objects
            .read()
            .get(&detected.model)
            .cloned()
            .ok_or_else(|| TrackingError::UnknownModel(detected.model.clone()))?;

        let mask = mesh_pose_to_mask(&object.model.mesh, &detected.pose, camera);

        let mut keypoints = object.keypoints.lock();
        // A tracked object's last image may be newer than anything in the replay set.
        let carried = if keypoints.has_tracking() {
            keypoints
                .last_image()
                .filter(|f| f.timestamp_ns > snapshot.color.timestamp_ns)
                .map(StampedImage::try_clone)
                .transpose()?
        } else {
            None
        };

        let mut frames: Vec<&StampedImage> = snapshot.replay.iter().chain(carried.as_ref()).collect();
        frames.sort_by_key(|f| f.timestamp_ns);
        frames.dedup_by_key(|f| f.timestamp_ns);

        let num_tracks = keypoints.init_points_and_fastforward(
            SeedInput {
                image: &snapshot.color,
                depth: &snapshot.depth.image,
                camera,
                pose: &detected.pose,
                mask: &mask,
            },
            &frames,
        )?;
        drop(keypoints);

        *object.pose.write() = Some(PoseState {
            pose: detected.pose.clone(),
            timestamp_ns,
        });
        info!(
            model = %detected.model,
            num_tracks,
            mask_pixels = mask.count(),
            replayed = frames.len(),
            "Seeded tracker"
        );

        Ok(SeededObject {
            model: detected.model.clone(),
            num_tracks,
            replayed_frames: frames.len(),
            mask,
        })
    }

    fn objects_snapshot(&self) -> Vec<Arc<TrackedObject>> {
        self.objects.read().values().cloned().collect()
    }

    pub fn models(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn current_pose(&self, model: &str) -> Option<PoseState> {
        self.objects.read().get(model)?.current_pose()
    }

    /// Current pose of every object that has one, by label.
    pub fn current_poses(&self) -> Vec<(String, PoseState)> {
        self.objects_snapshot()
            .into_iter()
            .filter_map(|o| Some((o.label().to_string(), o.current_pose()?)))
            .collect()
    }

    pub fn tracking_state(&self, model: &str) -> Option<TrackingState> {
        let object = self.objects.read().get(model).cloned()?;
        Some(object.state())
    }

    pub fn last_track_time(&self, model: &str) -> Option<u64> {
        self.track_times.lock().get(model).copied()
    }

    /// Number of buffered `(color, depth)` frames.
    pub fn history_len(&self) -> (usize, usize) {
        let history = self.history.lock();
        (history.color.len(), history.depth.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{PoseEstimate, SE3, TriangleMesh};
    use crate::tracking::testing::{Calls, FakeKeypoints};
    use nalgebra::{UnitQuaternion, Vector3};
    use opencv::core::{CV_16UC1, CV_8UC1, Mat, Point2f, Scalar};

    const MS: u64 = 1_000_000;

    /// Returns a fixed estimate, or fails when `inliers` is `None`.
    struct FakeSolver {
        inliers: Option<usize>,
        reproj_error: f64,
    }

    impl PoseSolver for FakeSolver {
        fn solve(
            &self,
            _points3d: &[Vector3<f64>],
            _points2d: &[Point2f],
            _camera: &CameraModel,
            _prior: Option<&SE3>,
        ) -> Result<PoseEstimate> {
            let inliers = self.inliers.ok_or(TrackingError::SolverFailed)?;
            Ok(PoseEstimate {
                pose: solved_pose(),
                inlier_indices: (0..inliers).collect(),
                reproj_error: self.reproj_error,
            })
        }
    }

    fn detected_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 0.5),
        }
    }

    fn solved_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0),
            translation: Vector3::new(0.02, 0.0, 0.55),
        }
    }

    fn square_mesh() -> TriangleMesh {
        TriangleMesh::new(
            vec![
                Vector3::new(-0.05, -0.05, 0.0),
                Vector3::new(0.05, -0.05, 0.0),
                Vector3::new(0.05, 0.05, 0.0),
                Vector3::new(-0.05, 0.05, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    fn camera() -> CameraModel {
        CameraModel::from_pinhole(50.0, 50.0, 32.0, 24.0, 64, 48)
    }

    fn color(ts: u64) -> StampedImage {
        StampedImage::new(
            ts,
            Mat::new_rows_cols_with_default(48, 64, CV_8UC1, Scalar::all(0.0)).unwrap(),
        )
    }

    fn depth(ts: u64) -> StampedImage {
        StampedImage::new(
            ts,
            Mat::new_rows_cols_with_default(48, 64, CV_16UC1, Scalar::all(500.0)).unwrap(),
        )
    }

    fn detection(model: &str) -> DetectedPose {
        DetectedPose {
            model: model.to_string(),
            pose: detected_pose(),
            confidence: 1.0,
        }
    }

    fn tracker_with(inliers: Option<usize>, reproj_error: f64) -> (Tracker, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let factory_calls = calls.clone();
        let tracker = Tracker::with_components(
            PoseGate::default(),
            Box::new(FakeSolver {
                inliers,
                reproj_error,
            }),
            Box::new(move || -> Box<dyn KeypointTracker> {
                Box::new(FakeKeypoints::new(factory_calls.clone()))
            }),
        );
        assert!(tracker.add_tracker(ObjectModel::new("drill", square_mesh())));
        assert!(tracker.set_camera(camera()));
        (tracker, calls)
    }

    /// Feed color and depth frames at each timestamp.
    fn feed(tracker: &Tracker, stamps: &[u64]) {
        for &ts in stamps {
            assert!(tracker.handle_depth(depth(ts)));
            tracker.handle_image(color(ts));
        }
    }

    fn oldest_color(tracker: &Tracker) -> Option<u64> {
        tracker.history.lock().color.get(0).map(|f| f.timestamp_ns)
    }

    #[test]
    fn test_seed_prunes_history_to_detection_frame() {
        let (tracker, calls) = tracker_with(Some(20), 1.0);
        let stamps: Vec<u64> = (1..=5).map(|i| i * 100 * MS).collect();
        feed(&tracker, &stamps);
        assert_eq!(tracker.tracking_state("drill"), Some(TrackingState::Unseeded));

        let report = tracker.generate_tracking_points(stamps[2], &[detection("drill")]);

        assert!(!report.is_aborted());
        assert_eq!(report.seeded.len(), 1);
        assert_eq!(report.pruned.color, 2);
        assert_eq!(report.pruned.depth, 2);
        assert_eq!(oldest_color(&tracker), Some(stamps[2]));
        assert_eq!(tracker.history_len(), (3, 3));
        assert_eq!(tracker.tracking_state("drill"), Some(TrackingState::Seeded));
        assert_eq!(calls.lock().seeds, vec![(stamps[2], vec![])]);

        let pose = tracker.current_pose("drill").unwrap();
        assert_eq!(pose.pose, detected_pose());
        assert_eq!(pose.timestamp_ns, stamps[2]);
    }

    #[test]
    fn test_reseed_replays_frames_and_carries_last_image() {
        let (tracker, calls) = tracker_with(Some(20), 1.0);
        let stamps: Vec<u64> = (1..=3).map(|i| i * 100 * MS).collect();
        feed(&tracker, &stamps);
        tracker.generate_tracking_points(stamps[0], &[detection("drill")]);

        let live = 400 * MS;
        feed(&tracker, &[live]);
        assert_eq!(tracker.last_track_time("drill"), Some(live));

        let report = tracker.generate_tracking_points(stamps[1], &[detection("drill")]);

        assert_eq!(report.seeded[0].replayed_frames, 2);
        assert_eq!(calls.lock().seeds[1], (stamps[1], vec![stamps[2], live]));
        assert_eq!(oldest_color(&tracker), Some(live));
    }

    #[test]
    fn test_new_object_catches_up_to_furthest_tracker() {
        let (tracker, calls) = tracker_with(Some(20), 1.0);
        assert!(tracker.add_tracker(ObjectModel::new("mug", square_mesh())));
        let stamps: Vec<u64> = (1..=5).map(|i| i * 100 * MS).collect();
        feed(&tracker, &stamps[..1]);
        tracker.generate_tracking_points(stamps[0], &[detection("drill")]);
        feed(&tracker, &stamps[1..]);

        let report = tracker.generate_tracking_points(stamps[1], &[detection("mug")]);

        assert_eq!(report.seeded.len(), 1);
        assert_eq!(calls.lock().seeds[1], (stamps[1], vec![stamps[2], stamps[3]]));
        assert_eq!(tracker.tracking_state("mug"), Some(TrackingState::Seeded));
    }

    #[test]
    fn test_low_inlier_update_keeps_pose() {
        let (tracker, calls) = tracker_with(Some(3), 0.5);
        feed(&tracker, &[100 * MS]);
        tracker.generate_tracking_points(100 * MS, &[detection("drill")]);

        let updates = tracker.handle_image(color(200 * MS));

        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0].outcome, GateOutcome::Rejected { inliers: 3, .. }));
        assert_eq!(updates[0].pose, Some(detected_pose()));
        assert_eq!(tracker.current_pose("drill").unwrap().pose, detected_pose());
        assert_eq!(calls.lock().processed, vec![200 * MS]);
        assert_eq!(tracker.last_track_time("drill"), Some(200 * MS));
    }

    #[test]
    fn test_gate_boundary_rejected() {
        let (tracker, _) = tracker_with(Some(8), 3.0);
        feed(&tracker, &[100 * MS]);
        tracker.generate_tracking_points(100 * MS, &[detection("drill")]);

        let updates = tracker.handle_image(color(200 * MS));

        assert!(!updates[0].outcome.is_accepted());
        assert_eq!(tracker.current_pose("drill").unwrap().pose, detected_pose());
    }

    #[test]
    fn test_gate_pass_updates_pose() {
        let (tracker, _) = tracker_with(Some(9), 2.9);
        feed(&tracker, &[100 * MS]);
        tracker.generate_tracking_points(100 * MS, &[detection("drill")]);

        let updates = tracker.handle_image(color(200 * MS));

        assert!(updates[0].outcome.is_accepted());
        let state = tracker.current_pose("drill").unwrap();
        assert_eq!(state.pose, solved_pose());
        assert_eq!(state.timestamp_ns, 200 * MS);
    }

    #[test]
    fn test_solver_failure_is_failed_gate() {
        let (tracker, _) = tracker_with(None, 0.0);
        feed(&tracker, &[100 * MS]);
        tracker.generate_tracking_points(100 * MS, &[detection("drill")]);

        let updates = tracker.handle_image(color(200 * MS));

        assert_eq!(updates[0].outcome, GateOutcome::SolverFailed);
        assert_eq!(tracker.current_pose("drill").unwrap().pose, detected_pose());
        // The frame is stored regardless of the outcome.
        assert_eq!(tracker.history_len().0, 2);
    }

    #[test]
    fn test_stale_detection_aborts_without_mutation() {
        let (tracker, calls) = tracker_with(Some(20), 1.0);
        let stamps: Vec<u64> = (0..3).map(|i| 2_000 * MS + i * 100 * MS).collect();
        feed(&tracker, &stamps);

        // Oldest frame is 1 s after the detection.
        let early = tracker.generate_tracking_points(1_000 * MS, &[detection("drill")]);
        // Nothing at or after the detection.
        let late = tracker.generate_tracking_points(3_000 * MS, &[detection("drill")]);

        for report in [&early, &late] {
            assert!(matches!(report.aborted, Some(TrackingError::MissingFrame { .. })));
            assert!(report.seeded.is_empty());
        }
        assert!(calls.lock().seeds.is_empty());
        assert_eq!(tracker.history_len(), (3, 3));
        assert_eq!(tracker.tracking_state("drill"), Some(TrackingState::Unseeded));
        assert!(tracker.current_pose("drill").is_none());
    }

    #[test]
    fn test_unknown_model_skipped() {
        let (tracker, calls) = tracker_with(Some(20), 1.0);
        feed(&tracker, &[100 * MS]);

        let report =
            tracker.generate_tracking_points(100 * MS, &[detection("mug"), detection("drill")]);

        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(&report.skipped[0].reason, TrackingError::UnknownModel(m) if m == "mug"));
        assert_eq!(report.seeded.len(), 1);
        assert_eq!(calls.lock().seeds.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (tracker, _) = tracker_with(Some(20), 1.0);
        feed(&tracker, &[100 * MS]);
        tracker.generate_tracking_points(100 * MS, &[detection("drill")]);

        assert!(!tracker.add_tracker(ObjectModel::new("drill", TriangleMesh::default())));

        assert_eq!(tracker.models(), vec!["drill".to_string()]);
        assert_eq!(tracker.tracking_state("drill"), Some(TrackingState::Seeded));
        assert_eq!(tracker.current_pose("drill").unwrap().pose, detected_pose());
    }

    #[test]
    fn test_camera_set_once() {
        let (tracker, _) = tracker_with(Some(20), 1.0);
        let other = CameraModel::from_pinhole(10.0, 10.0, 1.0, 1.0, 4, 4);

        assert!(!tracker.set_camera(other));
        assert_eq!(tracker.camera(), Some(camera()));
    }

    #[test]
    fn test_detection_before_camera_aborts() {
        let tracker = Tracker::with_components(
            PoseGate::default(),
            Box::new(FakeSolver {
                inliers: Some(20),
                reproj_error: 1.0,
            }),
            Box::new(|| -> Box<dyn KeypointTracker> {
                Box::new(FakeKeypoints::new(Arc::new(Mutex::new(Calls::default()))))
            }),
        );
        tracker.add_tracker(ObjectModel::new("drill", square_mesh()));
        tracker.handle_depth(depth(100 * MS));
        assert!(tracker.handle_image(color(100 * MS)).is_empty());

        let report = tracker.generate_tracking_points(100 * MS, &[detection("drill")]);

        assert!(matches!(report.aborted, Some(TrackingError::CameraNotSet)));
        assert_eq!(tracker.history_len(), (1, 1));
    }

    #[test]
    fn test_current_poses_lists_seeded_objects() {
        let (tracker, _) = tracker_with(Some(20), 1.0);
        assert!(tracker.add_tracker(ObjectModel::new("mug", square_mesh())));
        feed(&tracker, &[100 * MS]);
        tracker.generate_tracking_points(100 * MS, &[detection("mug")]);

        let poses = tracker.current_poses();

        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].0, "mug");
    }
}

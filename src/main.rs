use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_pose_tracker::config::TrackerConfig;
use rust_pose_tracker::io::{RecordedSequence, load_models};
use rust_pose_tracker::system::TrackerSystem;
use rust_pose_tracker::viz::RerunVisualizer;

/// Give up waiting for the event thread after this long without progress.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let sequence_path = args
        .next()
        .unwrap_or_else(|| "data/sequences/drill".to_string());
    let config = match args.next() {
        Some(path) => TrackerConfig::from_yaml_file(&path)?,
        None => TrackerConfig::default(),
    };

    info!("Loading sequence from {}", sequence_path);
    let sequence = RecordedSequence::new(&sequence_path)?;
    info!(
        color = sequence.color_entries.len(),
        depth = sequence.depth_entries.len(),
        detection_batches = sequence.detections.len(),
        "Loaded sequence"
    );

    let models = load_models(&config)?;

    let visualizer = if config.visualize {
        Some(RerunVisualizer::new("rust-pose-tracker")?)
    } else {
        None
    };

    let mut system = TrackerSystem::spawn(&config, visualizer);
    for model in models {
        system.add_tracker(model);
    }

    let sender = system.sender();
    let mut sent = 0u64;
    if sender.send(sequence.camera_event()).is_ok() {
        sent += 1;
    }
    for (_, step) in sequence.replay_order() {
        let event = match sequence.event(step) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping {:?}: {:#}", step, e);
                continue;
            }
        };
        if sender.send(event).is_err() {
            warn!("Event thread stopped; ending replay");
            break;
        }
        sent += 1;
    }
    drop(sender);

    // Let the event thread drain the queue.
    let shared = system.shared_state().clone();
    let mut last_progress = (shared.events_processed(), Instant::now());
    while shared.events_processed() < sent {
        let processed = shared.events_processed();
        if processed != last_progress.0 {
            last_progress = (processed, Instant::now());
        } else if last_progress.1.elapsed() > DRAIN_TIMEOUT {
            warn!(processed, sent, "Timed out waiting for the event thread");
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    for (model, state) in system.current_poses() {
        let t = state.pose.translation;
        info!(
            model = %model,
            timestamp_ns = state.timestamp_ns,
            "Final pose t=[{:.3}, {:.3}, {:.3}]",
            t.x,
            t.y,
            t.z
        );
    }
    let last_ts = sequence
        .replay_order()
        .last()
        .map(|(ts, _)| *ts)
        .unwrap_or(0);
    for transform in system.object_transforms(last_ts) {
        info!(
            parent = %transform.parent,
            child = %transform.child,
            "Object transform"
        );
    }

    info!("Done! Processed {} events", shared.events_processed());
    system.shutdown();

    Ok(())
}

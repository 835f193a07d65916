//! Object tracking: frame history, KLT keypoints and the coordinator.
//!
//! - `history`: time-ordered color/depth buffers with prune
//! - `klt`: per-object keypoint seeding and fast-forward
//! - `tracker`: seeding batches, per-frame updates and pose gating

pub mod frame;
pub mod gate;
pub mod history;
pub mod klt;
pub mod object;
pub mod result;
pub mod state;
#[cfg(test)]
pub(crate) mod testing;
pub mod tracker;

pub use gate::PoseGate;
pub use history::{FrameHistory, FrameStore};
pub use klt::{KeypointTracker, KltConfig, KltTracker, SeedInput, TrackedPoints};
pub use object::{ObjectModel, PoseState, TrackedObject};
pub use result::{GateOutcome, ObjectUpdate, SeedingReport};
pub use state::TrackingState;
pub use tracker::Tracker;

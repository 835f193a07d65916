//! Tracker system orchestration and thread management.
//!
//! This module contains the top-level `TrackerSystem` that runs the event
//! thread feeding the tracking coordinator, along with shared state and
//! the inbound event types.

mod event_loop;
pub mod messages;
pub mod shared_state;
mod tracker_system;

pub use messages::{CameraInfo, TrackerEvent};
pub use shared_state::SharedState;
pub use tracker_system::{StreamTopics, TrackerSystem};

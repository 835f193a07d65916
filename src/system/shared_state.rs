//! Flags shared between the caller and the event thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SharedState {
    /// Set once intrinsics are known; image and depth streams are open from then on.
    camera_ready: AtomicBool,

    /// Ask the event thread to exit at its next poll.
    shutdown_requested: AtomicBool,

    /// Events fully handled by the event thread.
    events_processed: AtomicU64,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_camera_ready(&self) -> bool {
        self.camera_ready.load(Ordering::SeqCst)
    }

    pub fn set_camera_ready(&self) {
        self.camera_ready.store(true, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn record_event(&self) {
        self.events_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::SeqCst)
    }
}

//! Per-object tracking state machine.

/// State of one object's tracker.
///
/// `Unseeded` until the first successful seeding from a detection, then
/// `Seeded` for the rest of the session (new detections reseed in place).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    #[default]
    Unseeded,
    Seeded,
}

impl TrackingState {
    pub fn from_has_tracking(has_tracking: bool) -> Self {
        if has_tracking {
            Self::Seeded
        } else {
            Self::Unseeded
        }
    }
}

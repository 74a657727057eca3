//! State shared between the main loop and the edge/notification context

use crate::counter::EventCounter;
use crate::scheduler::{DutyCycleConfig, SharedDutyCycle};

/// Handed to the edge handler, the downlink handler and the lifecycle
/// driver behind an `Arc`. Every field is accessed through atomics only.
#[derive(Debug)]
pub struct SharedState {
    pub counter: EventCounter,
    pub duty: SharedDutyCycle,
}

impl SharedState {
    pub fn new(duty: DutyCycleConfig, quiet_window_ms: u64) -> Self {
        Self {
            counter: EventCounter::new(quiet_window_ms),
            duty: SharedDutyCycle::new(duty),
        }
    }
}

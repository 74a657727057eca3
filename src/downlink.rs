//! Downlink command handling
//!
//! Wire contract:
//!
//! | FPort | Buffer                          | Effect                                   |
//! |-------|---------------------------------|------------------------------------------|
//! | 1     | `[hours, minutes, ..]` (≥2)     | base period = h * 3_600_000 + m * 60_000 |
//! | 1     | fewer than 2 bytes              | rejected, no state change                |
//! | 2     | any                             | reserved, no-op                          |
//! | other | any                             | ignored                                  |
//!
//! Operators typically submit the two bytes base64-encoded, e.g. `AAo=` for
//! `[0, 10]`, a 10 minute interval.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::shared::SharedState;

/// FPort carrying the update-interval command
pub const INTERVAL_PORT: u8 = 1;
/// FPort reserved for future commands
pub const RESERVED_PORT: u8 = 2;

const MS_PER_HOUR: u32 = 3_600_000;
const MS_PER_MINUTE: u32 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkCommand {
    SetInterval { hours: u8, minutes: u8 },
}

impl DownlinkCommand {
    /// Parse a downlink. `Ok(None)` for ports that carry no command.
    pub fn parse(port: u8, buffer: &[u8]) -> anyhow::Result<Option<Self>> {
        match port {
            INTERVAL_PORT => match buffer {
                [hours, minutes, ..] => Ok(Some(DownlinkCommand::SetInterval {
                    hours: *hours,
                    minutes: *minutes,
                })),
                _ => Err(anyhow::anyhow!(
                    "Interval command needs 2 bytes, got {}",
                    buffer.len()
                )),
            },
            _ => Ok(None),
        }
    }

    /// New base period in milliseconds. At most 255h 255min, which fits in u32.
    pub fn period_ms(&self) -> u32 {
        match self {
            DownlinkCommand::SetInterval { hours, minutes } => {
                *hours as u32 * MS_PER_HOUR + *minutes as u32 * MS_PER_MINUTE
            }
        }
    }
}

/// What a downlink did to the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownlinkOutcome {
    IntervalUpdated { previous_ms: u32, period_ms: u32 },
    Rejected(String),
    Reserved,
    Ignored,
}

/// Applies operator reconfiguration delivered by the network stack.
///
/// Called from the stack's receive context, concurrently with the main loop.
#[derive(Debug, Clone)]
pub struct DownlinkCommandHandler {
    shared: Arc<SharedState>,
}

impl DownlinkCommandHandler {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    pub fn on_message(&self, port: u8, buffer: &[u8]) -> DownlinkOutcome {
        debug!(
            "Downlink on port {} ({} bytes): {}",
            port,
            buffer.len(),
            hex::encode(buffer)
        );

        match DownlinkCommand::parse(port, buffer) {
            Ok(Some(command @ DownlinkCommand::SetInterval { hours, minutes })) => {
                let period_ms = command.period_ms();
                let previous_ms = self.shared.duty.set_base_period_ms(period_ms);
                if period_ms == 0 {
                    warn!("Update interval set to zero; reports follow jitter only");
                }
                info!(
                    "Update interval set to {}h {}min ({} ms, was {} ms)",
                    hours, minutes, period_ms, previous_ms
                );
                DownlinkOutcome::IntervalUpdated {
                    previous_ms,
                    period_ms,
                }
            }
            Ok(None) if port == RESERVED_PORT => {
                debug!("Downlink on reserved port {}, no action", port);
                DownlinkOutcome::Reserved
            }
            Ok(None) => {
                debug!("Downlink on unhandled port {}, ignored", port);
                DownlinkOutcome::Ignored
            }
            Err(e) => {
                warn!("Rejected downlink on port {}: {}", port, e);
                DownlinkOutcome::Rejected(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{DutyCycleConfig, DEFAULT_BASE_PERIOD_MS};

    fn handler() -> (DownlinkCommandHandler, Arc<SharedState>) {
        let shared = Arc::new(SharedState::new(DutyCycleConfig::default(), 500));
        (DownlinkCommandHandler::new(shared.clone()), shared)
    }

    #[test]
    fn test_ten_minutes() {
        let (handler, shared) = handler();
        let outcome = handler.on_message(1, &[0, 10]);

        assert_eq!(
            outcome,
            DownlinkOutcome::IntervalUpdated {
                previous_ms: DEFAULT_BASE_PERIOD_MS,
                period_ms: 600_000
            }
        );
        assert_eq!(shared.duty.base_period_ms(), 600_000);
    }

    #[test]
    fn test_one_hour() {
        let (handler, shared) = handler();
        handler.on_message(1, &[1, 0]);
        assert_eq!(shared.duty.base_period_ms(), 3_600_000);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let (handler, shared) = handler();
        handler.on_message(1, &[2, 30, 0xFF, 0xFF]);
        assert_eq!(shared.duty.base_period_ms(), 2 * 3_600_000 + 30 * 60_000);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let (handler, shared) = handler();

        assert!(matches!(handler.on_message(1, &[0]), DownlinkOutcome::Rejected(_)));
        assert!(matches!(handler.on_message(1, &[]), DownlinkOutcome::Rejected(_)));
        assert_eq!(shared.duty.base_period_ms(), DEFAULT_BASE_PERIOD_MS);
    }

    #[test]
    fn test_reserved_and_other_ports_leave_state() {
        let (handler, shared) = handler();

        assert_eq!(handler.on_message(2, &[0, 10]), DownlinkOutcome::Reserved);
        assert_eq!(handler.on_message(3, &[0, 10]), DownlinkOutcome::Ignored);
        assert_eq!(handler.on_message(224, &[]), DownlinkOutcome::Ignored);
        assert_eq!(shared.duty.base_period_ms(), DEFAULT_BASE_PERIOD_MS);
    }

    #[test]
    fn test_largest_interval_fits() {
        let command = DownlinkCommand::parse(1, &[255, 255]).unwrap().unwrap();
        assert_eq!(command.period_ms(), 255 * 3_600_000 + 255 * 60_000);
    }
}

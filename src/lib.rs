//! LoRaWAN tipping-bucket rain gauge node
//!
//! The reed switch in the gauge closes once per bucket tip (0.2794 mm of
//! rain). Tips are captured from the edge handler into an [`EventCounter`],
//! batched, and reported on a jittered duty cycle by the lifecycle state
//! machine in [`lifecycle`]. When no rain falls, a watchdog forces a
//! heartbeat report once per watchdog period. The base period can be
//! rewritten over the air by a downlink on FPort 1.
//!
//! ## Execution contexts
//! - **Main loop**: [`lifecycle::Device`] steps the FSM one state at a time.
//! - **Edge/notification context**: [`EventCounter::on_edge`] and
//!   [`DownlinkCommandHandler::on_message`] may fire at any point during a
//!   step. Everything they touch lives in [`SharedState`] and is accessed
//!   through atomics only.
//!
//! [`EventCounter`]: counter::EventCounter
//! [`EventCounter::on_edge`]: counter::EventCounter::on_edge
//! [`DownlinkCommandHandler::on_message`]: downlink::DownlinkCommandHandler::on_message

pub mod config;
pub mod counter;
pub mod downlink;
pub mod gwmp;
pub mod lifecycle;
pub mod lorawan;
pub mod payload;
pub mod rain;
pub mod scheduler;
pub mod shared;
pub mod stack;

pub use shared::SharedState;

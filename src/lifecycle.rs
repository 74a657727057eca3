//! Device lifecycle state machine
//!
//! ```text
//! Init -> Join -(joined)-> Send -> Cycle -> Sleep
//!          ^  |             ^                 |
//!          +--+             +-----(resume)----+
//! ```
//!
//! [`transition`] is a pure function of the current state, the cycle count
//! and a snapshot of [`Inputs`]; it returns the next state and the
//! [`Action`]s to perform. [`Device`] samples the inputs, runs the actions
//! against the [`NetworkStack`] and loops forever. No step raises an error:
//! stack failures are logged and absorbed.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::payload::{CayenneLpp, PayloadEncoder};
use crate::scheduler::{DutyCycleConfig, DutyCycleScheduler};
use crate::shared::SharedState;
use crate::stack::{BatteryReader, Clock, DeviceClass, NetworkStack, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Init = 0,
    Join = 1,
    Send = 2,
    Cycle = 3,
    Sleep = 4,
}

impl DeviceState {
    /// Restore a state from a retained byte. Anything unrecognised
    /// restarts the lifecycle from `Init`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => DeviceState::Join,
            2 => DeviceState::Send,
            3 => DeviceState::Cycle,
            4 => DeviceState::Sleep,
            _ => DeviceState::Init,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Init => write!(f, "INIT"),
            DeviceState::Join => write!(f, "JOIN"),
            DeviceState::Send => write!(f, "SEND"),
            DeviceState::Cycle => write!(f, "CYCLE"),
            DeviceState::Sleep => write!(f, "SLEEP"),
        }
    }
}

/// What happens to pending tips when a report is due but the stack has
/// no session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnjoinedPolicy {
    /// Keep the tips for the next report; drain only on a joined send and
    /// put them back if the send fails.
    #[default]
    Retain,
    /// Drain the counter into a report whenever one is due, joined or not.
    Discard,
}

/// Snapshot taken at the start of each step
#[derive(Debug, Clone, Copy)]
pub struct Inputs {
    pub joined: bool,
    pub pending_tips: u32,
    pub wake_pending: bool,
    pub quiet_remaining_ms: u64,
    pub duty: DutyCycleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Initialise the stack with class and region
    InitStack,
    /// One join attempt
    Join,
    /// Drain the counter into a report; hand it to the stack if `transmit`
    Report { transmit: bool },
    /// Report due while unjoined; tips stay in the counter
    DeferReport,
    /// Compute the jittered delay and schedule the next wake-up
    ScheduleCycle,
    /// Wait out the rest of the debounce quiet window
    Settle { ms: u64 },
    /// Re-enable edge capture and clear the wake flag
    Rearm,
    /// Suspend until the timer or an edge
    Sleep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: DeviceState,
    pub cycles: u32,
    pub actions: Vec<Action>,
}

pub fn transition(
    state: DeviceState,
    cycles: u32,
    policy: UnjoinedPolicy,
    inputs: &Inputs,
) -> Transition {
    match state {
        DeviceState::Init => Transition {
            state: DeviceState::Join,
            cycles,
            actions: vec![Action::InitStack],
        },
        DeviceState::Join => {
            if inputs.joined {
                Transition {
                    state: DeviceState::Send,
                    cycles,
                    actions: vec![],
                }
            } else {
                Transition {
                    state: DeviceState::Join,
                    cycles,
                    actions: vec![Action::Join],
                }
            }
        }
        DeviceState::Send => {
            let mut cycles = cycles.saturating_add(1);
            let mut actions = Vec::new();

            if inputs.pending_tips > 0 || inputs.duty.should_force_send(cycles) {
                let action = match (inputs.joined, policy) {
                    (true, _) => Action::Report { transmit: true },
                    (false, UnjoinedPolicy::Discard) => Action::Report { transmit: false },
                    (false, UnjoinedPolicy::Retain) => Action::DeferReport,
                };
                actions.push(action);
                cycles = 0;
            }

            Transition {
                state: DeviceState::Cycle,
                cycles,
                actions,
            }
        }
        DeviceState::Cycle => Transition {
            state: DeviceState::Sleep,
            cycles,
            actions: vec![Action::ScheduleCycle],
        },
        DeviceState::Sleep => {
            let mut actions = Vec::new();
            if inputs.wake_pending {
                if inputs.quiet_remaining_ms > 0 {
                    actions.push(Action::Settle {
                        ms: inputs.quiet_remaining_ms,
                    });
                }
                actions.push(Action::Rearm);
            }
            actions.push(Action::Sleep);

            Transition {
                state: DeviceState::Send,
                cycles,
                actions,
            }
        }
    }
}

/// Static identity of the node
#[derive(Debug, Clone, Copy)]
pub struct DeviceSettings {
    pub class: DeviceClass,
    pub region: Region,
    pub policy: UnjoinedPolicy,
    pub seed: u64,
}

/// Lifecycle driver. Owns the stack, battery and clock; shares the counter
/// and duty cycle with the edge and downlink contexts.
pub struct Device<S, B, C, E = CayenneLpp> {
    stack: S,
    battery: B,
    clock: C,
    encoder: E,
    shared: Arc<SharedState>,
    scheduler: DutyCycleScheduler,
    settings: DeviceSettings,
    state: DeviceState,
    cycles: u32,
}

impl<S, B, C> Device<S, B, C, CayenneLpp>
where
    S: NetworkStack,
    B: BatteryReader,
    C: Clock,
{
    pub fn new(
        stack: S,
        battery: B,
        clock: C,
        shared: Arc<SharedState>,
        settings: DeviceSettings,
    ) -> Self {
        Self::with_encoder(stack, battery, clock, CayenneLpp, shared, settings)
    }
}

impl<S, B, C, E> Device<S, B, C, E>
where
    S: NetworkStack,
    B: BatteryReader,
    C: Clock,
    E: PayloadEncoder,
{
    pub fn with_encoder(
        stack: S,
        battery: B,
        clock: C,
        encoder: E,
        shared: Arc<SharedState>,
        settings: DeviceSettings,
    ) -> Self {
        Self {
            stack,
            battery,
            clock,
            encoder,
            shared,
            scheduler: DutyCycleScheduler::new(settings.seed),
            settings,
            state: DeviceState::Init,
            cycles: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// Run the lifecycle until the task is dropped.
    pub async fn run(&mut self) {
        loop {
            self.step().await;
        }
    }

    /// Execute one state and return the state the next step will run.
    pub async fn step(&mut self) -> DeviceState {
        let inputs = self.sample();
        if inputs.wake_pending {
            debug!("Tip captured, {} pending", inputs.pending_tips);
        }

        let next = transition(self.state, self.cycles, self.settings.policy, &inputs);
        for action in &next.actions {
            self.execute(*action, &inputs).await;
        }

        if next.state != self.state {
            debug!("{} -> {}", self.state, next.state);
        }
        self.state = next.state;
        self.cycles = next.cycles;
        self.state
    }

    fn sample(&self) -> Inputs {
        let counter = &self.shared.counter;
        Inputs {
            joined: self.stack.is_joined(),
            pending_tips: counter.pending(),
            wake_pending: counter.wake_pending(),
            quiet_remaining_ms: counter.quiet_remaining_ms(self.clock.now_ms()),
            duty: self.shared.duty.snapshot(),
        }
    }

    async fn execute(&mut self, action: Action, inputs: &Inputs) {
        match action {
            Action::InitStack => {
                info!(
                    "Initialising network stack ({}, {})",
                    self.settings.class, self.settings.region
                );
                self.stack.init(self.settings.class, self.settings.region).await;
            }
            Action::Join => {
                self.stack.join().await;
                if !self.stack.is_joined() {
                    debug!("Join pending");
                }
            }
            Action::Report { transmit } => self.report(transmit, inputs).await,
            Action::DeferReport => {
                warn!(
                    "Report due but not joined; holding {} tip(s)",
                    inputs.pending_tips
                );
            }
            Action::ScheduleCycle => {
                let delay_ms = self.scheduler.next_delay(&inputs.duty);
                debug!("Next cycle in {} ms", delay_ms);
                self.stack.cycle(delay_ms);
            }
            Action::Settle { ms } => {
                debug!("Waiting {} ms for the reed switch to settle", ms);
                self.clock.delay_ms(ms).await;
            }
            Action::Rearm => {
                if !self.shared.counter.rearm(self.clock.now_ms()) {
                    warn!("Rain input re-arm refused; will retry next sleep");
                }
            }
            Action::Sleep => {
                let reason = self.stack.sleep().await;
                debug!("Woke: {:?}", reason);
            }
        }
    }

    async fn report(&mut self, transmit: bool, inputs: &Inputs) {
        // One report carries at most `max_tips`; the rest waits for the next
        let counter = &self.shared.counter;
        let drained = counter.take();
        let tips = drained.min(self.encoder.max_tips());
        if drained > tips {
            counter.restore(drained - tips);
            info!("{} tip(s) held over for the next report", drained - tips);
        }
        let battery_mv = self.battery.millivolts();
        let payload = self.encoder.encode(tips, battery_mv);

        info!(
            "Report: {} tip(s), battery {} mV, period {} ms ({} bytes)",
            tips,
            battery_mv,
            inputs.duty.base_period_ms,
            payload.len()
        );

        if !transmit {
            warn!("Not joined; {} tip(s) discarded", tips);
            return;
        }

        match self.stack.send(&payload).await {
            Ok(()) => debug!("Uplink handed to stack: {}", hex::encode(&payload)),
            Err(e) => {
                warn!("Uplink failed: {}", e);
                if self.settings.policy == UnjoinedPolicy::Retain {
                    self.shared.counter.restore(tips);
                }
            }
        }
    }
}

//! Pull gate: limits opportunistic full reconciliations.
//!
//! A gated pull only happens when the user has interacted since the last
//! pull and the cooldown has elapsed. Registry-triggered fetches are not
//! gated, but they do count as a pull for the cooldown.

use crate::subscription::Subscription;
use driftsync_types::Clock;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Host events that mean someone is looking at the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionEvent {
    Pointer,
    Keyboard,
    Focus,
    /// The app became visible.
    Visible,
}

#[derive(Debug, Default)]
struct GateState {
    armed: bool,
    last_pull: Option<i64>,
}

pub struct PullGate {
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<GateState>,
}

impl PullGate {
    pub fn new(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cooldown,
            clock,
            state: Mutex::new(GateState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks user activity.
    pub fn arm(&self) {
        self.lock().armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// Time of the last pull, if any.
    pub fn last_pull(&self) -> Option<i64> {
        self.lock().last_pull
    }

    /// Takes the gate if armed and cooled down; a taken gate is disarmed
    /// and its cooldown restarts.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        if !state.armed {
            return false;
        }
        let cooled = state
            .last_pull
            .is_none_or(|last| now - last >= self.cooldown.as_millis() as i64);
        if !cooled {
            return false;
        }
        state.armed = false;
        state.last_pull = Some(now);
        true
    }

    /// Notes an ungated pull so the cooldown covers it.
    pub fn record_pull(&self) {
        self.lock().last_pull = Some(self.clock.now_ms());
    }

    /// Arms the gate on every event from `events` until the subscription
    /// is dropped.
    pub fn attach(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<InteractionEvent>,
    ) -> Subscription {
        let gate = Arc::clone(self);
        Subscription::new(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        debug!("Pull gate armed by {:?}", event);
                        gate.arm();
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => gate.arm(),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }
}

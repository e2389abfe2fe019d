use super::{EventSender, LoopEvent};
use crate::provider::{ProviderKind, ProviderTimer};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Identifies which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Consult the current provider.
    MonitorStart,
    /// Finish a stop requested earlier in the same turn.
    MonitorStop,
    /// Run a refresh that was deferred by the throttle.
    MonitorThrottle,
    Provider(ProviderKind, ProviderTimer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub key: TimerKey,
    generation: u64,
}

/// One-shot timer delivered through the event loop.
///
/// Re-arming replaces the deadline: every arm bumps a generation counter and
/// a firing from an older generation is rejected by [`Timer::accept`], so a
/// timer can never be pending twice.
#[derive(Debug)]
pub struct Timer {
    key: TimerKey,
    events: EventSender,
    generation: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new(key: TimerKey, events: EventSender) -> Self {
        Self {
            key,
            events,
            generation: 0,
            deadline: None,
            task: None,
        }
    }

    pub fn rearm(&mut self, delay: Duration) {
        self.cancel();
        let fired = TimerFired {
            key: self.key,
            generation: self.generation,
        };
        let deadline = Instant::now() + delay;
        self.deadline = Some(deadline);
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            events.send(LoopEvent::Timer(fired));
        }));
    }

    pub fn arm_if_disarmed(&mut self, delay: Duration) {
        if !self.is_armed() {
            self.rearm(delay);
        }
    }

    /// Fires on the next loop turn without involving the clock.
    pub fn signal(&mut self) {
        self.cancel();
        self.deadline = Some(Instant::now());
        self.events.send(LoopEvent::Timer(TimerFired {
            key: self.key,
            generation: self.generation,
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.deadline = None;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consumes a firing. Returns `false` for firings that were superseded
    /// by a later arm or a cancel.
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        if fired.key != self.key || fired.generation != self.generation || !self.is_armed() {
            return false;
        }
        self.deadline = None;
        self.task = None;
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

//! Event loop plumbing shared by the monitor and its providers.
//!
//! Spawned I/O tasks and timers never touch monitor state directly. They post
//! a [`LoopEvent`] into one unbounded channel, and the task that owns the
//! [`Confmon`](crate::monitor::Confmon) applies events one at a time.

mod connector;
mod timer;

pub use connector::{AsyncStream, BoxedStream, Connector, TcpConnector};
pub use timer::{Timer, TimerFired, TimerKey};

use crate::provider::{ProviderIo, ProviderKind};
use log::debug;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum LoopEvent {
    Timer(TimerFired),
    Provider { kind: ProviderKind, io: ProviderIo },
}

/// Cloneable handle used by timers and I/O tasks to reach the loop.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl EventSender {
    pub fn send(&self, event: LoopEvent) {
        if self.tx.send(event).is_err() {
            debug!("event=loop_event_dropped reason=receiver_closed");
        }
    }

    pub fn provider(&self, kind: ProviderKind, io: ProviderIo) {
        self.send(LoopEvent::Provider { kind, io });
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<LoopEvent>,
}

impl EventReceiver {
    pub async fn next(&mut self) -> Option<LoopEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<LoopEvent> {
        self.rx.try_recv().ok()
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

use crate::snapshot::ConfigInfo;
use std::fmt;
use std::sync::Arc;

/// Notifications fanned out by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    /// A strictly newer snapshot was accepted.
    GotNewConfig,
    /// A candidate was examined and rejected as not newer.
    GotAnyConfig,
    /// Every active provider failed in one cycle.
    ProvidersCycled,
    /// The monitor finished stopping and paused its providers.
    MonitorStopped,
}

impl fmt::Display for ConfigEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigEvent::GotNewConfig => "got_new_config",
            ConfigEvent::GotAnyConfig => "got_any_config",
            ConfigEvent::ProvidersCycled => "providers_cycled",
            ConfigEvent::MonitorStopped => "monitor_stopped",
        })
    }
}

/// Passive observer of monitor events.
///
/// Called synchronously on the monitor's task, in registration order.
/// `config` is the snapshot the event refers to: the accepted one for
/// `GotNewConfig`, the rejected candidate for `GotAnyConfig`, and the current
/// snapshot (if any) otherwise. Listeners only get shared access, so they
/// cannot drive the monitor from inside a notification.
pub trait Listener: Send + Sync {
    fn on_config_event(&self, event: ConfigEvent, config: Option<&Arc<ConfigInfo>>);
}

/// Registration-ordered listener set.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Vec<Arc<dyn Listener>>,
}

impl ListenerSet {
    /// Registers `listener` once; re-adding the same handle is a no-op.
    pub(crate) fn add(&mut self, listener: Arc<dyn Listener>) {
        if !self.contains(&listener) {
            self.listeners.push(listener);
        }
    }

    pub(crate) fn remove(&mut self, listener: &Arc<dyn Listener>) -> bool {
        let before = self.listeners.len();
        self.listeners
            .retain(|existing| !Arc::ptr_eq(existing, listener));
        before != self.listeners.len()
    }

    pub(crate) fn contains(&self, listener: &Arc<dyn Listener>) -> bool {
        self.listeners
            .iter()
            .any(|existing| Arc::ptr_eq(existing, listener))
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn notify(&self, event: ConfigEvent, config: Option<&Arc<ConfigInfo>>) {
        for listener in &self.listeners {
            listener.on_config_event(event, config);
        }
    }
}

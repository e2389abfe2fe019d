//! Configuration providers.
//!
//! Each provider is a small state machine driven by the monitor's loop:
//! the monitor calls into it through [`Provider`], and anything the provider
//! learns later arrives back as a timer firing or a [`ProviderIo`] event.
//! Outcomes are never returned directly; a provider files them on the
//! [`ProviderContext`] and the monitor processes them once the call returns.

pub mod cccp;
pub mod file;
pub mod http;
pub mod static_map;

pub use cccp::{CccpIo, CccpProvider};
pub use file::{FileCacheWriter, FileProvider, CACHE_MAGIC};
pub use http::{HttpIo, HttpProvider};
pub use static_map::{StaticMode, StaticProvider};

use crate::hostlist::Hostlist;
use crate::io::TimerFired;
use crate::snapshot::ConfigInfo;
use crate::util::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Provider identities, declared in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    File,
    Cccp,
    Http,
    McRaw,
    ClAdmin,
    /// Placeholder origin for snapshots injected by tools and tests.
    Phony,
}

impl ProviderKind {
    /// Real providers in the order the monitor consults them.
    pub const ORDERED: [ProviderKind; 5] = [
        ProviderKind::File,
        ProviderKind::Cccp,
        ProviderKind::Http,
        ProviderKind::McRaw,
        ProviderKind::ClAdmin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::File => "file",
            ProviderKind::Cccp => "cccp",
            ProviderKind::Http => "http",
            ProviderKind::McRaw => "mcraw",
            ProviderKind::ClAdmin => "cladmin",
            ProviderKind::Phony => "phony",
        }
    }

    pub(crate) fn slot(self) -> Option<usize> {
        Self::ORDERED.iter().position(|kind| *kind == self)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timers owned by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderTimer {
    /// Per-request deadline or zero-delay delivery.
    Request,
    /// Streaming provider: no data within the node timeout.
    Idle,
    /// Streaming provider: close a paused stream.
    Disconnect,
    /// Streaming provider: reconnect after the node list was exhausted.
    Reconnect,
}

/// I/O completions posted by provider tasks.
#[derive(Debug)]
pub enum ProviderIo {
    Cccp(CccpIo),
    Http(HttpIo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    Accepted,
    /// A refresh is already outstanding; its result will be delivered.
    Busy,
}

/// Outcome filed by a provider for the monitor.
#[derive(Debug, Clone)]
pub enum ProviderReport {
    Succeeded {
        kind: ProviderKind,
        config: Arc<ConfigInfo>,
    },
    Failed {
        kind: ProviderKind,
        error: ConfigError,
    },
}

/// What a provider may know about the monitor while handling a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorView {
    pub current: Option<ProviderKind>,
    pub refreshing: bool,
    pub has_config: bool,
}

pub struct ProviderContext<'a> {
    reports: &'a mut Vec<ProviderReport>,
    view: MonitorView,
}

impl<'a> ProviderContext<'a> {
    pub(crate) fn new(reports: &'a mut Vec<ProviderReport>, view: MonitorView) -> Self {
        Self { reports, view }
    }

    pub fn succeeded(&mut self, kind: ProviderKind, config: Arc<ConfigInfo>) {
        self.reports.push(ProviderReport::Succeeded { kind, config });
    }

    pub fn failed(&mut self, kind: ProviderKind, error: ConfigError) {
        self.reports.push(ProviderReport::Failed { kind, error });
    }

    pub fn is_current(&self, kind: ProviderKind) -> bool {
        self.view.current == Some(kind)
    }

    pub fn is_refreshing(&self) -> bool {
        self.view.refreshing
    }

    pub fn has_config(&self) -> bool {
        self.view.has_config
    }
}

/// Shared contract of every provider variant.
pub trait Provider {
    fn kind(&self) -> ProviderKind;

    /// Most recent snapshot this provider knows about. Never performs I/O.
    fn get_cached(&self) -> Option<Arc<ConfigInfo>>;

    /// Starts obtaining a fresh snapshot; the outcome is filed later.
    fn refresh(&mut self, ctx: &mut ProviderContext<'_>) -> RefreshStatus;

    /// Hint that no refresh is wanted. Returns whether resources were
    /// (or will be) released.
    fn pause(&mut self) -> bool;

    fn configure_nodes(&mut self, nodes: &Hostlist);

    /// A snapshot from any provider was accepted.
    fn config_updated(&mut self, config: &Arc<ConfigInfo>);

    fn nodes(&self) -> Option<&Hostlist> {
        None
    }

    /// A timer owned by this provider fired; stale firings must be
    /// discarded with [`Timer::accept`](crate::io::Timer::accept).
    fn on_timer(&mut self, _fired: &TimerFired, _ctx: &mut ProviderContext<'_>) {}

    fn on_io(&mut self, _io: ProviderIo, _ctx: &mut ProviderContext<'_>) {}

    /// Cancels timers and in-flight tasks before the provider is dropped.
    fn shutdown(&mut self) {}

    fn dump(&self) -> String;
}

/// Enum dispatch over the concrete providers.
pub enum AnyProvider {
    File(FileProvider),
    Cccp(CccpProvider),
    Http(HttpProvider),
    Static(StaticProvider),
}

macro_rules! dispatch {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            AnyProvider::File($p) => $body,
            AnyProvider::Cccp($p) => $body,
            AnyProvider::Http($p) => $body,
            AnyProvider::Static($p) => $body,
        }
    };
}

impl Provider for AnyProvider {
    fn kind(&self) -> ProviderKind {
        dispatch!(self, p => p.kind())
    }

    fn get_cached(&self) -> Option<Arc<ConfigInfo>> {
        dispatch!(self, p => p.get_cached())
    }

    fn refresh(&mut self, ctx: &mut ProviderContext<'_>) -> RefreshStatus {
        dispatch!(self, p => p.refresh(ctx))
    }

    fn pause(&mut self) -> bool {
        dispatch!(self, p => p.pause())
    }

    fn configure_nodes(&mut self, nodes: &Hostlist) {
        dispatch!(self, p => p.configure_nodes(nodes))
    }

    fn config_updated(&mut self, config: &Arc<ConfigInfo>) {
        dispatch!(self, p => p.config_updated(config))
    }

    fn nodes(&self) -> Option<&Hostlist> {
        dispatch!(self, p => p.nodes())
    }

    fn on_timer(&mut self, fired: &TimerFired, ctx: &mut ProviderContext<'_>) {
        dispatch!(self, p => p.on_timer(fired, ctx))
    }

    fn on_io(&mut self, io: ProviderIo, ctx: &mut ProviderContext<'_>) {
        dispatch!(self, p => p.on_io(io, ctx))
    }

    fn shutdown(&mut self) {
        dispatch!(self, p => p.shutdown())
    }

    fn dump(&self) -> String {
        dispatch!(self, p => p.dump())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preference_order_matches_declaration() {
        let mut sorted = ProviderKind::ORDERED;
        sorted.sort();
        assert_eq!(sorted, ProviderKind::ORDERED);
        assert_eq!(ProviderKind::Http.slot(), Some(2));
        assert_eq!(ProviderKind::Phony.slot(), None);
        assert_eq!(ProviderKind::ClAdmin.to_string(), "cladmin");
    }
}

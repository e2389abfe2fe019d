//! The configuration monitor.
//!
//! [`Confmon`] owns every provider, decides which one to consult, arbitrates
//! between candidate maps by freshness and fans accepted maps out to
//! listeners. All of its work happens on the task that calls
//! [`Confmon::pump`] (or [`Confmon::run_pending`]): provider I/O and timers
//! only post [`LoopEvent`]s, and provider outcomes are filed as
//! [`ProviderReport`]s that the monitor drains after every call it makes into
//! a provider. A report filed while another report is being handled is
//! queued, so `start` and the provider callbacks are safe to reach from
//! inside one another.

use crate::hostlist::{HostPort, Hostlist};
use crate::io::{event_channel, Connector, EventReceiver, EventSender, LoopEvent, Timer, TimerFired, TimerKey};
use crate::listener::{ConfigEvent, Listener, ListenerSet};
use crate::provider::{
    AnyProvider, CccpProvider, FileProvider, HttpProvider, MonitorView, Provider,
    ProviderContext, ProviderKind, ProviderReport, RefreshStatus, StaticMode, StaticProvider,
};
use crate::settings::{ConnectionType, Settings};
use crate::snapshot::ConfigInfo;
use crate::throttle::{RefreshThrottle, ThrottleDecision};
use crate::util::{ConfigError, ConfmonError};
use crate::vbucket::ConfigDiff;
use log::{debug, info, warn};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    /// A provider is being consulted (or is about to be).
    Refreshing,
    /// A throttled refresh request is waiting for its window to close.
    Throttled,
}

/// How a caller asks for a refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Restart the cycle even if one is running, skipping the cycle grace.
    pub force: bool,
    /// Subject the request to the refresh throttle.
    pub throttle: bool,
    /// Count the request towards the throttle's error threshold.
    pub count_error: bool,
}

impl RefreshOptions {
    /// Options used for refreshes triggered by routing errors.
    pub fn throttled() -> Self {
        Self {
            force: false,
            throttle: true,
            count_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRequest {
    Started,
    AlreadyRunning,
    Deferred { remaining: Duration },
}

pub struct Confmon {
    settings: Arc<Settings>,
    events: EventSender,
    receiver: EventReceiver,
    providers: Vec<Option<AnyProvider>>,
    enabled: Vec<bool>,
    active: Vec<ProviderKind>,
    current: Option<ProviderKind>,
    config: Option<Arc<ConfigInfo>>,
    listeners: ListenerSet,
    state: MonitorState,
    last_stop: Option<Instant>,
    last_error: Option<ConfigError>,
    throttle: RefreshThrottle,
    as_start: Timer,
    as_stop: Timer,
    as_throttle: Timer,
    reports: Vec<ProviderReport>,
    draining: bool,
}

impl Confmon {
    /// Builds the monitor and every provider the connection type calls for.
    ///
    /// Bucket connections enable the binary and streaming providers, cluster
    /// connections the streaming and administrative static providers. The
    /// raw static provider exists but stays disabled until
    /// [`set_active`](Self::set_active) turns it on. A configured cache file
    /// enables the file provider and registers its writer as a listener.
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Self {
        let settings = Arc::new(settings);
        let (events, receiver) = event_channel();
        let timer = |key| Timer::new(key, events.clone());
        let as_start = timer(TimerKey::MonitorStart);
        let as_stop = timer(TimerKey::MonitorStop);
        let as_throttle = timer(TimerKey::MonitorThrottle);

        let mut providers: Vec<Option<AnyProvider>> = Vec::with_capacity(ProviderKind::ORDERED.len());
        let mut enabled = vec![false; ProviderKind::ORDERED.len()];
        let mut listeners = ListenerSet::default();
        for kind in ProviderKind::ORDERED {
            let provider = match kind {
                ProviderKind::File => {
                    let mut file = FileProvider::new(Arc::clone(&settings), events.clone());
                    if let Some(path) = settings.config_cache.as_deref() {
                        let writer = file.set_filename(Some(path), settings.config_cache_readonly);
                        listeners.add(writer);
                    }
                    AnyProvider::File(file)
                }
                ProviderKind::Cccp => AnyProvider::Cccp(CccpProvider::new(
                    Arc::clone(&settings),
                    Arc::clone(&connector),
                    events.clone(),
                )),
                ProviderKind::Http => AnyProvider::Http(HttpProvider::new(
                    Arc::clone(&settings),
                    Arc::clone(&connector),
                    events.clone(),
                )),
                ProviderKind::McRaw => {
                    AnyProvider::Static(StaticProvider::new(StaticMode::Raw, events.clone()))
                }
                ProviderKind::ClAdmin | ProviderKind::Phony => {
                    AnyProvider::Static(StaticProvider::new(StaticMode::Admin, events.clone()))
                }
            };
            let on = match (kind, settings.conn_type) {
                (ProviderKind::File, _) => settings.config_cache.is_some(),
                (ProviderKind::Http, _) => true,
                (ProviderKind::Cccp, ConnectionType::Bucket) => true,
                (ProviderKind::ClAdmin, ConnectionType::Cluster) => true,
                _ => false,
            };
            if let Some(slot) = kind.slot() {
                enabled[slot] = on;
            }
            providers.push(Some(provider));
        }

        let throttle = RefreshThrottle::new(
            settings.refresh_throttle,
            settings.refresh_error_threshold,
        );
        let mut monitor = Self {
            settings,
            events,
            receiver,
            providers,
            enabled,
            active: Vec::new(),
            current: None,
            config: None,
            listeners,
            state: MonitorState::Idle,
            last_stop: None,
            last_error: None,
            throttle,
            as_start,
            as_stop,
            as_throttle,
            reports: Vec::new(),
            draining: false,
        };
        monitor.prepare();
        monitor
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Handle for tasks that need to post into this monitor's loop.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&AnyProvider> {
        self.providers.get(kind.slot()?)?.as_ref()
    }

    pub fn provider_mut(&mut self, kind: ProviderKind) -> Option<&mut AnyProvider> {
        self.providers.get_mut(kind.slot()?)?.as_mut()
    }

    pub fn is_enabled(&self, kind: ProviderKind) -> bool {
        kind.slot()
            .and_then(|slot| self.enabled.get(slot).copied())
            .unwrap_or(false)
    }

    /// Enables or disables a provider and rebuilds the active list. A
    /// disabled provider is paused.
    pub fn set_active(&mut self, kind: ProviderKind, enabled: bool) {
        let Some(slot) = kind.slot() else {
            return;
        };
        if self.enabled[slot] == enabled {
            return;
        }
        self.enabled[slot] = enabled;
        if !enabled {
            if let Some(provider) = self.provider_mut(kind) {
                provider.pause();
            }
        }
        self.prepare();
    }

    /// Recomputes the active providers in preference order.
    pub fn prepare(&mut self) {
        self.active = ProviderKind::ORDERED
            .into_iter()
            .filter(|kind| self.is_enabled(*kind) && self.provider(*kind).is_some())
            .collect();
        let names: Vec<&str> = self.active.iter().map(|kind| kind.as_str()).collect();
        debug!("event=monitor_prepared active=[{}]", names.join(","));
    }

    pub fn active_providers(&self) -> &[ProviderKind] {
        &self.active
    }

    pub fn add_listener(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn Listener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn config(&self) -> Option<&Arc<ConfigInfo>> {
        self.config.as_ref()
    }

    /// True while a refresh cycle is running or a throttled one is pending.
    pub fn is_refreshing(&self) -> bool {
        self.state != MonitorState::Idle
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn current_provider(&self) -> Option<ProviderKind> {
        self.current
    }

    /// Reason the most recent provider failure gave.
    pub fn last_error(&self) -> Option<&ConfigError> {
        self.last_error.as_ref()
    }

    pub fn error_count(&self) -> u32 {
        self.throttle.error_count()
    }

    pub fn configure_nodes(&mut self, kind: ProviderKind, nodes: &Hostlist) {
        if let Some(provider) = self.provider_mut(kind) {
            provider.configure_nodes(nodes);
        }
    }

    /// Starts a refresh cycle. Without `force` an already running cycle is
    /// left alone, and a cycle that follows a stop by less than the cycle
    /// grace is delayed until the grace has passed.
    pub fn start(&mut self, force: bool) {
        if self.state == MonitorState::Refreshing && !force {
            debug!("event=monitor_start_ignored reason=already_refreshing");
            return;
        }
        self.as_stop.cancel();
        self.as_throttle.cancel();
        let Some(first) = self.active.first().copied() else {
            warn!("event=monitor_start_failed reason=no_active_providers");
            self.state = MonitorState::Idle;
            self.current = None;
            self.listeners
                .notify(ConfigEvent::ProvidersCycled, self.config.as_ref());
            return;
        };
        self.state = MonitorState::Refreshing;
        self.current = Some(first);

        let grace = self.settings.grace_next_cycle;
        let delay = match self.last_stop {
            Some(stopped) if !force => grace.saturating_sub(stopped.elapsed()),
            _ => Duration::ZERO,
        };
        debug!(
            "event=monitor_start provider={} force={} delay_ms={}",
            first,
            force,
            delay.as_millis()
        );
        if delay.is_zero() {
            self.as_start.signal();
        } else {
            self.as_start.rearm(delay);
        }
    }

    /// Leaves the refreshing state. Providers are paused on the next loop
    /// turn unless a new cycle starts first.
    pub fn stop(&mut self) {
        self.as_start.cancel();
        self.as_throttle.cancel();
        if self.state == MonitorState::Idle {
            return;
        }
        self.state = MonitorState::Idle;
        self.current = None;
        self.as_stop.signal();
    }

    /// Refresh entry point for the rest of the client.
    pub fn request_refresh(&mut self, opts: RefreshOptions) -> RefreshRequest {
        if self.state == MonitorState::Refreshing && !opts.force {
            if opts.throttle && opts.count_error {
                self.throttle.evaluate(Instant::now(), true);
            }
            return RefreshRequest::AlreadyRunning;
        }
        if opts.throttle && !opts.force {
            if let ThrottleDecision::Defer { remaining } =
                self.throttle.evaluate(Instant::now(), opts.count_error)
            {
                self.state = MonitorState::Throttled;
                self.as_throttle.arm_if_disarmed(remaining);
                return RefreshRequest::Deferred { remaining };
            }
        }
        self.start(opts.force);
        RefreshRequest::Started
    }

    /// Applies a map pushed by a data node outside a refresh cycle.
    pub fn cccp_update(&mut self, host: &HostPort, body: &[u8]) -> Result<(), ConfigError> {
        let view = self.view();
        let slot = ProviderKind::Cccp.slot().ok_or(ConfigError::Shutdown)?;
        let result = match self.providers.get_mut(slot).and_then(Option::as_mut) {
            Some(AnyProvider::Cccp(cccp)) => {
                let mut ctx = ProviderContext::new(&mut self.reports, view);
                cccp.push_config(host, body, &mut ctx)
            }
            _ => Err(ConfigError::Shutdown),
        };
        self.process_reports();
        result
    }

    /// Waits for the next loop event and applies it.
    pub async fn pump(&mut self) -> Result<(), ConfmonError> {
        let event = self.receiver.next().await.ok_or(ConfmonError::LoopClosed)?;
        self.dispatch(event);
        Ok(())
    }

    /// Applies every event that is already queued. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Some(event) = self.receiver.try_next() {
            self.dispatch(event);
            ran += 1;
        }
        ran
    }

    pub fn dispatch(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Timer(fired) => self.on_timer(fired),
            LoopEvent::Provider { kind, io } => {
                self.call_provider(kind, |provider, ctx| provider.on_io(io, ctx));
            }
        }
        self.process_reports();
    }

    fn on_timer(&mut self, fired: TimerFired) {
        match fired.key {
            TimerKey::MonitorStart => {
                if self.as_start.accept(&fired) {
                    self.do_next_provider();
                }
            }
            TimerKey::MonitorStop => {
                if self.as_stop.accept(&fired) {
                    self.stop_real();
                }
            }
            TimerKey::MonitorThrottle => {
                if self.as_throttle.accept(&fired) && self.state == MonitorState::Throttled {
                    self.state = MonitorState::Idle;
                    self.start(false);
                }
            }
            TimerKey::Provider(kind, _) => {
                self.call_provider(kind, |provider, ctx| provider.on_timer(&fired, ctx));
            }
        }
    }

    fn view(&self) -> MonitorView {
        MonitorView {
            current: self.current,
            refreshing: self.state == MonitorState::Refreshing,
            has_config: self.config.is_some(),
        }
    }

    fn call_provider<R>(
        &mut self,
        kind: ProviderKind,
        f: impl FnOnce(&mut AnyProvider, &mut ProviderContext<'_>) -> R,
    ) -> Option<R> {
        let view = self.view();
        let provider = self.providers.get_mut(kind.slot()?)?.as_mut()?;
        let mut ctx = ProviderContext::new(&mut self.reports, view);
        Some(f(provider, &mut ctx))
    }

    fn process_reports(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        loop {
            let batch = std::mem::take(&mut self.reports);
            if batch.is_empty() {
                break;
            }
            for report in batch {
                match report {
                    ProviderReport::Succeeded { kind, config } => {
                        self.provider_succeeded(kind, config)
                    }
                    ProviderReport::Failed { kind, error } => self.provider_failed(kind, error),
                }
            }
        }
        self.draining = false;
    }

    fn do_next_provider(&mut self) {
        if self.state != MonitorState::Refreshing {
            return;
        }
        let Some(kind) = self.current else {
            return;
        };

        // A map another provider already holds may beat the accepted one.
        let cached = self
            .active
            .iter()
            .filter_map(|kind| self.provider(*kind)?.get_cached())
            .filter(|info| self.is_newer(info))
            .max_by(|a, b| a.compare(b));
        if let Some(info) = cached {
            info!(
                "event=monitor_using_cached origin={} rev={:?}",
                info.origin(),
                info.revision()
            );
            self.accept(info);
            self.stop();
            return;
        }

        debug!("event=monitor_refresh provider={}", kind);
        if let Some(RefreshStatus::Busy) =
            self.call_provider(kind, |provider, ctx| provider.refresh(ctx))
        {
            debug!("event=monitor_refresh_joined provider={}", kind);
        }
        self.process_reports();
    }

    fn is_newer(&self, candidate: &ConfigInfo) -> bool {
        self.config
            .as_ref()
            .map_or(true, |current| candidate.is_newer_than(current))
    }

    /// A provider produced `candidate`.
    ///
    /// While refreshing only the current provider is heard. A strictly newer
    /// map is accepted whenever it arrives; a stale one fails the current
    /// provider over, or is dropped silently outside a cycle.
    pub(crate) fn provider_succeeded(&mut self, kind: ProviderKind, candidate: Arc<ConfigInfo>) {
        let refreshing = self.state == MonitorState::Refreshing;
        if refreshing && self.current != Some(kind) {
            debug!(
                "event=provider_success_ignored provider={} current={:?}",
                kind, self.current
            );
            return;
        }
        if !self.is_newer(&candidate) {
            if refreshing {
                debug!(
                    "event=provider_config_not_newer provider={} rev={:?}",
                    kind,
                    candidate.revision()
                );
                self.listeners
                    .notify(ConfigEvent::GotAnyConfig, Some(&candidate));
                self.provider_failed(kind, ConfigError::NotNewer);
            }
            return;
        }
        self.accept(candidate);
        if refreshing {
            self.stop();
        }
    }

    fn accept(&mut self, candidate: Arc<ConfigInfo>) {
        let diff = self
            .config
            .as_ref()
            .map(|old| ConfigDiff::between(old.config(), candidate.config()));
        info!(
            "event=config_accepted origin={} rev={:?} servers={} diff=\"{}\"",
            candidate.origin(),
            candidate.revision(),
            candidate.server_count(),
            diff.map_or_else(|| "initial".to_string(), |d| d.to_string())
        );
        self.config = Some(Arc::clone(&candidate));
        for kind in ProviderKind::ORDERED {
            if !self.is_enabled(kind) {
                continue;
            }
            if let Some(provider) = self.provider_mut(kind) {
                provider.config_updated(&candidate);
            }
        }
        self.throttle.reset_errors();
        if candidate.origin() != ProviderKind::File {
            self.throttle.record_refresh(Instant::now());
        }
        if candidate.origin() == ProviderKind::Cccp && self.is_enabled(ProviderKind::Http) {
            info!("event=http_provider_disabled reason=cccp_config_available");
            self.set_active(ProviderKind::Http, false);
        }
        self.listeners
            .notify(ConfigEvent::GotNewConfig, Some(&candidate));
    }

    /// The current provider gave up. Moves to the next active provider, or
    /// ends the cycle once every provider has failed.
    pub(crate) fn provider_failed(&mut self, kind: ProviderKind, error: ConfigError) {
        if self.state != MonitorState::Refreshing || self.current != Some(kind) {
            debug!(
                "event=provider_failure_ignored provider={} error=\"{}\"",
                kind, error
            );
            return;
        }
        info!("event=provider_failed provider={} error=\"{}\"", kind, error);
        self.last_error = Some(error);

        let next = self
            .active
            .iter()
            .copied()
            .skip_while(|candidate| *candidate != kind)
            .nth(1);
        match next {
            Some(next) => {
                self.current = Some(next);
                if self.config.is_some() {
                    self.as_start.rearm(self.settings.grace_next_provider);
                } else {
                    self.as_start.signal();
                }
            }
            None => {
                warn!(
                    "event=providers_exhausted last_error=\"{}\"",
                    self.last_error
                        .as_ref()
                        .map_or_else(String::new, ToString::to_string)
                );
                self.stop();
                self.listeners
                    .notify(ConfigEvent::ProvidersCycled, self.config.as_ref());
            }
        }
    }

    fn stop_real(&mut self) {
        for kind in self.active.clone() {
            if let Some(provider) = self.provider_mut(kind) {
                provider.pause();
            }
        }
        self.last_stop = Some(Instant::now());
        debug!("event=monitor_stopped");
        self.listeners
            .notify(ConfigEvent::MonitorStopped, self.config.as_ref());
    }

    /// Multi-line description of the monitor and its providers.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "monitor state={:?} current={:?} errors={} listeners={}",
            self.state,
            self.current,
            self.throttle.error_count(),
            self.listeners.len()
        );
        match &self.config {
            Some(config) => {
                let _ = writeln!(
                    out,
                    "config origin={} rev={:?} seq={} servers={}",
                    config.origin(),
                    config.revision(),
                    config.clock().sequence,
                    config.server_count()
                );
            }
            None => out.push_str("config none\n"),
        }
        if let Some(error) = &self.last_error {
            let _ = writeln!(out, "last_error {error}");
        }
        for kind in ProviderKind::ORDERED {
            if let Some(provider) = self.provider(kind) {
                let _ = writeln!(
                    out,
                    "  [{}] {}",
                    if self.is_enabled(kind) { "on" } else { "off" },
                    provider.dump()
                );
            }
        }
        out
    }
}

impl Drop for Confmon {
    fn drop(&mut self) {
        self.as_start.cancel();
        self.as_stop.cancel();
        self.as_throttle.cancel();
        for provider in self.providers.iter_mut().flatten() {
            provider.shutdown();
        }
        self.providers.clear();
        self.config = None;
    }
}

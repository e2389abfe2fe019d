//! Providers that synthesize a map from the bootstrap host list alone.

use super::{Provider, ProviderContext, ProviderKind, ProviderTimer, RefreshStatus};
use crate::hostlist::Hostlist;
use crate::io::{EventSender, Timer, TimerFired, TimerKey};
use crate::snapshot::ConfigInfo;
use crate::util::{ConfigError, VbucketError};
use crate::vbucket::{Server, ServiceType, Services, VbucketConfig};
use log::{debug, warn};
use std::sync::Arc;

const RAW_BUCKET_NAME: &str = "NOBUCKET";
const RAW_BUCKET_UUID: &str = "deadbeef";
const RAW_VBUCKETS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticMode {
    /// Memcached-style data connections: hosts are data endpoints on a
    /// ketama ring.
    Raw,
    /// Management connections: hosts are management endpoints, no vBuckets.
    Admin,
}

impl StaticMode {
    fn kind(self) -> ProviderKind {
        match self {
            StaticMode::Raw => ProviderKind::McRaw,
            StaticMode::Admin => ProviderKind::ClAdmin,
        }
    }

    fn service(self) -> ServiceType {
        match self {
            StaticMode::Raw => ServiceType::Data,
            StaticMode::Admin => ServiceType::Mgmt,
        }
    }
}

pub struct StaticProvider {
    mode: StaticMode,
    config: Option<Arc<ConfigInfo>>,
    timer: Timer,
}

impl StaticProvider {
    pub fn new(mode: StaticMode, events: EventSender) -> Self {
        let key = TimerKey::Provider(mode.kind(), ProviderTimer::Request);
        Self {
            mode,
            config: None,
            timer: Timer::new(key, events),
        }
    }

    pub fn mode(&self) -> StaticMode {
        self.mode
    }

    fn synthesize(&self, nodes: &Hostlist) -> Result<VbucketConfig, VbucketError> {
        let service = self.mode.service();
        let servers = nodes
            .iter()
            .map(|host| {
                let ports = Services::default().with(service, host.port);
                Server::new(host.host.clone(), ports, ports)
            })
            .collect();
        match self.mode {
            StaticMode::Raw => {
                let mut config = VbucketConfig::generate(
                    RAW_BUCKET_NAME,
                    Some(RAW_BUCKET_UUID),
                    servers,
                    0,
                    RAW_VBUCKETS,
                )?;
                config.make_ketama();
                Ok(config)
            }
            StaticMode::Admin => VbucketConfig::generate(RAW_BUCKET_NAME, None, servers, 0, 0),
        }
    }
}

impl Provider for StaticProvider {
    fn kind(&self) -> ProviderKind {
        self.mode.kind()
    }

    fn get_cached(&self) -> Option<Arc<ConfigInfo>> {
        self.config.clone()
    }

    fn refresh(&mut self, _ctx: &mut ProviderContext<'_>) -> RefreshStatus {
        if self.timer.is_armed() {
            return RefreshStatus::Busy;
        }
        self.timer.signal();
        RefreshStatus::Accepted
    }

    fn pause(&mut self) -> bool {
        false
    }

    fn configure_nodes(&mut self, nodes: &Hostlist) {
        match self.synthesize(nodes) {
            Ok(config) => {
                debug!(
                    "event=static_map_generated kind={} servers={}",
                    self.kind(),
                    config.server_count()
                );
                self.config = Some(ConfigInfo::create(config, self.kind()));
            }
            Err(err) => {
                warn!(
                    "event=static_map_unavailable kind={} error=\"{}\"",
                    self.kind(),
                    err
                );
                self.config = None;
            }
        }
    }

    /// Maps from other providers never replace the synthesized one.
    fn config_updated(&mut self, _config: &Arc<ConfigInfo>) {}

    fn on_timer(&mut self, fired: &TimerFired, ctx: &mut ProviderContext<'_>) {
        if !self.timer.accept(fired) {
            return;
        }
        match &self.config {
            Some(config) => ctx.succeeded(self.kind(), Arc::clone(config)),
            None => ctx.failed(
                self.kind(),
                ConfigError::NoNodes {
                    provider: self.kind(),
                },
            ),
        }
    }

    fn shutdown(&mut self) {
        self.timer.cancel();
    }

    fn dump(&self) -> String {
        format!(
            "{} servers={}",
            self.kind(),
            self.config.as_ref().map_or(0, |c| c.server_count())
        )
    }
}

//! Remote-call provider: asks a data node for its map with the binary
//! `GET_CLUSTER_CONFIG` command.

use super::{Provider, ProviderContext, ProviderIo, ProviderKind, ProviderTimer, RefreshStatus};
use crate::hostlist::{HostPort, Hostlist};
use crate::io::{BoxedStream, Connector, EventSender, Timer, TimerFired, TimerKey};
use crate::proto::mcbp::{self, FetchError, Status};
use crate::settings::Settings;
use crate::snapshot::ConfigInfo;
use crate::util::{ConfigError, ErrorClass};
use crate::vbucket::{ServiceMode, ServiceType, VbucketConfig};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

const KIND: ProviderKind = ProviderKind::Cccp;

/// Completions posted by the request task.
pub enum CccpIo {
    /// The stream is open and the command is on its way.
    Connected { request: u32 },
    Response {
        request: u32,
        host: HostPort,
        outcome: Result<Vec<u8>, ConfigError>,
        /// Handed back for reuse when the connection is still healthy.
        stream: Option<BoxedStream>,
    },
}

impl fmt::Debug for CccpIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CccpIo::Connected { request } => {
                f.debug_struct("Connected").field("request", request).finish()
            }
            CccpIo::Response {
                request,
                host,
                outcome,
                stream,
            } => f
                .debug_struct("Response")
                .field("request", request)
                .field("host", host)
                .field("outcome", &outcome.as_ref().map(Vec::len))
                .field("stream", &stream.is_some())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CccpState {
    Idle,
    Connecting { host: HostPort, request: u32 },
    AwaitingResponse { host: HostPort, request: u32 },
}

impl CccpState {
    fn request(&self) -> Option<u32> {
        match self {
            CccpState::Idle => None,
            CccpState::Connecting { request, .. }
            | CccpState::AwaitingResponse { request, .. } => Some(*request),
        }
    }

    fn host(&self) -> Option<&HostPort> {
        match self {
            CccpState::Idle => None,
            CccpState::Connecting { host, .. } | CccpState::AwaitingResponse { host, .. } => {
                Some(host)
            }
        }
    }
}

pub struct CccpProvider {
    settings: Arc<Settings>,
    connector: Arc<dyn Connector>,
    events: EventSender,
    nodes: Hostlist,
    config: Option<Arc<ConfigInfo>>,
    state: CccpState,
    timer: Timer,
    last_request: u32,
    spare: Option<(HostPort, BoxedStream)>,
    task: Option<JoinHandle<()>>,
}

impl CccpProvider {
    pub fn new(
        settings: Arc<Settings>,
        connector: Arc<dyn Connector>,
        events: EventSender,
    ) -> Self {
        let timer = Timer::new(
            TimerKey::Provider(KIND, ProviderTimer::Request),
            events.clone(),
        );
        Self {
            settings,
            connector,
            events,
            nodes: Hostlist::new(),
            config: None,
            state: CccpState::Idle,
            timer,
            last_request: 0,
            spare: None,
            task: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == CccpState::Idle
    }

    /// Applies a map that reached the client outside a refresh, e.g. in a
    /// not-my-vbucket reply. Files a success exactly like a fetched map.
    pub fn push_config(
        &mut self,
        host: &HostPort,
        body: &[u8],
        ctx: &mut ProviderContext<'_>,
    ) -> Result<(), ConfigError> {
        let info = self.update(host, body)?;
        debug!(
            "event=cccp_config_pushed host={} rev={:?}",
            host,
            info.revision()
        );
        ctx.succeeded(KIND, info);
        Ok(())
    }

    fn update(&mut self, host: &HostPort, body: &[u8]) -> Result<Arc<ConfigInfo>, ConfigError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| ConfigError::protocol("configuration body is not UTF-8"))?;
        let config =
            VbucketConfig::parse_from(text, Some(&host.host), self.settings.network.as_deref())?;
        let info = ConfigInfo::create(config, KIND);
        self.config = Some(Arc::clone(&info));
        Ok(info)
    }

    fn schedule_next_request(
        &mut self,
        error: Option<ConfigError>,
        wrap: bool,
        ctx: &mut ProviderContext<'_>,
    ) {
        let Some(host) = self.nodes.next(wrap).cloned() else {
            self.timer.cancel();
            self.state = CccpState::Idle;
            let error = error.unwrap_or(ConfigError::NoNodes { provider: KIND });
            info!("event=cccp_nodes_exhausted error=\"{}\"", error);
            ctx.failed(KIND, error);
            return;
        };
        self.last_request = self.last_request.wrapping_add(1);
        let request = self.last_request;
        let spare = match self.spare.take() {
            Some((spare_host, stream)) if spare_host == host => Some(stream),
            _ => None,
        };
        debug!(
            "event=cccp_request host={} request={} reuse={}",
            host,
            request,
            spare.is_some()
        );
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.task = Some(tokio::spawn(run_request(
            request,
            host.clone(),
            spare,
            Arc::clone(&self.connector),
            self.events.clone(),
        )));
        self.state = CccpState::Connecting { host, request };
        self.timer.rearm(self.settings.config_node_timeout);
    }

    fn mcio_error(&mut self, error: ConfigError, ctx: &mut ProviderContext<'_>) {
        match (&error, error.class()) {
            (ConfigError::NotSupported { .. }, _) => {
                debug!("event=cccp_not_supported error=\"{}\"", error)
            }
            (_, ErrorClass::Protocol) => warn!("event=cccp_request_failed error=\"{}\"", error),
            _ => info!("event=cccp_request_failed error=\"{}\"", error),
        }
        self.schedule_next_request(Some(error), false, ctx);
    }

    fn on_response(
        &mut self,
        host: HostPort,
        outcome: Result<Vec<u8>, ConfigError>,
        stream: Option<BoxedStream>,
        ctx: &mut ProviderContext<'_>,
    ) {
        self.timer.cancel();
        self.task = None;
        self.state = CccpState::Idle;
        if let Some(stream) = stream {
            self.spare = Some((host.clone(), stream));
        }
        let result = outcome.and_then(|body| self.update(&host, &body));
        match result {
            Ok(info) => {
                debug!(
                    "event=cccp_config_received host={} rev={:?}",
                    host,
                    info.revision()
                );
                ctx.succeeded(KIND, info);
            }
            Err(err) => self.mcio_error(err, ctx),
        }
    }

    fn rebuild_nodes(&mut self, nodes: Hostlist) {
        self.nodes = nodes;
        if self.settings.randomize_nodes {
            self.nodes.randomize();
        }
    }
}

async fn run_request(
    request: u32,
    host: HostPort,
    spare: Option<BoxedStream>,
    connector: Arc<dyn Connector>,
    events: EventSender,
) {
    let post = |io: CccpIo| events.provider(KIND, ProviderIo::Cccp(io));
    let mut stream = match spare {
        Some(stream) => stream,
        None => match connector.connect(&host).await {
            Ok(stream) => stream,
            Err(err) => {
                let error = ConfigError::network(host.to_string(), &err);
                post(CccpIo::Response {
                    request,
                    host,
                    outcome: Err(error),
                    stream: None,
                });
                return;
            }
        },
    };
    post(CccpIo::Connected { request });
    let (outcome, reusable) = match mcbp::fetch_cluster_config(&mut stream, request).await {
        Ok(body) => (Ok(body), true),
        Err(FetchError::Status(status)) if status.is_unsupported() => (
            Err(ConfigError::NotSupported {
                host: host.to_string(),
            }),
            true,
        ),
        Err(FetchError::Status(Status::AuthError)) => (
            Err(ConfigError::Auth {
                host: host.to_string(),
            }),
            false,
        ),
        Err(FetchError::Status(status)) => (
            Err(ConfigError::protocol(format!(
                "{host} answered GET_CLUSTER_CONFIG with {status:?}"
            ))),
            true,
        ),
        Err(FetchError::Io(err)) => (Err(ConfigError::network(host.to_string(), &err)), false),
        Err(FetchError::Frame(err)) => (
            Err(ConfigError::protocol(format!("{host}: {err}"))),
            false,
        ),
    };
    post(CccpIo::Response {
        request,
        host,
        outcome,
        stream: reusable.then_some(stream),
    });
}

impl Provider for CccpProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn get_cached(&self) -> Option<Arc<ConfigInfo>> {
        self.config.clone()
    }

    fn refresh(&mut self, ctx: &mut ProviderContext<'_>) -> RefreshStatus {
        if self.state != CccpState::Idle {
            return RefreshStatus::Busy;
        }
        self.schedule_next_request(None, true, ctx);
        RefreshStatus::Accepted
    }

    fn pause(&mut self) -> bool {
        false
    }

    fn configure_nodes(&mut self, nodes: &Hostlist) {
        let mut copy = Hostlist::new();
        copy.assign(nodes);
        self.rebuild_nodes(copy);
    }

    fn config_updated(&mut self, config: &Arc<ConfigInfo>) {
        let mode = if self.settings.ssl {
            ServiceMode::Ssl
        } else {
            ServiceMode::Plain
        };
        let nodes: Hostlist = config
            .endpoints(ServiceType::Data, mode)
            .into_iter()
            .collect();
        if nodes.is_empty() {
            debug!("event=cccp_nodes_unchanged reason=no_data_nodes_in_map");
            return;
        }
        self.rebuild_nodes(nodes);
    }

    fn nodes(&self) -> Option<&Hostlist> {
        Some(&self.nodes)
    }

    fn on_timer(&mut self, fired: &TimerFired, ctx: &mut ProviderContext<'_>) {
        if !self.timer.accept(fired) {
            return;
        }
        let Some(host) = self.state.host().cloned() else {
            return;
        };
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = CccpState::Idle;
        self.mcio_error(
            ConfigError::Timeout {
                host: host.to_string(),
            },
            ctx,
        );
    }

    fn on_io(&mut self, io: ProviderIo, ctx: &mut ProviderContext<'_>) {
        let ProviderIo::Cccp(io) = io else {
            return;
        };
        match io {
            CccpIo::Connected { request } => {
                if let CccpState::Connecting {
                    host,
                    request: pending,
                } = &self.state
                {
                    if *pending == request {
                        self.state = CccpState::AwaitingResponse {
                            host: host.clone(),
                            request,
                        };
                    }
                }
            }
            CccpIo::Response {
                request,
                host,
                outcome,
                stream,
            } => {
                if self.state.request() != Some(request) {
                    debug!(
                        "event=cccp_stale_response host={} request={}",
                        host, request
                    );
                    return;
                }
                self.on_response(host, outcome, stream, ctx);
            }
        }
    }

    fn shutdown(&mut self) {
        self.timer.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.spare = None;
        self.state = CccpState::Idle;
    }

    fn dump(&self) -> String {
        format!(
            "cccp state={:?} nodes=[{}] config_rev={:?} spare={}",
            self.state,
            self.nodes,
            self.config.as_ref().and_then(|c| c.revision()),
            self.spare
                .as_ref()
                .map_or_else(|| "none".to_string(), |(host, _)| host.to_string())
        )
    }
}

impl Drop for CccpProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Streaming provider: keeps an HTTP connection to a management node open
//! and applies every map the node pushes down it.

use super::{Provider, ProviderContext, ProviderIo, ProviderKind, ProviderTimer, RefreshStatus};
use crate::hostlist::{HostPort, Hostlist};
use crate::io::{Connector, EventSender, Timer, TimerFired, TimerKey};
use crate::proto::http::{FrameSplitter, ParserEvent, ResponseParser};
use crate::settings::{HttpUrlMode, Settings};
use crate::snapshot::ConfigInfo;
use crate::util::ConfigError;
use crate::vbucket::{ServiceMode, ServiceType, VbucketConfig};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const KIND: ProviderKind = ProviderKind::Http;

/// Every streamed map is followed by four newlines.
pub const FRAME_DELIMITER: &[u8] = b"\n\n\n\n";

const READ_BUFFER: usize = 8 * 1024;

#[derive(Debug)]
pub enum HttpIo {
    Connected { conn: u64 },
    Event { conn: u64, event: ParserEvent },
    Closed { conn: u64, error: ConfigError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UriKind {
    Terse,
    Compat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamState {
    Disconnected,
    Connecting { host: HostPort, conn: u64 },
    Streaming { host: HostPort, conn: u64 },
}

impl StreamState {
    fn conn(&self) -> Option<u64> {
        match self {
            StreamState::Disconnected => None,
            StreamState::Connecting { conn, .. } | StreamState::Streaming { conn, .. } => {
                Some(*conn)
            }
        }
    }

    fn host(&self) -> Option<&HostPort> {
        match self {
            StreamState::Disconnected => None,
            StreamState::Connecting { host, .. } | StreamState::Streaming { host, .. } => {
                Some(host)
            }
        }
    }
}

pub struct HttpProvider {
    settings: Arc<Settings>,
    connector: Arc<dyn Connector>,
    events: EventSender,
    nodes: Hostlist,
    current_config: Option<Arc<ConfigInfo>>,
    state: StreamState,
    last_conn: u64,
    task: Option<JoinHandle<()>>,
    commands: Option<mpsc::UnboundedSender<Vec<u8>>>,
    uri: UriKind,
    try_next_uri: bool,
    status: Option<u16>,
    frames: FrameSplitter,
    /// No map arrived within the node timeout.
    io_timer: Timer,
    /// Closes a paused stream once the stream time has passed.
    disconn_timer: Timer,
    reconnect_timer: Timer,
}

impl HttpProvider {
    pub fn new(
        settings: Arc<Settings>,
        connector: Arc<dyn Connector>,
        events: EventSender,
    ) -> Self {
        let timer = |which| Timer::new(TimerKey::Provider(KIND, which), events.clone());
        Self {
            io_timer: timer(ProviderTimer::Idle),
            disconn_timer: timer(ProviderTimer::Disconnect),
            reconnect_timer: timer(ProviderTimer::Reconnect),
            uri: initial_uri(&settings),
            settings,
            connector,
            events,
            nodes: Hostlist::new(),
            current_config: None,
            state: StreamState::Disconnected,
            last_conn: 0,
            task: None,
            commands: None,
            try_next_uri: false,
            status: None,
            frames: FrameSplitter::new(FRAME_DELIMITER),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, StreamState::Streaming { .. })
    }

    /// Host the stream is (or is being) connected to.
    pub fn current_host(&self) -> Option<&HostPort> {
        self.state.host()
    }

    fn path(&self) -> String {
        match self.uri {
            UriKind::Terse => format!("/pools/default/bs/{}", self.settings.bucket),
            UriKind::Compat => format!("/pools/default/bucketsStreaming/{}", self.settings.bucket),
        }
    }

    fn build_request(&self, host: &HostPort) -> Vec<u8> {
        let mut req = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: application/json\r\n",
            self.path(),
            host,
            self.settings.user_agent
        );
        if let Some((user, pass)) = self.settings.http_credentials() {
            let token = STANDARD.encode(format!("{user}:{pass}"));
            req.push_str(&format!("Authorization: Basic {token}\r\n"));
        }
        req.push_str("\r\n");
        req.into_bytes()
    }

    fn close_current(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(host) = self.state.host() {
            debug!("event=http_stream_closed host={}", host);
        }
        self.commands = None;
        self.state = StreamState::Disconnected;
        self.status = None;
        self.try_next_uri = false;
        self.frames.clear();
        self.disconn_timer.cancel();
    }

    fn connect_to(&mut self, host: HostPort) {
        self.close_current();
        self.uri = initial_uri(&self.settings);
        self.last_conn += 1;
        let conn = self.last_conn;
        let request = self.build_request(&host);
        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            "event=http_stream_connect host={} path={} conn={}",
            host,
            self.path(),
            conn
        );
        self.task = Some(tokio::spawn(run_stream(
            conn,
            host.clone(),
            request,
            Arc::clone(&self.connector),
            self.events.clone(),
            rx,
        )));
        self.commands = Some(tx);
        self.state = StreamState::Connecting { host, conn };
        self.io_timer.rearm(self.settings.config_node_timeout);
    }

    fn connect_next(&mut self, ctx: &mut ProviderContext<'_>) {
        match self.nodes.next(true).cloned() {
            Some(host) => self.connect_to(host),
            None => {
                self.io_timer.cancel();
                ctx.failed(KIND, ConfigError::NoNodes { provider: KIND });
            }
        }
    }

    fn on_io_error(&mut self, error: ConfigError, ctx: &mut ProviderContext<'_>) {
        info!("event=http_stream_error error=\"{}\"", error);
        self.close_current();
        if let Some(host) = self.nodes.next(false).cloned() {
            self.connect_to(host);
            return;
        }
        self.io_timer.cancel();
        ctx.failed(KIND, error);
        if self.settings.http_compat_mode() && self.current_config.is_some() {
            self.reconnect_timer
                .arm_if_disarmed(self.settings.grace_next_cycle);
        }
    }

    fn on_status(&mut self, code: u16, ctx: &mut ProviderContext<'_>) {
        self.status = Some(code);
        let host = self
            .state
            .host()
            .map(ToString::to_string)
            .unwrap_or_default();
        let error = match code {
            200 => {
                debug!("event=http_stream_open host={}", host);
                return;
            }
            404 if self.settings.http_url_mode == HttpUrlMode::TryAll
                && self.uri == UriKind::Terse =>
            {
                debug!("event=http_uri_fallback host={} from=terse to=compat", host);
                self.uri = UriKind::Compat;
                self.try_next_uri = true;
                return;
            }
            404 => ConfigError::BucketNotFound {
                bucket: self.settings.bucket.clone(),
            },
            401 => ConfigError::Auth { host },
            status => ConfigError::HttpStatus { host, status },
        };
        self.on_io_error(error, ctx);
    }

    fn on_body(&mut self, conn: u64, data: &[u8], ctx: &mut ProviderContext<'_>) {
        if self.status != Some(200) {
            return;
        }
        self.frames.push(data);
        while let Some(frame) = self.frames.next_frame() {
            let source = self.state.host().map(|host| host.host.clone());
            let parsed = std::str::from_utf8(&frame)
                .map_err(|_| ConfigError::protocol("streamed map is not UTF-8"))
                .and_then(|text| {
                    VbucketConfig::parse_from(
                        text.trim(),
                        source.as_deref(),
                        self.settings.network.as_deref(),
                    )
                    .map_err(ConfigError::from)
                });
            match parsed {
                Ok(config) => {
                    let info = ConfigInfo::create(config, KIND);
                    debug!(
                        "event=http_config_received rev={:?} conn={}",
                        info.revision(),
                        conn
                    );
                    self.io_timer.cancel();
                    self.current_config = Some(Arc::clone(&info));
                    ctx.succeeded(KIND, info);
                }
                Err(err) => {
                    warn!("event=http_bad_frame error=\"{}\"", err);
                    self.on_io_error(err, ctx);
                }
            }
            if self.state.conn() != Some(conn) {
                return;
            }
        }
    }

    fn on_complete(&mut self, ctx: &mut ProviderContext<'_>) {
        if !self.try_next_uri {
            self.on_io_error(ConfigError::protocol("configuration stream ended"), ctx);
            return;
        }
        self.try_next_uri = false;
        self.status = None;
        self.frames.clear();
        let Some(host) = self.state.host().cloned() else {
            return;
        };
        let request = self.build_request(&host);
        let sent = self
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(request).is_ok());
        if !sent {
            self.on_io_error(ConfigError::protocol("stream task is gone"), ctx);
        }
    }

    fn timeout_error(&self) -> ConfigError {
        ConfigError::Timeout {
            host: self
                .state
                .host()
                .map(ToString::to_string)
                .unwrap_or_else(|| "<none>".to_string()),
        }
    }
}

fn initial_uri(settings: &Settings) -> UriKind {
    match settings.http_url_mode {
        HttpUrlMode::Compat => UriKind::Compat,
        HttpUrlMode::Terse | HttpUrlMode::TryAll => UriKind::Terse,
    }
}

async fn run_stream(
    conn: u64,
    host: HostPort,
    request: Vec<u8>,
    connector: Arc<dyn Connector>,
    events: EventSender,
    mut commands: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let post = |io: HttpIo| events.provider(KIND, ProviderIo::Http(io));
    let closed = |err: &io::Error| HttpIo::Closed {
        conn,
        error: ConfigError::network(host.to_string(), err),
    };
    let mut stream = match connector.connect(&host).await {
        Ok(stream) => stream,
        Err(err) => return post(closed(&err)),
    };
    post(HttpIo::Connected { conn });
    if let Err(err) = stream.write_all(&request).await {
        return post(closed(&err));
    }
    let mut parser = ResponseParser::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut parsed = Vec::new();
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(request) = command else { return };
                parser.reset();
                if let Err(err) = stream.write_all(&request).await {
                    return post(closed(&err));
                }
            }
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                        return post(closed(&eof));
                    }
                    Ok(n) => n,
                    Err(err) => return post(closed(&err)),
                };
                if let Err(err) = parser.feed(&buf[..n], &mut parsed) {
                    return post(HttpIo::Closed {
                        conn,
                        error: ConfigError::protocol(format!("{host}: {err}")),
                    });
                }
                for event in parsed.drain(..) {
                    post(HttpIo::Event { conn, event });
                }
            }
        }
    }
}

impl Provider for HttpProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn get_cached(&self) -> Option<Arc<ConfigInfo>> {
        self.current_config.clone()
    }

    fn refresh(&mut self, _ctx: &mut ProviderContext<'_>) -> RefreshStatus {
        self.disconn_timer.cancel();
        if self.state == StreamState::Disconnected {
            self.reconnect_timer.signal();
        } else {
            self.io_timer.rearm(self.settings.config_node_timeout);
        }
        RefreshStatus::Accepted
    }

    fn pause(&mut self) -> bool {
        if self.settings.http_compat_mode() || self.state == StreamState::Disconnected {
            return false;
        }
        if let Some(stream_time) = self.settings.http_stream_time {
            self.disconn_timer.arm_if_disarmed(stream_time);
        }
        true
    }

    fn configure_nodes(&mut self, nodes: &Hostlist) {
        self.nodes.assign(nodes);
        if self.settings.randomize_nodes {
            self.nodes.randomize();
        }
    }

    fn config_updated(&mut self, config: &Arc<ConfigInfo>) {
        let mode = if self.settings.ssl {
            ServiceMode::Ssl
        } else {
            ServiceMode::Plain
        };
        let nodes: Hostlist = config
            .endpoints(ServiceType::Mgmt, mode)
            .into_iter()
            .collect();
        if nodes.is_empty() {
            return;
        }
        self.configure_nodes(&nodes);
    }

    fn nodes(&self) -> Option<&Hostlist> {
        Some(&self.nodes)
    }

    fn on_timer(&mut self, fired: &TimerFired, ctx: &mut ProviderContext<'_>) {
        if self.io_timer.accept(fired) {
            if !(ctx.is_current(KIND) && ctx.is_refreshing()) {
                debug!("event=http_idle_timeout_ignored reason=not_refreshing");
                return;
            }
            let error = self.timeout_error();
            self.on_io_error(error, ctx);
        } else if self.disconn_timer.accept(fired) {
            debug!("event=http_stream_paused_close");
            self.close_current();
        } else if self.reconnect_timer.accept(fired) {
            self.connect_next(ctx);
        }
    }

    fn on_io(&mut self, io: ProviderIo, ctx: &mut ProviderContext<'_>) {
        let ProviderIo::Http(io) = io else {
            return;
        };
        let conn = match &io {
            HttpIo::Connected { conn } | HttpIo::Event { conn, .. } | HttpIo::Closed { conn, .. } => {
                *conn
            }
        };
        if self.state.conn() != Some(conn) {
            debug!("event=http_stale_io conn={}", conn);
            return;
        }
        match io {
            HttpIo::Connected { .. } => {
                if let StreamState::Connecting { host, conn } = &self.state {
                    self.state = StreamState::Streaming {
                        host: host.clone(),
                        conn: *conn,
                    };
                }
            }
            HttpIo::Event { event, .. } => match event {
                ParserEvent::Status(code) => self.on_status(code, ctx),
                ParserEvent::Body(data) => self.on_body(conn, &data, ctx),
                ParserEvent::Complete => self.on_complete(ctx),
            },
            HttpIo::Closed { error, .. } => self.on_io_error(error, ctx),
        }
    }

    fn shutdown(&mut self) {
        self.close_current();
        self.io_timer.cancel();
        self.reconnect_timer.cancel();
    }

    fn dump(&self) -> String {
        format!(
            "http state={:?} uri={:?} nodes=[{}] config_rev={:?} idle_armed={} disconnect_armed={}",
            self.state,
            self.uri,
            self.nodes,
            self.current_config.as_ref().and_then(|c| c.revision()),
            self.io_timer.is_armed(),
            self.disconn_timer.is_armed()
        )
    }
}

impl Drop for HttpProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use confmon::{BoxedStream, ConfigEvent, ConfigInfo, Connector, HostPort, Listener};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const MGMT_PORT: u16 = 8091;

/// Extended-layout map for bucket `travel` served by two data nodes.
pub fn bucket_json(rev: u64) -> String {
    format!(
        r#"{{
  "rev": {rev},
  "name": "travel",
  "nodeLocator": "vbucket",
  "nodesExt": [
    {{"hostname": "n1", "services": {{"kv": 11210, "mgmt": 8091}}}},
    {{"hostname": "n2", "services": {{"kv": 11210, "mgmt": 8091}}}}
  ],
  "vBucketServerMap": {{
    "numReplicas": 1,
    "vBucketMap": [[0, 1], [1, 0], [0, 1], [1, 0]]
  }}
}}"#
    )
}

#[derive(Debug, Clone)]
pub enum KvReply {
    Config(String),
    Status(u16),
    /// Read the request and never answer.
    Silent,
}

#[derive(Default)]
struct ClusterState {
    refused: HashSet<String>,
    kv: HashMap<String, KvReply>,
    http_maps: Vec<String>,
    kv_requests: usize,
    http_requests: Vec<String>,
}

/// In-memory cluster: connections on the management port speak streaming
/// HTTP, every other port answers `GET_CLUSTER_CONFIG`.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse(&self, host: &str) {
        self.state.lock().refused.insert(host.to_string());
    }

    pub fn kv_reply(&self, host: &str, reply: KvReply) {
        self.state.lock().kv.insert(host.to_string(), reply);
    }

    pub fn stream_maps(&self, maps: Vec<String>) {
        self.state.lock().http_maps = maps;
    }

    pub fn kv_requests(&self) -> usize {
        self.state.lock().kv_requests
    }

    pub fn http_requests(&self) -> Vec<String> {
        self.state.lock().http_requests.clone()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    async fn serve_kv(self, host: String, mut stream: DuplexStream) {
        loop {
            let mut header = [0u8; 24];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
            let reply = {
                let mut state = self.state.lock();
                state.kv_requests += 1;
                state.kv.get(&host).cloned().unwrap_or(KvReply::Status(0x81))
            };
            let frame = match reply {
                KvReply::Config(body) => kv_response(opaque, 0, body.as_bytes()),
                KvReply::Status(status) => kv_response(opaque, status, b""),
                KvReply::Silent => continue,
            };
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    async fn serve_http(self, mut stream: DuplexStream) {
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            if stream.read_exact(&mut byte).await.is_err() {
                return;
            }
            request.push(byte[0]);
        }
        let maps = {
            let mut state = self.state.lock();
            state
                .http_requests
                .push(String::from_utf8_lossy(&request).into_owned());
            state.http_maps.clone()
        };
        let mut out = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for map in maps {
            let data = format!("{map}\n\n\n\n");
            out.extend_from_slice(format!("{:x}\r\n{data}\r\n", data.len()).as_bytes());
        }
        if stream.write_all(&out).await.is_err() {
            return;
        }
        // Hold the stream open until the client goes away.
        let mut sink = [0u8; 256];
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn connect(&self, host: &HostPort) -> io::Result<BoxedStream> {
        if self.state.lock().refused.contains(&host.host) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{host} refused"),
            ));
        }
        let (client, server) = tokio::io::duplex(256 * 1024);
        if host.port == MGMT_PORT {
            tokio::spawn(self.clone().serve_http(server));
        } else {
            tokio::spawn(self.clone().serve_kv(host.host.clone(), server));
        }
        Ok(Box::new(client))
    }
}

pub fn kv_response(opaque: u32, status: u16, value: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 24];
    buf[0] = 0x81;
    buf[1] = 0xb5;
    buf[6..8].copy_from_slice(&status.to_be_bytes());
    buf[8..12].copy_from_slice(&(value.len() as u32).to_be_bytes());
    buf[12..16].copy_from_slice(&opaque.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Records every event together with the revision it referred to.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(ConfigEvent, Option<u64>)>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<(ConfigEvent, Option<u64>)> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: ConfigEvent) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(seen, _)| *seen == event)
            .count()
    }
}

impl Listener for Recorder {
    fn on_config_event(&self, event: ConfigEvent, config: Option<&Arc<ConfigInfo>>) {
        self.events
            .lock()
            .push((event, config.and_then(|c| c.revision())));
    }
}

use crate::provider::ProviderKind;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Broad failure classes used to pick log severity and failover penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection refused/reset, timeouts: retried quietly.
    Transport,
    /// Malformed payloads and unexpected replies: retried, logged loudly.
    Protocol,
    /// The data was readable but not usable for this client.
    Mismatch,
}

/// Why a provider could not deliver a configuration.
///
/// Cloneable so the monitor can keep the most recent reason around after the
/// provider that produced it has moved on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("network error talking to {host}: {message}")]
    Network {
        host: String,
        kind: io::ErrorKind,
        message: String,
    },
    #[error("timed out waiting for configuration from {host}")]
    Timeout { host: String },
    #[error("{provider} provider has no nodes left to contact")]
    NoNodes { provider: ProviderKind },
    #[error("{host} does not support configuration requests")]
    NotSupported { host: String },
    #[error("protocol error: {detail}")]
    Protocol { detail: String },
    #[error("authentication rejected by {host}")]
    Auth { host: String },
    #[error("bucket `{bucket}` not found")]
    BucketNotFound { bucket: String },
    #[error("unexpected HTTP status {status} from {host}")]
    HttpStatus { host: String, status: u16 },
    #[error("cached configuration {path} rejected: {reason}")]
    CacheRejected { path: String, reason: String },
    #[error("cached configuration {path} has not changed")]
    CacheUnchanged { path: String },
    #[error("candidate configuration is not newer than the current one")]
    NotNewer,
    #[error("provider was shut down")]
    Shutdown,
}

impl ConfigError {
    pub fn network(host: impl Into<String>, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            return ConfigError::Timeout { host: host.into() };
        }
        ConfigError::Network {
            host: host.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        ConfigError::Protocol {
            detail: detail.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ConfigError::Network { .. }
            | ConfigError::Timeout { .. }
            | ConfigError::NoNodes { .. }
            | ConfigError::Shutdown => ErrorClass::Transport,
            ConfigError::NotSupported { .. }
            | ConfigError::Protocol { .. }
            | ConfigError::Auth { .. }
            | ConfigError::HttpStatus { .. } => ErrorClass::Protocol,
            ConfigError::BucketNotFound { .. }
            | ConfigError::CacheRejected { .. }
            | ConfigError::CacheUnchanged { .. }
            | ConfigError::NotNewer => ErrorClass::Mismatch,
        }
    }
}

impl From<VbucketError> for ConfigError {
    fn from(err: VbucketError) -> Self {
        ConfigError::protocol(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum VbucketError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing or malformed field `{0}`")]
    Field(&'static str),
    #[error("server entry {index} is malformed")]
    Server { index: usize },
    #[error("vBucket {index} references server {server} but only {servers} exist")]
    ServerIndex {
        index: usize,
        server: i32,
        servers: usize,
    },
    #[error("cannot generate a map without servers")]
    NoServers,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostParseError {
    #[error("empty host specification")]
    Empty,
    #[error("unterminated IPv6 literal in `{0}`")]
    UnterminatedIpv6(String),
    #[error("invalid port in `{0}`")]
    Port(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid settings YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfmonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vbucket(#[from] VbucketError),
    #[error(transparent)]
    Host(#[from] HostParseError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("no more bootstrap providers{}", .last.as_ref().map(|err| format!(" (last error: {err})")).unwrap_or_default())]
    Exhausted { last: Option<ConfigError> },
    #[error("no configuration received within {waited:?}")]
    BootstrapTimeout { waited: Duration },
    #[error("event loop closed")]
    LoopClosed,
}

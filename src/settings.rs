//! Monitor configuration.
//!
//! Every field has a default (see [`crate::timeouts`]), so a settings file
//! only needs to name what it changes. Durations are given in milliseconds.

use crate::timeouts;
use crate::util::{cache_path_for_settings, SettingsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Data connection to one bucket: binary and streaming providers.
    Bucket,
    /// Management-only connection: administrative static map.
    Cluster,
}

/// Which streaming URL the HTTP provider asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpUrlMode {
    /// `/pools/default/bs/<bucket>` only.
    Terse,
    /// `/pools/default/bucketsStreaming/<bucket>` only.
    Compat,
    /// Terse first, compat after a 404.
    TryAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bucket: String,
    pub conn_type: ConnectionType,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
    /// `default`, an alternate network name, or `None` to guess.
    pub network: Option<String>,
    pub randomize_nodes: bool,
    #[serde(with = "millis")]
    pub config_timeout: Duration,
    #[serde(with = "millis")]
    pub config_node_timeout: Duration,
    #[serde(with = "millis")]
    pub grace_next_provider: Duration,
    #[serde(with = "millis")]
    pub grace_next_cycle: Duration,
    /// How long a paused stream stays open; `None` keeps it open forever.
    #[serde(with = "opt_millis")]
    pub http_stream_time: Option<Duration>,
    pub http_url_mode: HttpUrlMode,
    #[serde(with = "millis")]
    pub refresh_throttle: Duration,
    pub refresh_error_threshold: u32,
    pub config_cache: Option<PathBuf>,
    pub config_cache_readonly: bool,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bucket: "default".to_string(),
            conn_type: ConnectionType::Bucket,
            username: None,
            password: None,
            ssl: false,
            network: None,
            randomize_nodes: true,
            config_timeout: timeouts::CONFIG_TIMEOUT,
            config_node_timeout: timeouts::CONFIG_NODE_TIMEOUT,
            grace_next_provider: timeouts::GRACE_NEXT_PROVIDER,
            grace_next_cycle: timeouts::GRACE_NEXT_CYCLE,
            http_stream_time: Some(timeouts::HTTP_STREAM_TIME),
            http_url_mode: HttpUrlMode::TryAll,
            refresh_throttle: timeouts::REFRESH_THROTTLE_DELAY,
            refresh_error_threshold: timeouts::REFRESH_ERROR_THRESHOLD,
            config_cache: None,
            config_cache_readonly: false,
            user_agent: concat!("confmon/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Settings {
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.bucket.trim().is_empty() {
            return Err(SettingsError::Invalid {
                field: "bucket",
                reason: "must not be empty".into(),
            });
        }
        if self.config_node_timeout.is_zero() {
            return Err(SettingsError::Invalid {
                field: "config_node_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if self.http_stream_time.is_some_and(|t| t.is_zero()) {
            return Err(SettingsError::Invalid {
                field: "http_stream_time",
                reason: "use null for a stream that never idles out".into(),
            });
        }
        Ok(())
    }

    /// Streaming connections never close between refreshes.
    pub fn http_compat_mode(&self) -> bool {
        self.http_stream_time.is_none()
    }

    /// Credentials sent to the management endpoint. Bucket connections fall
    /// back to the bucket name as the user.
    pub fn http_credentials(&self) -> Option<(String, String)> {
        let user = match (&self.username, self.conn_type) {
            (Some(user), _) => user.clone(),
            (None, ConnectionType::Bucket) => self.bucket.clone(),
            (None, ConnectionType::Cluster) => return None,
        };
        Some((user, self.password.clone().unwrap_or_default()))
    }
}

/// Loads and validates a YAML settings file. A relative `config_cache` path
/// is resolved against the file's directory.
pub fn load_settings(path: &Path) -> Result<Settings, SettingsError> {
    let raw = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_yaml::from_str(&raw)?;
    if let Some(cache) = settings.config_cache.take() {
        settings.config_cache = Some(cache_path_for_settings(path, &cache));
    }
    settings.validate()?;
    Ok(settings)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

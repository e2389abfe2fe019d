//! Cached-file provider and the listener that keeps the cache current.
//!
//! The cache holds the JSON of the last accepted map followed by
//! [`CACHE_MAGIC`]. A file without the marker was cut short by a crash and is
//! never trusted.

use super::{Provider, ProviderContext, ProviderKind, ProviderTimer, RefreshStatus};
use crate::hostlist::Hostlist;
use crate::io::{EventSender, Timer, TimerFired, TimerKey};
use crate::listener::{ConfigEvent, Listener};
use crate::settings::Settings;
use crate::snapshot::ConfigInfo;
use crate::util::{default_cache_path, ConfigError};
use crate::vbucket::{Distribution, VbucketConfig};
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

const KIND: ProviderKind = ProviderKind::File;

/// Trailer marking a completely written cache file.
pub const CACHE_MAGIC: &str = "{{{fb85b563d0a8f65fa8d3d58f1b3a0708}}}";

pub struct FileProvider {
    settings: Arc<Settings>,
    filename: Option<PathBuf>,
    readonly: bool,
    config: Option<Arc<ConfigInfo>>,
    last_mtime: Option<SystemTime>,
    timer: Timer,
    writer: Option<Arc<FileCacheWriter>>,
}

impl FileProvider {
    pub fn new(settings: Arc<Settings>, events: EventSender) -> Self {
        Self {
            settings,
            filename: None,
            readonly: false,
            config: None,
            last_mtime: None,
            timer: Timer::new(TimerKey::Provider(KIND, ProviderTimer::Request), events),
            writer: None,
        }
    }

    /// Points the provider at `path`, or at a per-bucket file in the temp
    /// directory. Returns the writer that must be registered as a listener
    /// for the cache to follow accepted maps.
    pub fn set_filename(&mut self, path: Option<&Path>, readonly: bool) -> Arc<FileCacheWriter> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_cache_path(&self.settings.bucket));
        info!(
            "event=config_cache_configured path={} readonly={}",
            path.display(),
            readonly
        );
        self.filename = Some(path.clone());
        self.readonly = readonly;
        self.last_mtime = None;
        let writer = Arc::new(FileCacheWriter { path, readonly });
        self.writer = Some(Arc::clone(&writer));
        writer
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn writer(&self) -> Option<&Arc<FileCacheWriter>> {
        self.writer.as_ref()
    }

    fn load_cache(&mut self) -> Result<Arc<ConfigInfo>, ConfigError> {
        let Some(path) = self.filename.clone() else {
            return Err(rejected(Path::new("<unset>"), "no cache file configured"));
        };
        let mtime = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map_err(|err| rejected(&path, &format!("stat failed: {err}")))?;
        if self.config.is_some() && self.last_mtime == Some(mtime) {
            return Err(ConfigError::CacheUnchanged {
                path: path.display().to_string(),
            });
        }
        let text = fs::read_to_string(&path)
            .map_err(|err| rejected(&path, &format!("read failed: {err}")))?;
        if text.trim().is_empty() {
            return Err(rejected(&path, "file is empty"));
        }
        let Some(end) = text.find(CACHE_MAGIC) else {
            return Err(rejected(&path, "completion marker missing"));
        };
        let config = VbucketConfig::parse(&text[..end])
            .map_err(|err| rejected(&path, &format!("unparseable map: {err}")))?;
        if config.distribution() != Distribution::Vbucket {
            return Err(rejected(&path, "not a vbucket map"));
        }
        if config.bucket_name() != Some(self.settings.bucket.as_str()) {
            return Err(rejected(
                &path,
                &format!(
                    "map is for bucket {:?}, expected {:?}",
                    config.bucket_name(),
                    self.settings.bucket
                ),
            ));
        }
        let info = ConfigInfo::create(config, KIND);
        self.config = Some(Arc::clone(&info));
        self.last_mtime = Some(mtime);
        Ok(info)
    }
}

fn rejected(path: &Path, reason: &str) -> ConfigError {
    ConfigError::CacheRejected {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

impl Provider for FileProvider {
    fn kind(&self) -> ProviderKind {
        KIND
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

    fn configure_nodes(&mut self, _nodes: &Hostlist) {}

    fn config_updated(&mut self, _config: &Arc<ConfigInfo>) {}

    fn on_timer(&mut self, fired: &TimerFired, ctx: &mut ProviderContext<'_>) {
        if !self.timer.accept(fired) {
            return;
        }
        match self.load_cache() {
            Ok(info) => {
                debug!("event=config_cache_loaded rev={:?}", info.revision());
                ctx.succeeded(KIND, info);
            }
            Err(err) => {
                debug!("event=config_cache_unusable error=\"{}\"", err);
                ctx.failed(KIND, err);
            }
        }
    }

    fn shutdown(&mut self) {
        self.timer.cancel();
    }

    fn dump(&self) -> String {
        format!(
            "file path={} readonly={} config_rev={:?}",
            self.filename
                .as_ref()
                .map_or_else(|| "<unset>".to_string(), |p| p.display().to_string()),
            self.readonly,
            self.config.as_ref().and_then(|c| c.revision())
        )
    }
}

/// Rewrites the cache file whenever a map from the network is accepted.
#[derive(Debug)]
pub struct FileCacheWriter {
    path: PathBuf,
    readonly: bool,
}

impl FileCacheWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, config: &ConfigInfo) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string(&config.to_json())?;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(payload.as_bytes())?;
        file.write_all(b"\n")?;
        file.write_all(CACHE_MAGIC.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

impl Listener for FileCacheWriter {
    fn on_config_event(&self, event: ConfigEvent, config: Option<&Arc<ConfigInfo>>) {
        let (ConfigEvent::GotNewConfig, Some(config)) = (event, config) else {
            return;
        };
        if self.readonly || matches!(config.origin(), ProviderKind::File | ProviderKind::Phony) {
            return;
        }
        match self.write(config) {
            Ok(()) => debug!(
                "event=config_cache_written path={} rev={:?}",
                self.path.display(),
                config.revision()
            ),
            Err(err) => warn!(
                "event=config_cache_write_failed path={} error=\"{}\"",
                self.path.display(),
                err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{event_channel, EventReceiver, LoopEvent};
    use crate::provider::{MonitorView, ProviderReport};
    use crate::vbucket::fixtures::bucket_json;
    use tempfile::tempdir;

    fn view() -> MonitorView {
        MonitorView {
            current: Some(KIND),
            refreshing: true,
            has_config: false,
        }
    }

    async fn refresh_once(provider: &mut FileProvider, rx: &mut EventReceiver) -> ProviderReport {
        let mut reports = Vec::new();
        provider.refresh(&mut ProviderContext::new(&mut reports, view()));
        match rx.next().await.unwrap() {
            LoopEvent::Timer(fired) => {
                provider.on_timer(&fired, &mut ProviderContext::new(&mut reports, view()))
            }
            other => panic!("unexpected {other:?}"),
        }
        reports.pop().unwrap()
    }

    fn network_snapshot(rev: u64) -> Arc<ConfigInfo> {
        let cfg = VbucketConfig::parse_from(&bucket_json(rev), Some("10.0.0.2"), None).unwrap();
        ConfigInfo::create(cfg, ProviderKind::Cccp)
    }

    fn authorities(config: &ConfigInfo) -> Vec<String> {
        config.servers().iter().map(|server| server.authority()).collect()
    }

    #[tokio::test]
    async fn written_cache_is_loaded_back() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = event_channel();
        let mut provider = FileProvider::new(Arc::new(Settings::for_bucket("travel")), tx);
        let writer = provider.set_filename(Some(&dir.path().join("travel.json")), false);

        let original = network_snapshot(12);
        writer.on_config_event(ConfigEvent::GotNewConfig, Some(&original));
        match refresh_once(&mut provider, &mut rx).await {
            ProviderReport::Succeeded { config, .. } => {
                assert_eq!(config.revision(), Some(12));
                assert_eq!(config.origin(), KIND);
                assert_eq!(config.bucket_name(), original.bucket_name());
                assert_eq!(config.distribution(), original.distribution());
                assert_eq!(authorities(&config), authorities(&original));
                assert_eq!(config.servers()[1].hostname, "10.0.0.2");
            }
            other => panic!("unexpected {other:?}"),
        }
        match refresh_once(&mut provider, &mut rx).await {
            ProviderReport::Failed { error, .. } => {
                assert!(matches!(error, ConfigError::CacheUnchanged { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_or_foreign_cache_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache");
        let (tx, mut rx) = event_channel();
        let mut provider = FileProvider::new(Arc::new(Settings::for_bucket("travel")), tx);
        provider.set_filename(Some(&path), true);

        fs::write(&path, bucket_json(1)).unwrap();
        let report = refresh_once(&mut provider, &mut rx).await;
        assert!(
            matches!(&report, ProviderReport::Failed { error: ConfigError::CacheRejected { reason, .. }, .. } if reason.contains("marker"))
        );

        fs::write(
            &path,
            format!("{}\n{CACHE_MAGIC}\n", bucket_json(1).replace("travel", "beer")),
        )
        .unwrap();
        let report = refresh_once(&mut provider, &mut rx).await;
        assert!(
            matches!(&report, ProviderReport::Failed { error: ConfigError::CacheRejected { reason, .. }, .. } if reason.contains("bucket"))
        );

        fs::write(&path, "").unwrap();
        let report = refresh_once(&mut provider, &mut rx).await;
        assert!(matches!(&report, ProviderReport::Failed { .. }));
    }

    #[tokio::test]
    async fn missing_filename_fails() {
        let (tx, mut rx) = event_channel();
        let mut provider = FileProvider::new(Arc::new(Settings::default()), tx);
        assert!(matches!(
            refresh_once(&mut provider, &mut rx).await,
            ProviderReport::Failed {
                error: ConfigError::CacheRejected { .. },
                ..
            }
        ));
    }

    #[test]
    fn writer_skips_readonly_and_file_origin() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache");
        let readonly = FileCacheWriter {
            path: path.clone(),
            readonly: true,
        };
        readonly.on_config_event(ConfigEvent::GotNewConfig, Some(&network_snapshot(3)));
        assert!(!path.exists());

        let writer = FileCacheWriter {
            path: path.clone(),
            readonly: false,
        };
        let from_file = ConfigInfo::create(network_snapshot(3).config().clone(), KIND);
        writer.on_config_event(ConfigEvent::GotNewConfig, Some(&from_file));
        writer.on_config_event(ConfigEvent::GotAnyConfig, Some(&network_snapshot(4)));
        assert!(!path.exists());

        writer.on_config_event(ConfigEvent::GotNewConfig, Some(&network_snapshot(5)));
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.trim_end().ends_with(CACHE_MAGIC));
    }
}

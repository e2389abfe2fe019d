mod common;

use common::{bucket_json, KvReply, MockCluster, Recorder, MGMT_PORT};
use confmon::{
    ConfigEvent, ConfigError, Confmon, ConfmonError, HostPort, Hostlist, ProviderKind,
    RefreshOptions, RefreshRequest, Settings, CACHE_MAGIC,
};
use std::sync::Arc;
use std::time::Duration;

fn hosts(specs: &str, port: u16) -> Hostlist {
    let mut list = Hostlist::new();
    list.add_specs(specs, port).unwrap();
    list
}

fn settings() -> Settings {
    Settings {
        randomize_nodes: false,
        ..Settings::for_bucket("travel")
    }
}

fn monitor(settings: Settings, cluster: &MockCluster) -> (Confmon, Arc<Recorder>) {
    let mut monitor = Confmon::new(settings, cluster.connector());
    monitor.configure_nodes(ProviderKind::Cccp, &hosts("n1;n2", 11210));
    monitor.configure_nodes(ProviderKind::Http, &hosts("n1;n2", MGMT_PORT));
    let recorder = Arc::new(Recorder::default());
    monitor.add_listener(recorder.clone());
    (monitor, recorder)
}

async fn pump_until_idle(monitor: &mut Confmon) {
    while monitor.is_refreshing() {
        monitor.pump().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn bootstrap_over_cccp_disables_streaming() {
    let cluster = MockCluster::new();
    cluster.refuse("n1");
    cluster.kv_reply("n2", KvReply::Config(bucket_json(5)));
    let (mut monitor, recorder) = monitor(settings(), &cluster);

    let config = monitor.bootstrap().await.unwrap();
    assert_eq!(config.revision(), Some(5));
    assert_eq!(config.origin(), ProviderKind::Cccp);
    assert_eq!(monitor.error_count(), 0);
    assert!(!monitor.is_enabled(ProviderKind::Http));
    assert_eq!(recorder.events(), vec![(ConfigEvent::GotNewConfig, Some(5))]);

    // The deferred stop pauses providers on the next turn.
    monitor.run_pending();
    assert_eq!(recorder.count(ConfigEvent::MonitorStopped), 1);
}

#[tokio::test(start_paused = true)]
async fn unsupported_cccp_falls_back_to_streaming() {
    let cluster = MockCluster::new();
    cluster.kv_reply("n1", KvReply::Status(0x83));
    cluster.kv_reply("n2", KvReply::Status(0x81));
    cluster.stream_maps(vec![bucket_json(3)]);
    let (mut monitor, recorder) = monitor(settings(), &cluster);

    let config = monitor.bootstrap().await.unwrap();
    assert_eq!(config.origin(), ProviderKind::Http);
    assert_eq!(config.revision(), Some(3));
    assert_eq!(
        monitor.last_error(),
        Some(&ConfigError::NotSupported {
            host: "n2:11210".into()
        })
    );
    let requests = cluster.http_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("GET /pools/default/bs/travel HTTP/1.1"));
    assert_eq!(recorder.count(ConfigEvent::GotNewConfig), 1);
}

#[tokio::test(start_paused = true)]
async fn exhaustion_is_reported_once_with_last_reason() {
    let cluster = MockCluster::new();
    cluster.refuse("n1");
    cluster.refuse("n2");
    let (mut monitor, recorder) = monitor(settings(), &cluster);

    match monitor.bootstrap().await {
        Err(ConfmonError::Exhausted {
            last: Some(ConfigError::Network { host, .. }),
        }) => assert_eq!(host, "n2:8091"),
        other => panic!("unexpected bootstrap result {other:?}"),
    }
    assert!(!monitor.is_refreshing());
    assert!(monitor.config().is_none());
    assert_eq!(recorder.count(ConfigEvent::ProvidersCycled), 1);
    assert_eq!(recorder.count(ConfigEvent::GotNewConfig), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_cluster_times_out_bootstrap() {
    let cluster = MockCluster::new();
    cluster.kv_reply("n1", KvReply::Silent);
    let settings = Settings {
        config_timeout: Duration::from_millis(1500),
        ..settings()
    };
    let (mut monitor, _) = monitor(settings, &cluster);
    monitor.configure_nodes(ProviderKind::Cccp, &hosts("n1", 11210));
    match monitor.bootstrap().await {
        Err(ConfmonError::BootstrapTimeout { waited }) => {
            assert_eq!(waited, Duration::from_millis(1500))
        }
        other => panic!("unexpected bootstrap result {other:?}"),
    }
    assert!(monitor.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn pushed_maps_only_move_forward() {
    let cluster = MockCluster::new();
    cluster.kv_reply("n1", KvReply::Config(bucket_json(5)));
    let (mut monitor, recorder) = monitor(settings(), &cluster);
    monitor.bootstrap().await.unwrap();
    monitor.run_pending();

    let n1 = HostPort::new("n1", 11210);
    monitor.cccp_update(&n1, bucket_json(4).as_bytes()).unwrap();
    monitor.cccp_update(&n1, bucket_json(5).as_bytes()).unwrap();
    assert_eq!(monitor.config().unwrap().revision(), Some(5));
    assert_eq!(recorder.count(ConfigEvent::GotNewConfig), 1);

    monitor.cccp_update(&n1, bucket_json(6).as_bytes()).unwrap();
    assert_eq!(monitor.config().unwrap().revision(), Some(6));
    assert_eq!(recorder.count(ConfigEvent::GotNewConfig), 2);

    assert!(monitor.cccp_update(&n1, b"{not json").is_err());
    assert_eq!(monitor.config().unwrap().revision(), Some(6));
}

#[tokio::test(start_paused = true)]
async fn throttle_yields_after_threshold() {
    let cluster = MockCluster::new();
    cluster.kv_reply("n1", KvReply::Config(bucket_json(5)));
    let settings = Settings {
        refresh_throttle: Duration::from_secs(30),
        refresh_error_threshold: 3,
        ..settings()
    };
    let (mut monitor, recorder) = monitor(settings, &cluster);
    monitor.bootstrap().await.unwrap();
    monitor.run_pending();
    let before = cluster.kv_requests();

    for _ in 0..3 {
        assert!(matches!(
            monitor.request_refresh(RefreshOptions::throttled()),
            RefreshRequest::Deferred { .. }
        ));
    }
    assert_eq!(monitor.request_refresh(RefreshOptions::throttled()), RefreshRequest::Started);
    pump_until_idle(&mut monitor).await;

    assert_eq!(cluster.kv_requests(), before + 1);
    // Same revision again: examined, not accepted.
    assert_eq!(recorder.count(ConfigEvent::GotAnyConfig), 1);
    assert_eq!(recorder.count(ConfigEvent::GotNewConfig), 1);
    assert_eq!(recorder.count(ConfigEvent::ProvidersCycled), 1);
}

#[tokio::test(start_paused = true)]
async fn deferred_refresh_runs_when_window_closes() {
    let cluster = MockCluster::new();
    cluster.kv_reply("n1", KvReply::Config(bucket_json(5)));
    let settings = Settings {
        refresh_throttle: Duration::from_millis(200),
        ..settings()
    };
    let (mut monitor, _) = monitor(settings, &cluster);
    monitor.bootstrap().await.unwrap();
    monitor.run_pending();
    let before = cluster.kv_requests();

    assert!(matches!(
        monitor.request_refresh(RefreshOptions::throttled()),
        RefreshRequest::Deferred { .. }
    ));
    assert!(monitor.is_refreshing());
    cluster.kv_reply("n1", KvReply::Config(bucket_json(8)));
    pump_until_idle(&mut monitor).await;
    assert_eq!(cluster.kv_requests(), before + 1);
    assert_eq!(monitor.config().unwrap().revision(), Some(8));
}

#[tokio::test(start_paused = true)]
async fn missing_cache_file_falls_through_to_cccp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.cache");
    let cluster = MockCluster::new();
    cluster.kv_reply("n1", KvReply::Config(bucket_json(5)));
    let settings = Settings {
        config_cache: Some(path.clone()),
        ..settings()
    };
    let (mut monitor, recorder) = monitor(settings, &cluster);
    assert_eq!(
        monitor.active_providers(),
        &[ProviderKind::File, ProviderKind::Cccp, ProviderKind::Http]
    );

    let config = monitor.bootstrap().await.unwrap();
    assert_eq!(config.origin(), ProviderKind::Cccp);
    assert_eq!(config.revision(), Some(5));
    assert!(matches!(
        monitor.last_error(),
        Some(ConfigError::CacheRejected { .. })
    ));
    assert_eq!(recorder.count(ConfigEvent::GotNewConfig), 1);
    assert_eq!(monitor.error_count(), 0);
    assert!(path.exists());
}

#[tokio::test(start_paused = true)]
async fn cache_file_bootstraps_then_network_map_is_written_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("travel.cache");
    std::fs::write(&path, format!("{}\n{CACHE_MAGIC}\n", bucket_json(3))).unwrap();

    let cluster = MockCluster::new();
    cluster.kv_reply("n1", KvReply::Config(bucket_json(5)));
    let settings = Settings {
        config_cache: Some(path.clone()),
        ..settings()
    };
    let (mut monitor, recorder) = monitor(settings, &cluster);
    assert_eq!(
        monitor.active_providers(),
        &[ProviderKind::File, ProviderKind::Cccp, ProviderKind::Http]
    );

    let config = monitor.bootstrap().await.unwrap();
    assert_eq!(config.origin(), ProviderKind::File);
    assert_eq!(config.revision(), Some(3));
    assert_eq!(cluster.kv_requests(), 0);

    monitor.start(true);
    pump_until_idle(&mut monitor).await;
    let config = monitor.config().unwrap();
    assert_eq!(config.origin(), ProviderKind::Cccp);
    assert_eq!(config.revision(), Some(5));
    assert_eq!(
        recorder
            .events()
            .into_iter()
            .filter(|(event, _)| *event == ConfigEvent::GotNewConfig)
            .map(|(_, rev)| rev)
            .collect::<Vec<_>>(),
        vec![Some(3), Some(5)]
    );

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("\"rev\":5"));
    assert!(written.trim_end().ends_with(CACHE_MAGIC));
}

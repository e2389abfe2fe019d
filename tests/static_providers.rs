mod common;

use common::{MockCluster, Recorder};
use confmon::{
    ConfigEvent, Confmon, ConnectionType, Distribution, Hostlist, ProviderKind, ServiceMode,
    ServiceType, Settings,
};
use std::sync::Arc;

fn only(monitor: &mut Confmon, kind: ProviderKind) {
    for other in ProviderKind::ORDERED {
        monitor.set_active(other, other == kind);
    }
}

#[tokio::test]
async fn raw_connection_bootstraps_without_network() {
    let cluster = MockCluster::new();
    let mut monitor = Confmon::new(Settings::for_bucket("cache"), cluster.connector());
    only(&mut monitor, ProviderKind::McRaw);
    let mut hosts = Hostlist::new();
    hosts.add_specs("mc-b:11211;mc-a:11211", 11211).unwrap();
    monitor.configure_nodes(ProviderKind::McRaw, &hosts);

    let config = monitor.bootstrap().await.unwrap();
    assert_eq!(config.origin(), ProviderKind::McRaw);
    assert_eq!(config.distribution(), Distribution::Ketama);
    assert_eq!(config.server_count(), 2);
    assert!(config.server_for_point(12345).is_some());
    assert_eq!(cluster.kv_requests(), 0);
}

#[tokio::test]
async fn admin_connection_without_hosts_is_exhausted() {
    let cluster = MockCluster::new();
    let settings = Settings {
        conn_type: ConnectionType::Cluster,
        ..Settings::default()
    };
    let mut monitor = Confmon::new(settings, cluster.connector());
    only(&mut monitor, ProviderKind::ClAdmin);
    let recorder = Arc::new(Recorder::default());
    monitor.add_listener(recorder.clone());

    assert!(monitor.bootstrap().await.is_err());
    assert_eq!(recorder.count(ConfigEvent::ProvidersCycled), 1);

    let mut hosts = Hostlist::new();
    hosts.add_specs("admin1", 8091).unwrap();
    monitor.configure_nodes(ProviderKind::ClAdmin, &hosts);
    let config = monitor.bootstrap().await.unwrap();
    assert_eq!(config.vbucket_count(), 0);
    assert_eq!(
        config.endpoints(ServiceType::Mgmt, ServiceMode::Plain)[0].to_string(),
        "admin1:8091"
    );
}

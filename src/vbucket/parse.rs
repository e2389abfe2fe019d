use super::{
    AltAddress, Distribution, Server, ServiceType, Services, VbucketConfig,
};
use crate::hostlist::HostPort;
use crate::util::VbucketError;
use serde_json::{json, Map, Value};

const HOST_PLACEHOLDER: &str = "$HOST";
/// Clusters keep at most three copies besides the active one.
const MAX_REPLICAS: usize = 3;

impl VbucketConfig {
    /// Parses a map without a source node; `$HOST` placeholders are kept.
    pub fn parse(data: &str) -> Result<Self, VbucketError> {
        Self::parse_from(data, None, None)
    }

    /// Parses a map fetched from `source` (a bare hostname or address).
    ///
    /// `$HOST` placeholders are replaced with `source`, and when `network`
    /// is `None` the network is guessed by matching `source` against the
    /// advertised and alternate hostnames.
    pub fn parse_from(
        data: &str,
        source: Option<&str>,
        network: Option<&str>,
    ) -> Result<Self, VbucketError> {
        let root: Value = serde_json::from_str(data)?;
        let root = root.as_object().ok_or(VbucketError::Field("<root>"))?;

        let distribution = match root.get("nodeLocator").and_then(Value::as_str) {
            Some("ketama") => Distribution::Ketama,
            Some(_) => Distribution::Vbucket,
            None => Distribution::Unknown,
        };
        let revision = root
            .get("rev")
            .and_then(Value::as_i64)
            .and_then(|rev| u64::try_from(rev).ok());

        let legacy_nodes = root.get("nodes").and_then(Value::as_array);
        let ext_nodes = root.get("nodesExt").and_then(Value::as_array);
        let (nodes, extended) = match (ext_nodes, legacy_nodes) {
            (Some(ext), _) => (ext, true),
            (None, Some(nodes)) => (nodes, false),
            (None, None) => return Err(VbucketError::Field("nodesExt")),
        };

        let network = match network {
            Some(name) => name.to_string(),
            None => guess_network(nodes, source),
        };

        let mut servers = Vec::with_capacity(nodes.len());
        for (index, node) in nodes.iter().enumerate() {
            let mut server = if extended {
                build_server_ext(node, &network).ok_or(VbucketError::Server { index })?
            } else {
                build_server_legacy(node).ok_or(VbucketError::Server { index })?
            };
            // Nodes only listed in nodesExt are not serving this bucket's data.
            if extended && legacy_nodes.is_some_and(|legacy| index >= legacy.len()) {
                server.svc.set(ServiceType::Data, 0);
                server.svc_ssl.set(ServiceType::Data, 0);
                if let Some(alt) = server.alt.as_mut() {
                    alt.svc.set(ServiceType::Data, 0);
                    alt.svc_ssl.set(ServiceType::Data, 0);
                }
            }
            servers.push(server);
        }

        let mut cfg = VbucketConfig {
            name: root.get("name").and_then(Value::as_str).map(str::to_string),
            uuid: root.get("uuid").and_then(Value::as_str).map(str::to_string),
            revision,
            distribution,
            num_replicas: 0,
            servers,
            data_servers: 0,
            vbuckets: Vec::new(),
            forward_vbuckets: None,
            continuum: Vec::new(),
            capabilities: root
                .get("bucketCapabilities")
                .and_then(Value::as_array)
                .map(|caps| {
                    caps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            network,
        };

        if distribution == Distribution::Vbucket {
            let server_map = root
                .get("vBucketServerMap")
                .and_then(Value::as_object)
                .ok_or(VbucketError::Field("vBucketServerMap"))?;
            cfg.num_replicas = server_map
                .get("numReplicas")
                .and_then(Value::as_u64)
                .and_then(|replicas| usize::try_from(replicas).ok())
                .filter(|replicas| *replicas <= MAX_REPLICAS)
                .ok_or(VbucketError::Field("numReplicas"))?;
            cfg.vbuckets = parse_vbmap(server_map.get("vBucketMap"), cfg.num_replicas)?
                .ok_or(VbucketError::Field("vBucketMap"))?;
            cfg.forward_vbuckets =
                parse_vbmap(server_map.get("vBucketMapForward"), cfg.num_replicas)?;
            if !extended {
                pair_server_list(&mut cfg, server_map)?;
            }
            cfg.check_server_indexes()?;
        }

        if let Some(source) = source {
            cfg.replace_host(source);
        }
        cfg.count_leading_data_servers();
        cfg.assign_vbucket_counts();
        if cfg.distribution == Distribution::Ketama {
            cfg.update_ketama();
        }
        Ok(cfg)
    }

    /// Replaces `$HOST` placeholders in server hostnames with `host`.
    pub fn replace_host(&mut self, host: &str) {
        for server in &mut self.servers {
            if server.hostname.contains(HOST_PLACEHOLDER) {
                server.hostname = server.hostname.replacen(HOST_PLACEHOLDER, host, 1);
            }
        }
    }

    /// Serialises the map in the extended (`nodesExt`) layout.
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        if self.distribution != Distribution::Unknown {
            root.insert("nodeLocator".into(), json!(self.distribution.as_str()));
        }
        if let Some(uuid) = &self.uuid {
            root.insert("uuid".into(), json!(uuid));
        }
        if let Some(rev) = self.revision {
            root.insert("rev".into(), json!(rev));
        }
        if let Some(name) = &self.name {
            root.insert("name".into(), json!(name));
        }
        let nodes: Vec<Value> = self
            .servers
            .iter()
            .map(|server| {
                let mut services = Map::new();
                for svc in ServiceType::ALL {
                    if let Some(port) = server.svc.port(svc) {
                        services.insert(svc.json_key().into(), json!(port));
                    }
                    if let Some(port) = server.svc_ssl.port(svc) {
                        services.insert(format!("{}SSL", svc.json_key()), json!(port));
                    }
                }
                json!({ "hostname": server.hostname, "services": services })
            })
            .collect();
        root.insert("nodesExt".into(), Value::Array(nodes));
        if self.distribution == Distribution::Vbucket {
            let mut server_map = Map::new();
            server_map.insert("numReplicas".into(), json!(self.num_replicas));
            server_map.insert("vBucketMap".into(), json!(self.vbuckets));
            if let Some(forward) = &self.forward_vbuckets {
                server_map.insert("vBucketMapForward".into(), json!(forward));
            }
            root.insert("vBucketServerMap".into(), Value::Object(server_map));
        }
        if !self.capabilities.is_empty() {
            root.insert("bucketCapabilities".into(), json!(self.capabilities));
        }
        Value::Object(root)
    }

    fn check_server_indexes(&self) -> Result<(), VbucketError> {
        let rows = self
            .vbuckets
            .iter()
            .chain(self.forward_vbuckets.iter().flatten());
        for (index, row) in rows.enumerate() {
            for server in row {
                if *server >= 0 && *server as usize >= self.servers.len() {
                    return Err(VbucketError::ServerIndex {
                        index,
                        server: *server,
                        servers: self.servers.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn extract_services(obj: Option<&Value>, ssl: bool) -> Services {
    let mut services = Services::default();
    let Some(obj) = obj.and_then(Value::as_object) else {
        return services;
    };
    for svc in ServiceType::ALL {
        let key = if ssl {
            format!("{}SSL", svc.json_key())
        } else {
            svc.json_key().to_string()
        };
        if let Some(port) = obj
            .get(&key)
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
        {
            services.set(svc, port);
        }
    }
    services
}

fn build_server_ext(node: &Value, network: &str) -> Option<Server> {
    let hostname = node
        .get("hostname")
        .and_then(Value::as_str)
        .unwrap_or(HOST_PLACEHOLDER);
    let services = node.get("services")?;
    let mut server = Server::new(
        hostname,
        extract_services(Some(services), false),
        extract_services(Some(services), true),
    );
    if network != "default" {
        server.alt = node
            .get("alternateAddresses")
            .and_then(|alt| alt.get(network))
            .and_then(|alt| {
                let hostname = alt.get("hostname").and_then(Value::as_str)?;
                let mut svc = extract_services(alt.get("ports"), false);
                let mut svc_ssl = extract_services(alt.get("ports"), true);
                svc.fill_missing_from(&server.svc);
                svc_ssl.fill_missing_from(&server.svc_ssl);
                Some(AltAddress {
                    hostname: hostname.to_string(),
                    svc,
                    svc_ssl,
                })
            });
    }
    Some(server)
}

/// Legacy `nodes` entry: `hostname` is the management `host:port`.
fn build_server_legacy(node: &Value) -> Option<Server> {
    let mgmt = node.get("hostname").and_then(Value::as_str)?;
    let mgmt = HostPort::parse(mgmt, 0).ok().filter(|hp| hp.port != 0)?;
    let direct = node
        .get("ports")
        .and_then(|ports| ports.get("direct"))
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())?;
    let mut svc = Services::default()
        .with(ServiceType::Mgmt, mgmt.port)
        .with(ServiceType::Data, direct);
    let mut view_path = None;
    if let Some(base) = node.get("couchApiBase").and_then(Value::as_str) {
        let after_scheme = base.split_once("://").map_or(base, |(_, rest)| rest);
        let (authority, path) = after_scheme
            .find('/')
            .map_or((after_scheme, None), |ix| {
                (&after_scheme[..ix], Some(&after_scheme[ix..]))
            });
        let port = authority
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())?;
        svc.set(ServiceType::Views, port);
        view_path = Some(path?.to_string());
    }
    let mut server = Server::new(mgmt.host, svc, Services::default());
    server.view_path = view_path;
    Some(server)
}

fn guess_network(nodes: &[Value], source: Option<&str>) -> String {
    let Some(source) = source else {
        return "default".to_string();
    };
    for node in nodes {
        if node.get("hostname").and_then(Value::as_str) == Some(source) {
            return "default".to_string();
        }
        if let Some(alts) = node.get("alternateAddresses").and_then(Value::as_object) {
            for (name, alt) in alts {
                if alt.get("hostname").and_then(Value::as_str) == Some(source) {
                    return name.clone();
                }
            }
        }
    }
    "default".to_string()
}

fn parse_vbmap(value: Option<&Value>, replicas: usize) -> Result<Option<Vec<Vec<i32>>>, VbucketError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let rows = value
        .as_array()
        .ok_or(VbucketError::Field("vBucketMap"))?;
    let width = replicas
        .checked_add(1)
        .ok_or(VbucketError::Field("numReplicas"))?;
    let mut map = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row.as_array().ok_or(VbucketError::Field("vBucketMap"))?;
        let mut entry = Vec::with_capacity(width);
        for ix in row.iter().take(width) {
            let ix = ix
                .as_i64()
                .and_then(|ix| i32::try_from(ix).ok())
                .ok_or(VbucketError::Field("vBucketMap"))?;
            entry.push(ix);
        }
        entry.resize(width, -1);
        map.push(entry);
    }
    Ok(Some(map))
}

/// Reorders legacy servers to follow `serverList`, which is what the
/// vBucket map indexes into.
fn pair_server_list(
    cfg: &mut VbucketConfig,
    server_map: &Map<String, Value>,
) -> Result<(), VbucketError> {
    let list = server_map
        .get("serverList")
        .and_then(Value::as_array)
        .ok_or(VbucketError::Field("serverList"))?;
    let mut paired = Vec::with_capacity(list.len());
    for (index, entry) in list.iter().enumerate() {
        let authority = entry
            .as_str()
            .ok_or(VbucketError::Field("serverList"))?;
        match cfg
            .servers
            .iter()
            .find(|server| server.authority() == authority)
        {
            Some(server) => paired.push(server.clone()),
            None => {
                let hp = HostPort::parse(authority, 0)
                    .map_err(|_| VbucketError::Server { index })?;
                paired.push(Server::new(
                    hp.host,
                    Services::default().with(ServiceType::Data, hp.port),
                    Services::default(),
                ));
            }
        }
    }
    cfg.servers = paired;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::bucket_json;
    use super::*;
    use crate::vbucket::ServiceMode;

    const LEGACY: &str = r#"{
      "name": "default",
      "nodeLocator": "vbucket",
      "nodes": [
        {"hostname": "b.local:8091", "ports": {"direct": 11210}, "couchApiBase": "http://b.local:8092/default"},
        {"hostname": "a.local:8091", "ports": {"direct": 11210}}
      ],
      "vBucketServerMap": {
        "numReplicas": 0,
        "serverList": ["a.local:11210", "b.local:11210"],
        "vBucketMap": [[0], [1]]
      }
    }"#;

    #[test]
    fn host_placeholder_is_replaced() {
        let cfg = VbucketConfig::parse_from(&bucket_json(3), Some("::1"), None).unwrap();
        assert_eq!(cfg.servers()[1].hostname, "::1");
        assert_eq!(cfg.servers()[1].authority(), "[::1]:11210");
        assert_eq!(cfg.revision(), Some(3));
        assert_eq!(cfg.bucket_name(), Some("travel"));

        let raw = VbucketConfig::parse(&bucket_json(3)).unwrap();
        assert_eq!(raw.servers()[1].hostname, "$HOST");
    }

    #[test]
    fn legacy_layout_follows_server_list() {
        let cfg = VbucketConfig::parse(LEGACY).unwrap();
        assert_eq!(cfg.revision(), None);
        assert_eq!(cfg.servers()[0].hostname, "a.local");
        assert_eq!(cfg.servers()[1].view_path.as_deref(), Some("/default"));
        assert_eq!(
            cfg.hostport(1, ServiceType::Views, ServiceMode::Plain),
            Some(HostPort::new("b.local", 8092))
        );
        assert_eq!(cfg.master(0), Some(0));
    }

    #[test]
    fn rejects_maps_without_nodes_or_with_bad_indexes() {
        assert!(matches!(
            VbucketConfig::parse(r#"{"rev": 1}"#),
            Err(VbucketError::Field("nodesExt"))
        ));
        assert!(matches!(
            VbucketConfig::parse("not json"),
            Err(VbucketError::Json(_))
        ));
        let bad = r#"{"nodeLocator": "vbucket",
            "nodesExt": [{"hostname": "a", "services": {"kv": 11210}}],
            "vBucketServerMap": {"numReplicas": 0, "vBucketMap": [[3]]}}"#;
        assert!(matches!(
            VbucketConfig::parse(bad),
            Err(VbucketError::ServerIndex { server: 3, .. })
        ));
    }

    #[test]
    fn oversized_replica_count_is_rejected() {
        for replicas in ["18446744073709551615", "1099511627776", "4"] {
            let map = format!(
                r#"{{"nodeLocator": "vbucket",
                "nodesExt": [{{"hostname": "a", "services": {{"kv": 11210}}}}],
                "vBucketServerMap": {{"numReplicas": {replicas}, "vBucketMap": [[0]]}}}}"#
            );
            assert!(matches!(
                VbucketConfig::parse(&map),
                Err(VbucketError::Field("numReplicas"))
            ));
        }
        let three = r#"{"nodeLocator": "vbucket",
            "nodesExt": [{"hostname": "a", "services": {"kv": 11210}}],
            "vBucketServerMap": {"numReplicas": 3, "vBucketMap": [[0]]}}"#;
        let cfg = VbucketConfig::parse(three).unwrap();
        assert_eq!(cfg.num_replicas(), 3);
        assert_eq!(cfg.master(0), Some(0));
        assert_eq!(cfg.replica(0, 3), None);
    }

    #[test]
    fn guesses_external_network_from_source() {
        let cfg = VbucketConfig::parse_from(&bucket_json(1), Some("ext.example"), None).unwrap();
        assert_eq!(cfg.network(), "external");
    }

    #[test]
    fn json_output_reparses_to_same_map() {
        let cfg = VbucketConfig::parse_from(&bucket_json(11), Some("10.0.0.2"), None).unwrap();
        let text = cfg.to_json().to_string();
        let again = VbucketConfig::parse(&text).unwrap();
        assert_eq!(again.bucket_name(), cfg.bucket_name());
        assert_eq!(again.revision(), Some(11));
        assert_eq!(again.servers(), cfg.servers());
        assert_eq!(again.vbucket_count(), 4);
    }
}

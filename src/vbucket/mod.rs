//! Parsed cluster map: servers, their service endpoints and the partition
//! (vBucket) ownership table.
//!
//! A [`VbucketConfig`] is built once by [`VbucketConfig::parse_from`] or one of
//! the generators and is never mutated after it has been wrapped in a
//! [`ConfigInfo`](crate::snapshot::ConfigInfo).

mod diff;
mod generate;
mod parse;

pub use diff::ConfigDiff;

use crate::hostlist::HostPort;

/// How keys are distributed over servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Vbucket,
    Ketama,
    /// The map carried no `nodeLocator`; typical for cluster-level maps.
    Unknown,
}

impl Distribution {
    pub fn as_str(self) -> &'static str {
        match self {
            Distribution::Vbucket => "vbucket",
            Distribution::Ketama => "ketama",
            Distribution::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Data,
    Mgmt,
    Views,
    Query,
    Search,
    IndexAdmin,
    IndexScan,
    Analytics,
}

impl ServiceType {
    pub const ALL: [ServiceType; 8] = [
        ServiceType::Data,
        ServiceType::Mgmt,
        ServiceType::Views,
        ServiceType::Query,
        ServiceType::Search,
        ServiceType::IndexAdmin,
        ServiceType::IndexScan,
        ServiceType::Analytics,
    ];

    /// Key used for this service inside a `services` object.
    pub fn json_key(self) -> &'static str {
        match self {
            ServiceType::Data => "kv",
            ServiceType::Mgmt => "mgmt",
            ServiceType::Views => "capi",
            ServiceType::Query => "n1ql",
            ServiceType::Search => "fts",
            ServiceType::IndexAdmin => "indexAdmin",
            ServiceType::IndexScan => "indexScan",
            ServiceType::Analytics => "cbas",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Plain,
    Ssl,
}

/// Port per service; zero means the service is not offered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Services {
    ports: [u16; 8],
}

impl Services {
    pub fn port(&self, svc: ServiceType) -> Option<u16> {
        match self.ports[svc.slot()] {
            0 => None,
            port => Some(port),
        }
    }

    pub fn set(&mut self, svc: ServiceType, port: u16) {
        self.ports[svc.slot()] = port;
    }

    pub fn with(mut self, svc: ServiceType, port: u16) -> Self {
        self.set(svc, port);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ports.iter().all(|port| *port == 0)
    }

    fn fill_missing_from(&mut self, other: &Services) {
        for (dst, src) in self.ports.iter_mut().zip(other.ports.iter()) {
            if *dst == 0 {
                *dst = *src;
            }
        }
    }
}

/// Alternate (e.g. `external`) addressing for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltAddress {
    pub hostname: String,
    pub svc: Services,
    pub svc_ssl: Services,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub hostname: String,
    pub svc: Services,
    pub svc_ssl: Services,
    pub alt: Option<AltAddress>,
    pub view_path: Option<String>,
    vbucket_count: usize,
}

impl Server {
    pub fn new(hostname: impl Into<String>, svc: Services, svc_ssl: Services) -> Self {
        Self {
            hostname: hostname.into(),
            svc,
            svc_ssl,
            alt: None,
            view_path: None,
            vbucket_count: 0,
        }
    }

    /// `host:dataport`, the identity used for ketama points and diffs.
    pub fn authority(&self) -> String {
        HostPort::new(
            self.hostname.clone(),
            self.svc.port(ServiceType::Data).unwrap_or(0),
        )
        .to_string()
    }

    pub fn has_data(&self) -> bool {
        self.svc.port(ServiceType::Data).is_some()
    }

    /// Number of vBucket slots (active and replica) this server holds.
    pub fn vbucket_count(&self) -> usize {
        self.vbucket_count
    }

    fn services(&self, mode: ServiceMode) -> &Services {
        match mode {
            ServiceMode::Plain => &self.svc,
            ServiceMode::Ssl => &self.svc_ssl,
        }
    }
}

/// One point on the ketama ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuumPoint {
    pub point: u32,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbucketConfig {
    name: Option<String>,
    uuid: Option<String>,
    revision: Option<u64>,
    distribution: Distribution,
    num_replicas: usize,
    servers: Vec<Server>,
    data_servers: usize,
    vbuckets: Vec<Vec<i32>>,
    forward_vbuckets: Option<Vec<Vec<i32>>>,
    continuum: Vec<ContinuumPoint>,
    capabilities: Vec<String>,
    network: String,
}

impl VbucketConfig {
    pub fn bucket_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server(&self, ix: usize) -> Option<&Server> {
        self.servers.get(ix)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Servers at the front of the list that carry the data service.
    pub fn data_server_count(&self) -> usize {
        self.data_servers
    }

    pub fn vbucket_count(&self) -> usize {
        self.vbuckets.len()
    }

    pub fn has_forward_map(&self) -> bool {
        self.forward_vbuckets.is_some()
    }

    pub fn continuum(&self) -> &[ContinuumPoint] {
        &self.continuum
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }

    /// Network whose addresses `hostport` hands out (`default` or an
    /// alternate name such as `external`).
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Index of the active server for `vbid`.
    pub fn master(&self, vbid: usize) -> Option<usize> {
        self.replica(vbid, 0)
    }

    /// Index of the server holding copy `copy` of `vbid` (0 is the active).
    pub fn replica(&self, vbid: usize, copy: usize) -> Option<usize> {
        let ix = *self.vbuckets.get(vbid)?.get(copy)?;
        usize::try_from(ix).ok()
    }

    pub fn forward_master(&self, vbid: usize) -> Option<usize> {
        let row = self.forward_vbuckets.as_ref()?.get(vbid)?;
        usize::try_from(*row.first()?).ok()
    }

    /// Server owning the first continuum point at or after `point`.
    pub fn server_for_point(&self, point: u32) -> Option<usize> {
        if self.continuum.is_empty() {
            return None;
        }
        let pos = self.continuum.partition_point(|p| p.point < point);
        let entry = self.continuum.get(pos).unwrap_or(&self.continuum[0]);
        Some(entry.index)
    }

    /// Address of `svc` on server `ix`, honouring the selected network.
    pub fn hostport(&self, ix: usize, svc: ServiceType, mode: ServiceMode) -> Option<HostPort> {
        let server = self.servers.get(ix)?;
        if self.network != "default" {
            if let Some(alt) = &server.alt {
                let ports = match mode {
                    ServiceMode::Plain => &alt.svc,
                    ServiceMode::Ssl => &alt.svc_ssl,
                };
                return ports
                    .port(svc)
                    .map(|port| HostPort::new(alt.hostname.clone(), port));
            }
        }
        server
            .services(mode)
            .port(svc)
            .map(|port| HostPort::new(server.hostname.clone(), port))
    }

    /// Every server address offering `svc`, in server order.
    pub fn endpoints(&self, svc: ServiceType, mode: ServiceMode) -> Vec<HostPort> {
        (0..self.servers.len())
            .filter_map(|ix| self.hostport(ix, svc, mode))
            .collect()
    }

    fn count_leading_data_servers(&mut self) {
        self.data_servers = self
            .servers
            .iter()
            .take_while(|server| server.has_data())
            .count();
    }

    fn assign_vbucket_counts(&mut self) {
        for server in &mut self.servers {
            server.vbucket_count = 0;
        }
        let rows = self
            .vbuckets
            .iter()
            .chain(self.forward_vbuckets.iter().flatten());
        for row in rows {
            for ix in row {
                if let Some(server) = usize::try_from(*ix)
                    .ok()
                    .and_then(|ix| self.servers.get_mut(ix))
                {
                    server.vbucket_count += 1;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::bucket_json;
    use super::*;

    #[test]
    fn accessors_report_routing_table() {
        let cfg = VbucketConfig::parse_from(&bucket_json(7), Some("10.0.0.2"), None).unwrap();
        assert_eq!(cfg.server_count(), 3);
        assert_eq!(cfg.data_server_count(), 2);
        assert_eq!(cfg.vbucket_count(), 4);
        assert_eq!(cfg.master(1), Some(1));
        assert_eq!(cfg.replica(2, 1), None);
        assert_eq!(cfg.master(9), None);
        assert_eq!(cfg.servers()[0].vbucket_count(), 4);
        assert_eq!(
            cfg.hostport(0, ServiceType::Data, ServiceMode::Ssl),
            Some(HostPort::new("10.0.0.1", 11207))
        );
        assert_eq!(cfg.hostport(2, ServiceType::Data, ServiceMode::Plain), None);
        assert_eq!(
            cfg.endpoints(ServiceType::Mgmt, ServiceMode::Plain).len(),
            3
        );
        assert!(cfg.has_capability("cccp"));
    }

    #[test]
    fn alternate_network_overrides_addresses() {
        let cfg =
            VbucketConfig::parse_from(&bucket_json(7), Some("10.0.0.2"), Some("external"))
                .unwrap();
        assert_eq!(cfg.network(), "external");
        assert_eq!(
            cfg.hostport(1, ServiceType::Data, ServiceMode::Plain),
            Some(HostPort::new("ext.example", 31210))
        );
        // Ports missing from the alternate block fall back to the defaults.
        assert_eq!(
            cfg.hostport(1, ServiceType::Mgmt, ServiceMode::Plain),
            Some(HostPort::new("ext.example", 8091))
        );
        // Servers without an alternate address keep their own.
        assert_eq!(
            cfg.hostport(0, ServiceType::Data, ServiceMode::Plain),
            Some(HostPort::new("10.0.0.1", 11210))
        );
    }
}

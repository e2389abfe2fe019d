use super::{ContinuumPoint, Distribution, Server, VbucketConfig};
use crate::util::VbucketError;

/// Hashes per server on the ketama ring; each digest yields four points.
const KETAMA_HASHES_PER_SERVER: usize = 40;
const KETAMA_POINTS_PER_HASH: usize = 4;

impl VbucketConfig {
    /// Builds a synthetic map over `servers`.
    ///
    /// vBucket `i` is owned by server `i % n`; copy `j` lives on
    /// `(i + j) % n`. Copies that would wrap back onto the owner are left
    /// unassigned.
    pub fn generate(
        name: &str,
        uuid: Option<&str>,
        servers: Vec<Server>,
        num_replicas: usize,
        num_vbuckets: usize,
    ) -> Result<Self, VbucketError> {
        if servers.is_empty() {
            return Err(VbucketError::NoServers);
        }
        let nsrv = servers.len();
        let vbuckets = (0..num_vbuckets)
            .map(|vbid| {
                let master = vbid % nsrv;
                (0..=num_replicas)
                    .map(|copy| {
                        if copy > 0 && copy >= nsrv {
                            -1
                        } else {
                            ((master + copy) % nsrv) as i32
                        }
                    })
                    .collect()
            })
            .collect();
        let mut cfg = VbucketConfig {
            name: Some(name.to_string()),
            uuid: uuid.map(str::to_string),
            revision: None,
            distribution: Distribution::Vbucket,
            num_replicas,
            servers,
            data_servers: 0,
            vbuckets,
            forward_vbuckets: None,
            continuum: Vec::new(),
            capabilities: Vec::new(),
            network: "default".to_string(),
        };
        cfg.count_leading_data_servers();
        cfg.assign_vbucket_counts();
        Ok(cfg)
    }

    /// Converts the map to ketama distribution, dropping the vBucket table.
    pub fn make_ketama(&mut self) {
        self.distribution = Distribution::Ketama;
        self.num_replicas = 0;
        self.vbuckets.clear();
        self.forward_vbuckets = None;
        self.assign_vbucket_counts();
        self.update_ketama();
    }

    /// Rebuilds the continuum over the data servers, which are first sorted
    /// by authority so every client derives the same ring.
    pub(super) fn update_ketama(&mut self) {
        let ndata = self.data_servers.min(self.servers.len());
        self.servers[..ndata].sort_by_key(Server::authority);
        let mut continuum =
            Vec::with_capacity(ndata * KETAMA_HASHES_PER_SERVER * KETAMA_POINTS_PER_HASH);
        for (index, server) in self.servers[..ndata].iter().enumerate() {
            let authority = server.authority();
            for hash in 0..KETAMA_HASHES_PER_SERVER {
                let digest = md5::compute(format!("{authority}-{hash}"));
                for chunk in digest.chunks_exact(4).take(KETAMA_POINTS_PER_HASH) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    continuum.push(ContinuumPoint { point, index });
                }
            }
        }
        continuum.sort_by_key(|entry| entry.point);
        self.continuum = continuum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbucket::{ServiceType, Services};

    fn data_server(host: &str) -> Server {
        Server::new(
            host,
            Services::default().with(ServiceType::Data, 11210),
            Services::default(),
        )
    }

    #[test]
    fn round_robin_assignment() {
        let cfg = VbucketConfig::generate(
            "gen",
            None,
            vec![data_server("a"), data_server("b"), data_server("c")],
            1,
            6,
        )
        .unwrap();
        assert_eq!(cfg.master(0), Some(0));
        assert_eq!(cfg.master(4), Some(1));
        assert_eq!(cfg.replica(2, 1), Some(0));
        assert_eq!(cfg.data_server_count(), 3);
        assert_eq!(cfg.revision(), None);
    }

    #[test]
    fn single_server_has_no_replica() {
        let cfg = VbucketConfig::generate("gen", None, vec![data_server("a")], 2, 2).unwrap();
        assert_eq!(cfg.replica(0, 1), None);
        assert!(VbucketConfig::generate("gen", None, Vec::new(), 0, 1).is_err());
    }

    #[test]
    fn ketama_ring_is_sorted_and_complete() {
        let mut cfg = VbucketConfig::generate(
            "gen",
            None,
            vec![data_server("b"), data_server("a")],
            0,
            2,
        )
        .unwrap();
        cfg.make_ketama();
        assert_eq!(cfg.distribution(), Distribution::Ketama);
        assert_eq!(cfg.vbucket_count(), 0);
        assert_eq!(cfg.servers()[0].hostname, "a");
        let ring = cfg.continuum();
        assert_eq!(ring.len(), 2 * 160);
        assert!(ring.windows(2).all(|pair| pair[0].point <= pair[1].point));
        let owner = cfg.server_for_point(ring[5].point).unwrap();
        assert_eq!(owner, ring[5].index);
        let last = ring[ring.len() - 1];
        if last.point < u32::MAX {
            assert_eq!(cfg.server_for_point(last.point + 1), Some(ring[0].index));
        }
    }

    #[test]
    fn ketama_points_match_md5_continuum() {
        let mut cfg = VbucketConfig::generate("gen", None, vec![data_server("a")], 0, 1).unwrap();
        cfg.make_ketama();
        let points: Vec<u32> = cfg.continuum().iter().map(|entry| entry.point).collect();
        // md5("a:11210-0") read as four little-endian words.
        for point in [2932097236, 1882959152, 766688037, 2077022031] {
            assert!(points.contains(&point), "missing ring point {point}");
        }
        assert_eq!(points.first(), Some(&59831557));
        assert_eq!(points.last(), Some(&4284889010));
    }
}

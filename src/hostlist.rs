//! Host/port endpoints and the round-robin lists providers walk through.

use crate::util::HostParseError;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`. A bare IPv6
    /// address without brackets is accepted and takes the default port.
    pub fn parse(spec: &str, default_port: u16) -> Result<Self, HostParseError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(HostParseError::Empty);
        }
        if let Some(rest) = spec.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| HostParseError::UnterminatedIpv6(spec.to_string()))?;
            let host = &rest[..end];
            let tail = &rest[end + 1..];
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, spec)?,
                None if tail.is_empty() => default_port,
                None => return Err(HostParseError::Port(spec.to_string())),
            };
            return Ok(Self::new(host, port));
        }
        match spec.matches(':').count() {
            0 => Ok(Self::new(spec, default_port)),
            1 => {
                let (host, port) = spec
                    .split_once(':')
                    .ok_or_else(|| HostParseError::Port(spec.to_string()))?;
                if host.is_empty() {
                    return Err(HostParseError::Empty);
                }
                Ok(Self::new(host, parse_port(port, spec)?))
            }
            _ => Ok(Self::new(spec, default_port)),
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }
}

fn parse_port(port: &str, spec: &str) -> Result<u16, HostParseError> {
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(HostParseError::Port(spec.to_string())),
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Ordered, de-duplicated set of endpoints with a cursor.
///
/// `next(wrap)` hands out hosts in order; with `wrap == false` it returns
/// `None` once every host has been offered since the last wrap, which is
/// how providers detect that a pass over their nodes is exhausted.
#[derive(Debug, Clone, Default)]
pub struct Hostlist {
    hosts: Vec<HostPort>,
    cursor: usize,
}

impl Hostlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, host: HostPort) {
        if !self.hosts.contains(&host) {
            self.hosts.push(host);
        }
    }

    /// Adds every `;`/`,`-separated entry of `specs`.
    pub fn add_specs(&mut self, specs: &str, default_port: u16) -> Result<(), HostParseError> {
        for spec in specs
            .split([';', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            self.add(HostPort::parse(spec, default_port)?);
        }
        Ok(())
    }

    pub fn next(&mut self, wrap: bool) -> Option<&HostPort> {
        if self.hosts.is_empty() {
            return None;
        }
        if self.cursor >= self.hosts.len() {
            if !wrap {
                return None;
            }
            self.cursor = 0;
        }
        let ix = self.cursor;
        self.cursor += 1;
        self.hosts.get(ix)
    }

    pub fn exhausted(&self) -> bool {
        self.cursor >= self.hosts.len()
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    pub fn randomize(&mut self) {
        self.hosts.shuffle(&mut thread_rng());
        self.cursor = 0;
    }

    pub fn assign(&mut self, other: &Hostlist) {
        self.hosts.clone_from(&other.hosts);
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.hosts.clear();
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn contains(&self, host: &HostPort) -> bool {
        self.hosts.contains(host)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostPort> {
        self.hosts.iter()
    }
}

impl FromIterator<HostPort> for Hostlist {
    fn from_iter<T: IntoIterator<Item = HostPort>>(iter: T) -> Self {
        let mut list = Hostlist::new();
        for host in iter {
            list.add(host);
        }
        list
    }
}

impl fmt::Display for Hostlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (ix, host) in self.hosts.iter().enumerate() {
            if ix > 0 {
                f.write_str(",")?;
            }
            write!(f, "{host}")?;
        }
        Ok(())
    }
}

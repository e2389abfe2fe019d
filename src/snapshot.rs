//! Immutable, shared topology snapshots.
//!
//! A [`ConfigInfo`] pairs a parsed map with the provider that produced it and
//! a comparison clock. Snapshots are handed around as `Arc<ConfigInfo>`:
//! cloning the handle takes a reference and dropping it releases one, so the
//! monitor, the providers and readers elsewhere in the client can each keep
//! the map alive without coordinating.

use crate::provider::ProviderKind;
use crate::vbucket::VbucketConfig;
use std::cmp::Ordering;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

static CREATION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Freshness clock of a snapshot.
///
/// Revisions are compared when both maps carry one; otherwise the creation
/// sequence decides, so a revision-less map (static, legacy) is newer than
/// anything created before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareClock {
    pub revision: Option<u64>,
    pub sequence: u64,
}

impl CompareClock {
    pub fn compare(&self, other: &CompareClock) -> Ordering {
        match (self.revision, other.revision) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.sequence.cmp(&other.sequence),
        }
    }
}

#[derive(Debug)]
pub struct ConfigInfo {
    config: VbucketConfig,
    origin: ProviderKind,
    clock: CompareClock,
}

impl ConfigInfo {
    pub fn create(config: VbucketConfig, origin: ProviderKind) -> Arc<Self> {
        let clock = CompareClock {
            revision: config.revision(),
            sequence: CREATION_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
        };
        Arc::new(Self {
            config,
            origin,
            clock,
        })
    }

    /// Ordering of `self` relative to `other`: `Greater` means newer.
    /// Equal clocks compare `Equal` whatever the origins.
    pub fn compare(&self, other: &ConfigInfo) -> Ordering {
        self.clock.compare(&other.clock)
    }

    pub fn is_newer_than(&self, other: &ConfigInfo) -> bool {
        self.compare(other) == Ordering::Greater
    }

    pub fn config(&self) -> &VbucketConfig {
        &self.config
    }

    pub fn origin(&self) -> ProviderKind {
        self.origin
    }

    pub fn clock(&self) -> CompareClock {
        self.clock
    }
}

impl Deref for ConfigInfo {
    type Target = VbucketConfig;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

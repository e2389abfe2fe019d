use super::VbucketConfig;
use std::fmt;

/// Summary of what changed between two maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub servers_added: Vec<String>,
    pub servers_removed: Vec<String>,
    /// The ordered server list differs, so vBucket indexes were renumbered.
    pub sequence_changed: bool,
    /// vBuckets whose active owner moved; `None` when the counts differ.
    pub vbucket_changes: Option<usize>,
}

impl ConfigDiff {
    pub fn between(from: &VbucketConfig, to: &VbucketConfig) -> Self {
        let old: Vec<String> = from.servers().iter().map(|s| s.authority()).collect();
        let new: Vec<String> = to.servers().iter().map(|s| s.authority()).collect();
        let servers_added = new.iter().filter(|s| !old.contains(s)).cloned().collect();
        let servers_removed = old.iter().filter(|s| !new.contains(s)).cloned().collect();
        let vbucket_changes = (from.vbucket_count() == to.vbucket_count()).then(|| {
            (0..to.vbucket_count())
                .filter(|vbid| {
                    let before = from.master(*vbid).and_then(|ix| old.get(ix));
                    let after = to.master(*vbid).and_then(|ix| new.get(ix));
                    before != after
                })
                .count()
        });
        Self {
            servers_added,
            servers_removed,
            sequence_changed: old != new,
            vbucket_changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers_added.is_empty()
            && self.servers_removed.is_empty()
            && !self.sequence_changed
            && self.vbucket_changes == Some(0)
    }
}

impl fmt::Display for ConfigDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added=[{}] removed=[{}] sequence_changed={} vbucket_changes={}",
            self.servers_added.join(","),
            self.servers_removed.join(","),
            self.sequence_changed,
            self.vbucket_changes
                .map_or_else(|| "all".to_string(), |n| n.to_string())
        )
    }
}

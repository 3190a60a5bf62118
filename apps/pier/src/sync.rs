//! Source→followers mirror mapping.
//!
//! The proxy consults this on every downstream frame; followers receive the
//! source's control traffic through their own pending-queue path. The map
//! only names sessions — a follower with no live session is skipped.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct SyncService {
    map: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl SyncService {
    /// Replace `target`'s follower set. Inputs are trimmed, deduplicated,
    /// emptied of blanks, and never contain the target itself. An empty
    /// result removes the mapping.
    pub fn set_mapping(&self, target: &str, devices: &[String]) -> Vec<String> {
        let target = target.trim();
        let followers: BTreeSet<String> = devices
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty() && *d != target)
            .map(str::to_string)
            .collect();
        let result = followers.iter().cloned().collect();
        let mut map = self.map.write().expect("sync lock");
        if followers.is_empty() {
            map.remove(target);
        } else {
            map.insert(target.to_string(), followers);
        }
        result
    }

    pub fn clear(&self) {
        self.map.write().expect("sync lock").clear();
    }

    pub fn followers_of(&self, source: &str) -> Vec<String> {
        self.map
            .read()
            .expect("sync lock")
            .get(source)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mappings(&self) -> HashMap<String, Vec<String>> {
        self.map
            .read()
            .expect("sync lock")
            .iter()
            .map(|(source, followers)| {
                (source.clone(), followers.iter().cloned().collect())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::timeout]
    fn normalizes_and_excludes_the_target() {
        let sync = SyncService::default();
        let stored = sync.set_mapping(
            "A",
            &[
                " B ".to_string(),
                "C".to_string(),
                "B".to_string(),
                "".to_string(),
                "A".to_string(),
            ],
        );
        assert_eq!(stored, vec!["B", "C"]);
        assert_eq!(sync.followers_of("A"), vec!["B", "C"]);
        // The invariant: a source never follows itself.
        assert!(!sync.followers_of("A").contains(&"A".to_string()));
    }

    #[test_deadline::timeout]
    fn empty_set_removes_the_mapping() {
        let sync = SyncService::default();
        sync.set_mapping("A", &["B".to_string()]);
        sync.set_mapping("A", &[]);
        assert!(sync.followers_of("A").is_empty());
        assert!(sync.mappings().is_empty());
    }

    #[test_deadline::timeout]
    fn clear_drops_everything() {
        let sync = SyncService::default();
        sync.set_mapping("A", &["B".to_string()]);
        sync.set_mapping("B", &["C".to_string()]);
        sync.clear();
        assert!(sync.mappings().is_empty());
    }
}

//! # Task Cache
//!
//! Bounded least-recently-used cache from task id to the task's host/CVE
//! membership, so callback handlers can resolve a host name without going
//! back to the progress store for every event.
//!
//! The cache is never the system of record. Eviction is silent: the next
//! lookup misses and the membership is rebuilt from the store.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::models::{CveHostUnit, HostInfo, RepoHostUnit};

/// Host metadata as seen by a callback handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberHost {
    pub host_id: i64,
    pub host_name: String,
    pub host_ip: String,
    /// CVEs assigned to this host (CVE tasks only)
    pub cves: BTreeSet<String>,
    /// Target repository (repo-set tasks only)
    pub repo_name: Option<String>,
}

impl MemberHost {
    pub fn info(&self) -> HostInfo {
        HostInfo::new(self.host_id, &self.host_name, &self.host_ip)
    }
}

/// Derived lookup structure for one task, keyed by host name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMembership {
    pub cves: BTreeSet<String>,
    pub hosts: HashMap<String, MemberHost>,
}

impl TaskMembership {
    /// Build from the unit rows of a CVE task
    pub fn make_cve_info(units: &[CveHostUnit]) -> Self {
        let mut membership = Self::default();
        for unit in units {
            membership.cves.insert(unit.cve_id.clone());
            membership
                .hosts
                .entry(unit.host_name.clone())
                .or_insert_with(|| MemberHost {
                    host_id: unit.host_id,
                    host_name: unit.host_name.clone(),
                    host_ip: unit.host_ip.clone(),
                    cves: BTreeSet::new(),
                    repo_name: None,
                })
                .cves
                .insert(unit.cve_id.clone());
        }
        membership
    }

    /// Build from the unit rows of a repo-set task
    pub fn make_host_info(units: &[RepoHostUnit]) -> Self {
        let hosts = units
            .iter()
            .map(|unit| {
                (
                    unit.host_name.clone(),
                    MemberHost {
                        host_id: unit.host_id,
                        host_name: unit.host_name.clone(),
                        host_ip: unit.host_ip.clone(),
                        cves: BTreeSet::new(),
                        repo_name: Some(unit.repo_name.clone()),
                    },
                )
            })
            .collect();
        Self {
            cves: BTreeSet::new(),
            hosts,
        }
    }

    /// Build from a plain host list (scan tasks)
    pub fn from_hosts(hosts: &[HostInfo]) -> Self {
        let hosts = hosts
            .iter()
            .map(|h| {
                (
                    h.host_name.clone(),
                    MemberHost {
                        host_id: h.host_id,
                        host_name: h.host_name.clone(),
                        host_ip: h.host_ip.clone(),
                        cves: BTreeSet::new(),
                        repo_name: None,
                    },
                )
            })
            .collect();
        Self {
            cves: BTreeSet::new(),
            hosts,
        }
    }

    pub fn host(&self, host_name: &str) -> Option<&MemberHost> {
        self.hosts.get(host_name)
    }

    pub fn has_cve(&self, cve_id: &str) -> bool {
        self.cves.contains(cve_id)
    }

    /// Hosts ordered by id, for deterministic result documents
    pub fn sorted_hosts(&self) -> Vec<&MemberHost> {
        let mut hosts: Vec<&MemberHost> = self.hosts.values().collect();
        hosts.sort_by_key(|h| h.host_id);
        hosts
    }
}

#[derive(Debug)]
struct Slot {
    value: Arc<TaskMembership>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<String, Slot>,
    clock: u64,
}

impl LruState {
    fn touch(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct TaskCache {
    capacity: usize,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    evictions: AtomicU64,
}

impl TaskCache {
    pub const DEFAULT_CAPACITY: usize = 100;

    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskMembership>> {
        let mut state = self.state.lock();
        let tick = state.touch();
        match state.entries.get_mut(task_id) {
            Some(slot) => {
                slot.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = task_id, "Cache HIT (task membership)");
                Some(Arc::clone(&slot.value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = task_id, "Cache MISS (task membership)");
                None
            }
        }
    }

    pub fn put(&self, task_id: &str, membership: TaskMembership) -> Arc<TaskMembership> {
        let value = Arc::new(membership);
        let mut state = self.state.lock();
        let tick = state.touch();

        if !state.entries.contains_key(task_id) && state.entries.len() >= self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %oldest, "Evicted least recently used task membership");
            }
        }

        state.entries.insert(
            task_id.to_string(),
            Slot {
                value: Arc::clone(&value),
                last_used: tick,
            },
        );
        value
    }

    pub fn remove(&self, task_id: &str) -> bool {
        self.state.lock().entries.remove(task_id).is_some()
    }

    /// Cached host map of a repo-set task, built from `repo_info` on a miss
    pub fn query_repo_info(&self, task_id: &str, repo_info: &[RepoHostUnit]) -> Arc<TaskMembership> {
        if let Some(hit) = self.get(task_id) {
            return hit;
        }
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.put(task_id, TaskMembership::make_host_info(repo_info))
    }

    /// Cached host/CVE map of a CVE task, built from `cve_info` on a miss
    pub fn query_cve_info(&self, task_id: &str, cve_info: &[CveHostUnit]) -> Arc<TaskMembership> {
        if let Some(hit) = self.get(task_id) {
            return hit;
        }
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.put(task_id, TaskMembership::make_cve_info(cve_info))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for TaskCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CveHostStatus, RepoStatus};

    fn repo_unit(host_id: i64, name: &str) -> RepoHostUnit {
        RepoHostUnit {
            task_id: "t1".into(),
            repo_name: "update-20.03".into(),
            host_id,
            host_name: name.into(),
            host_ip: format!("10.0.0.{host_id}"),
            status: RepoStatus::Unset,
        }
    }

    fn cve_unit(cve: &str, host_id: i64, name: &str) -> CveHostUnit {
        CveHostUnit {
            task_id: "t1".into(),
            cve_id: cve.into(),
            host_id,
            host_name: name.into(),
            host_ip: format!("10.0.0.{host_id}"),
            status: CveHostStatus::Unfixed,
        }
    }

    #[test]
    fn cold_query_matches_direct_transform_and_warm_query_skips_build() {
        let cache = TaskCache::new(4);
        let units = vec![repo_unit(1, "h1"), repo_unit(2, "h2")];

        let cold = cache.query_repo_info("t1", &units);
        assert_eq!(*cold, TaskMembership::make_host_info(&units));
        assert_eq!(cache.stats().builds, 1);

        let warm = cache.query_repo_info("t1", &[]);
        assert_eq!(*warm, *cold);
        assert_eq!(cache.stats().builds, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = TaskCache::new(2);
        cache.put("a", TaskMembership::default());
        cache.put("b", TaskMembership::default());
        assert!(cache.get("a").is_some());
        cache.put("c", TaskMembership::default());

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn reinserting_an_existing_key_does_not_evict() {
        let cache = TaskCache::new(1);
        cache.put("a", TaskMembership::default());
        cache.put("a", TaskMembership::default());
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cve_info_groups_cves_per_host() {
        let units = vec![
            cve_unit("cve-1", 1, "h1"),
            cve_unit("cve-2", 1, "h1"),
            cve_unit("cve-1", 2, "h2"),
        ];
        let info = TaskMembership::make_cve_info(&units);
        assert_eq!(info.cves.len(), 2);
        assert_eq!(info.host("h1").unwrap().cves.len(), 2);
        assert!(info.host("h2").unwrap().cves.contains("cve-1"));
        assert!(info.has_cve("cve-2"));
        assert_eq!(info.sorted_hosts()[0].host_name, "h1");
    }
}

use crate::capability::types::ProviderCapabilities;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_size: 100,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    snapshot: Arc<ProviderCapabilities>,
    stored_at: Instant,
    last_access: AtomicU64,
}

/// TTL- and size-bounded store of the latest capability snapshot per backend.
///
/// Snapshots are shared as `Arc`s and swapped whole, so readers never see a
/// partially written entry. Reads take a shard read lock plus one atomic store.
#[derive(Debug)]
pub struct CapabilityCache {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    clock: AtomicU64,
}

impl CapabilityCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Snapshot for `backend_id` if present and younger than the TTL.
    pub fn get(&self, backend_id: &str) -> Option<Arc<ProviderCapabilities>> {
        {
            let entry = self.entries.get(backend_id)?;
            if self.is_fresh(&entry) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                return Some(Arc::clone(&entry.snapshot));
            }
        }
        self.entries
            .remove_if(backend_id, |_, entry| !self.is_fresh(entry));
        None
    }

    /// Atomically replace the snapshot for its backend.
    pub fn set(&self, snapshot: ProviderCapabilities) -> Arc<ProviderCapabilities> {
        let backend_id = snapshot.backend_id.clone();
        let snapshot = Arc::new(snapshot);
        self.entries.insert(
            backend_id.clone(),
            CacheEntry {
                snapshot: Arc::clone(&snapshot),
                stored_at: Instant::now(),
                last_access: AtomicU64::new(self.tick()),
            },
        );
        self.evict_over_capacity(&backend_id);
        snapshot
    }

    pub fn invalidate(&self, backend_id: &str) -> bool {
        let removed = self.entries.remove(backend_id).is_some();
        if removed {
            debug!(backend = backend_id, "Capability snapshot invalidated");
        }
        removed
    }

    /// All non-expired snapshots, sorted by backend id. Does not count as access.
    pub fn snapshots(&self) -> Vec<Arc<ProviderCapabilities>> {
        let mut fresh: Vec<Arc<ProviderCapabilities>> = self
            .entries
            .iter()
            .filter(|entry| self.is_fresh(entry.value()))
            .map(|entry| Arc::clone(&entry.value().snapshot))
            .collect();
        fresh.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        fresh
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| self.is_fresh(entry));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.stored_at.elapsed() <= self.config.ttl
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn evict_over_capacity(&self, keep: &str) {
        let max_size = self.config.max_size.max(1);
        while self.entries.len() > max_size {
            let victim = self
                .entries
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().last_access.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());
            match victim {
                Some(victim) => {
                    debug!(backend = %victim, "Evicting least recently used capability snapshot");
                    self.entries.remove(&victim);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::types::ProbeReport;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn snapshot(backend_id: &str, confidence: f64) -> ProviderCapabilities {
        ProviderCapabilities {
            backend_id: backend_id.to_string(),
            models: Vec::new(),
            limits: Default::default(),
            certifications: BTreeSet::new(),
            advertised_uptime: None,
            confidence,
            probed_at: Utc::now(),
            report: ProbeReport::default(),
        }
    }

    fn cache(ttl: Duration, max_size: usize) -> CapabilityCache {
        CapabilityCache::new(CacheConfig { ttl, max_size })
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_read_as_absent() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.set(snapshot("a", 0.9));
        assert!(cache.get("a").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("a").is_none());
        assert!(cache.snapshots().is_empty());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_whole_snapshot() {
        let cache = cache(Duration::from_secs(60), 10);
        let first = cache.set(snapshot("a", 0.2));
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.set(snapshot("a", 0.8));

        assert_eq!(first.confidence, 0.2);
        assert_eq!(cache.get("a").unwrap().confidence, 0.8);

        // Replacing restarts the TTL.
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(cache.get("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_least_recently_accessed() {
        let cache = cache(Duration::from_secs(600), 2);
        cache.set(snapshot("a", 0.5));
        cache.set(snapshot("b", 0.5));
        assert!(cache.get("a").is_some());

        cache.set(snapshot("c", 0.5));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_purge() {
        let cache = cache(Duration::from_secs(10), 10);
        cache.set(snapshot("a", 0.5));
        cache.set(snapshot("b", 0.5));
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert!(cache.get("a").is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }
}

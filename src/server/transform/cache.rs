use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Resolved proxy mapping for a source registry host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapping {
    /// Images from this host are pulled through the given proxy name
    /// (e.g., "harbor.example.com/proxy-dockerhub")
    Proxied(String),
    /// The proxy authority confirmed it has no mapping for this host
    Unmapped,
}

/// Mapping cache entry with refresh timestamp
#[derive(Debug, Clone)]
struct CacheEntry {
    mapping: Mapping,
    refreshed_at: Instant,
}

impl CacheEntry {
    fn fresh(mapping: Mapping) -> Self {
        Self {
            mapping,
            refreshed_at: Instant::now(),
        }
    }
}

/// Proxy mapping cache keyed by source registry host
///
/// Entries older than the TTL are reported as missing so the caller
/// re-resolves them; they are never evicted eagerly. The write lock is only
/// taken to apply an already fetched snapshot.
pub struct MappingCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl MappingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a host, returning `None` when it is unknown or stale
    pub async fn get(&self, host: &str) -> Option<Mapping> {
        let entries = self.entries.read().await;
        let entry = entries.get(host)?;
        if entry.refreshed_at.elapsed() > self.ttl {
            tracing::debug!("Proxy mapping for {} is stale", host);
            return None;
        }
        Some(entry.mapping.clone())
    }

    /// Apply a full mapping snapshot from the proxy authority
    ///
    /// Every host in `snapshot` becomes a fresh positive entry. Hosts that were
    /// cached before but are missing from the snapshot become fresh negative
    /// entries.
    pub async fn apply_snapshot(&self, snapshot: &HashMap<String, String>) {
        let mut entries = self.entries.write().await;
        for (host, entry) in entries.iter_mut() {
            if !snapshot.contains_key(host) {
                *entry = CacheEntry::fresh(Mapping::Unmapped);
            }
        }
        entries.extend(snapshot.iter().map(|(host, destination)| {
            (
                host.clone(),
                CacheEntry::fresh(Mapping::Proxied(destination.clone())),
            )
        }));
    }

    /// Record that the proxy authority has no mapping for `host`
    pub async fn mark_unmapped(&self, host: &str) {
        self.entries
            .write()
            .await
            .insert(host.to_string(), CacheEntry::fresh(Mapping::Unmapped));
    }

    /// Number of cached hosts, fresh or stale
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::models::ImageArtifact;

// Cache entry with timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub image: ImageArtifact,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match (now - self.created_at).to_std() {
            Ok(age) => age < ttl,
            // created_at in the future (clock skew) counts as fresh
            Err(_) => true,
        }
    }
}

// Create a cache key: trimmed + case-folded prompt
pub fn make_cache_key(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

/// Prompt-keyed image cache with read-time TTL invalidation.
///
/// There is no background sweep; an expired entry is evicted by the `get`
/// that observes it.
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a prompt. Returns the entry and whether an expired entry was
    /// evicted during the lookup, so the caller knows state changed.
    pub fn lookup(&self, prompt: &str) -> (Option<CacheEntry>, bool) {
        let key = make_cache_key(prompt);
        let now = self.clock.now();

        // clone out before touching the map again, holding a DashMap ref
        // across remove() deadlocks the shard
        let found = self.entries.get(&key).map(|entry| entry.clone());
        match found {
            Some(entry) if entry.is_fresh(now, self.ttl) => (Some(entry), false),
            Some(_) => {
                self.entries
                    .remove_if(&key, |_, entry| !entry.is_fresh(now, self.ttl));
                (None, true)
            }
            None => (None, false),
        }
    }

    pub fn get(&self, prompt: &str) -> Option<CacheEntry> {
        self.lookup(prompt).0
    }

    pub fn put(&self, prompt: &str, image: ImageArtifact) -> CacheEntry {
        let key = make_cache_key(prompt);
        let entry = CacheEntry {
            key: key.clone(),
            image,
            created_at: self.clock.now(),
        };
        self.entries.insert(key, entry.clone());
        entry
    }

    /// Load previously persisted entries, dropping anything already expired.
    /// Returns the number of entries kept.
    pub fn restore(&self, entries: impl IntoIterator<Item = CacheEntry>) -> usize {
        let now = self.clock.now();
        let mut kept = 0;
        for entry in entries {
            if entry.is_fresh(now, self.ttl) {
                self.entries.insert(entry.key.clone(), entry);
                kept += 1;
            }
        }
        kept
    }

    pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        self.entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }
}

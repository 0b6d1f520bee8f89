//! Tag-aware in-process cache for read results, and the revalidation contract
//! writers use to mark tags stale.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    tags::{CacheTag, TagSet},
    types::Method,
};

const DEFAULT_CAPACITY_ENTRIES: usize = 512;

/// Errors reported by a revalidation target.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RevalidateError {
    #[error("revalidation target unavailable: {0}")]
    Unavailable(String),
    #[error("revalidation rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("revalidation transport failure: {0}")]
    Transport(String),
}

/// Something that can mark cache tags stale.
#[async_trait]
pub trait Revalidator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn revalidate(&self, tags: &TagSet) -> Result<(), RevalidateError>;
}

/// Invalidate `tags` on every target, logging and swallowing failures.
///
/// A mutation has already succeeded by the time this runs, so a failed
/// invalidation only means readers may see stale data. Returns the number of
/// targets that failed.
pub async fn revalidate(revalidators: &[Arc<dyn Revalidator>], tags: &TagSet) -> usize {
    if tags.is_empty() {
        return 0;
    }

    let mut failed = 0;
    for revalidator in revalidators {
        match revalidator.revalidate(tags).await {
            Ok(()) => debug!(target_name = revalidator.name(), tags = ?tags.names(), "revalidated cache tags"),
            Err(err) => {
                failed += 1;
                warn!(
                    target_name = revalidator.name(),
                    tags = ?tags.names(),
                    error = %err,
                    "cache revalidation failed; keeping mutation result"
                );
            }
        }
    }
    failed
}

#[derive(Debug, Clone)]
struct CacheEntry {
    body: serde_json::Value,
    tags: TagSet,
    stored_at: Instant,
    max_age: Option<Duration>,
    last_access: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.max_age
            .is_none_or(|max_age| now.saturating_duration_since(self.stored_at) < max_age)
    }
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    epoch: u64,
    /// Epoch of the latest invalidation per tag, bounded by the cache capacity.
    invalidated_at: HashMap<CacheTag, u64>,
    /// Highest epoch whose tag records were pruned. Tagged inserts fetched
    /// before it cannot be checked and are dropped.
    pruned_through: u64,
    /// Epoch of the last [`ResponseCache::clear`]. Nothing fetched before it is stored.
    cleared_at: u64,
}

impl CacheIndex {
    fn is_stale_insert(&self, tags: &TagSet, fetched_at_epoch: u64) -> bool {
        if fetched_at_epoch < self.cleared_at {
            return true;
        }
        if tags.is_empty() {
            return false;
        }
        fetched_at_epoch < self.pruned_through
            || tags.iter().any(|tag| {
                self.invalidated_at
                    .get(tag)
                    .is_some_and(|epoch| *epoch > fetched_at_epoch)
            })
    }

    fn prune_invalidations(&mut self, capacity: usize) {
        while self.invalidated_at.len() > capacity {
            let Some(oldest) = self.invalidated_at.values().copied().min() else {
                break;
            };
            self.invalidated_at.retain(|_, epoch| *epoch > oldest);
            self.pruned_through = self.pruned_through.max(oldest);
        }
    }
}

/// In-process cache of read results keyed by request and indexed by tag.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    index: Arc<RwLock<CacheIndex>>,
    capacity_entries: usize,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_ENTRIES)
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity_entries: usize) -> Self {
        Self {
            index: Arc::new(RwLock::new(CacheIndex::default())),
            capacity_entries: capacity_entries.max(1),
        }
    }

    /// Cache key for a read. The credential is hashed in so user-scoped
    /// results never leak across users.
    pub fn key_for(method: Method, path: &str, credential: Option<&str>) -> String {
        let scope = credential.map(stable_hash).unwrap_or(0);
        format!("{method} {path}#{scope:016x}")
    }

    /// Current invalidation epoch. Take it before fetching and pass it to
    /// [`ResponseCache::insert`].
    pub fn epoch(&self) -> u64 {
        self.index.read().map(|index| index.epoch).unwrap_or(0)
    }

    /// Fresh cached body for `key`, if any.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        let mut index = self.index.write().ok()?;
        let fresh = index.entries.get(key)?.is_fresh(now);
        if !fresh {
            index.entries.remove(key);
            return None;
        }
        let entry = index.entries.get_mut(key)?;
        entry.last_access = now;
        Some(entry.body.clone())
    }

    /// Store a body fetched since `fetched_at_epoch`.
    ///
    /// The insert is dropped when any of `tags` was invalidated after the
    /// fetch started, so a racing write cannot be papered over by an older
    /// read. Returns whether the body was stored.
    pub fn insert(
        &self,
        key: &str,
        body: serde_json::Value,
        tags: TagSet,
        max_age: Option<Duration>,
        fetched_at_epoch: u64,
    ) -> bool {
        let Ok(mut index) = self.index.write() else {
            return false;
        };

        if index.is_stale_insert(&tags, fetched_at_epoch) {
            debug!(%key, "dropping cache insert invalidated during fetch");
            return false;
        }

        let now = Instant::now();
        index.entries.insert(
            key.to_owned(),
            CacheEntry {
                body,
                tags,
                stored_at: now,
                max_age,
                last_access: now,
            },
        );
        evict_if_needed(&mut index, self.capacity_entries, key);
        true
    }

    /// Remove every entry carrying any of `tags`. Returns the number removed.
    pub fn invalidate(&self, tags: &TagSet) -> Result<usize, RevalidateError> {
        let mut index = self
            .index
            .write()
            .map_err(|_| RevalidateError::Unavailable("poisoned lock".to_owned()))?;

        index.epoch = index.epoch.saturating_add(1);
        let epoch = index.epoch;
        for tag in tags {
            index.invalidated_at.insert(tag.clone(), epoch);
        }
        index.prune_invalidations(self.capacity_entries);

        let before = index.entries.len();
        index.entries.retain(|_, entry| !entry.tags.intersects(tags));
        Ok(before - index.entries.len())
    }

    /// Drop every entry, and every insert whose fetch started before now.
    pub fn clear(&self) -> Result<usize, RevalidateError> {
        let mut index = self
            .index
            .write()
            .map_err(|_| RevalidateError::Unavailable("poisoned lock".to_owned()))?;

        index.epoch = index.epoch.saturating_add(1);
        index.cleared_at = index.epoch;
        index.invalidated_at.clear();
        let removed = index.entries.len();
        index.entries.clear();
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|index| index.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Revalidator for ResponseCache {
    fn name(&self) -> &str {
        "response-cache"
    }

    async fn revalidate(&self, tags: &TagSet) -> Result<(), RevalidateError> {
        let removed = self.invalidate(tags)?;
        debug!(removed, "invalidated cached responses");
        Ok(())
    }
}

fn evict_if_needed(index: &mut CacheIndex, capacity_entries: usize, protected_key: &str) {
    while index.entries.len() > capacity_entries {
        let Some(evict_key) = index
            .entries
            .iter()
            .filter(|(key, _)| key.as_str() != protected_key)
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone())
        else {
            break;
        };
        index.entries.remove(&evict_key);
    }
}

fn stable_hash(value: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

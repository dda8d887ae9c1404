//! Cache backend trait.

use super::value::CachedValue;
use crate::error::Result;
use serde_json::Value;

/// Topic-isolated store of decoded server values.
///
/// Entries are addressed by `(topic, index)` where the index is any JSON
/// value, canonicalized by [`CacheKey`](super::CacheKey). All operations are
/// synchronous and never touch the network.
pub trait CacheBackend: Send + Sync {
    /// Get a value, `None` when absent.
    fn get(&self, topic: &str, index: &Value) -> Option<CachedValue>;

    /// Store a value and return the entry now held by the cache.
    ///
    /// An existing mergeable entry absorbs the new content in place and is
    /// returned, so references handed out earlier stay live. Any other
    /// existing entry is replaced.
    fn set(&self, topic: &str, index: &Value, value: CachedValue) -> CachedValue;

    /// Merge a diff into a mergeable entry.
    ///
    /// Returns `Ok(None)` without mutating anything when the entry is absent,
    /// and a `CacheType` error when the entry cannot be merged.
    fn apply_diff(&self, topic: &str, index: &Value, diff: &Value) -> Result<Option<CachedValue>>;

    /// Remove an entry. Returns whether something was removed.
    fn delete(&self, topic: &str, index: &Value) -> bool;

    /// Number of entries across all topics.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    fn clear(&self);
}

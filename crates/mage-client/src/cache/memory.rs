//! Process-lifetime in-memory cache.

use super::key::CacheKey;
use super::traits::CacheBackend;
use super::value::CachedValue;
use crate::error::{MageError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

type TopicMap = HashMap<CacheKey, CachedValue>;

/// In-memory [`CacheBackend`], rebuilt from server responses on every run.
#[derive(Debug, Default)]
pub struct MemoryCache {
    topics: Mutex<HashMap<String, TopicMap>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics that currently hold at least one entry.
    pub fn topics(&self) -> Vec<String> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = topics
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, topic: &str, index: &Value) -> Option<CachedValue> {
        let key = CacheKey::from_index(index);
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.get(topic)?.get(&key).cloned()
    }

    fn set(&self, topic: &str, index: &Value, value: CachedValue) -> CachedValue {
        let key = CacheKey::from_index(index);
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = topics.entry(topic.to_string()).or_default();

        let existing = match entries.get(&key) {
            Some(CachedValue::Mergeable(existing)) => Some(existing.clone()),
            _ => None,
        };

        if let Some(existing) = existing {
            drop(topics);
            // Observers run outside the cache lock.
            existing.assign(value.to_json());
            debug!("Cache assign {} {}", topic, key);
            return CachedValue::Mergeable(existing);
        }

        debug!("Cache store {} {}", topic, key);
        entries.insert(key, value.clone());
        value
    }

    fn apply_diff(&self, topic: &str, index: &Value, diff: &Value) -> Result<Option<CachedValue>> {
        let key = CacheKey::from_index(index);
        let entry = {
            let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            match topics.get(topic).and_then(|entries| entries.get(&key)) {
                Some(entry) => entry.clone(),
                None => {
                    debug!("Ignoring diff for uncached value {} {}", topic, key);
                    return Ok(None);
                }
            }
        };

        match entry {
            CachedValue::Mergeable(value) => {
                value.apply_patch(diff);
                Ok(Some(CachedValue::Mergeable(value)))
            }
            _ => Err(MageError::CacheType {
                topic: topic.to_string(),
                index: key.to_string(),
            }),
        }
    }

    fn delete(&self, topic: &str, index: &Value) -> bool {
        let key = CacheKey::from_index(index);
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .get_mut(topic)
            .map(|entries| entries.remove(&key).is_some())
            .unwrap_or(false)
    }

    fn len(&self) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.values().map(|entries| entries.len()).sum()
    }

    fn clear(&self) {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

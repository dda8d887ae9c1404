//! Read-through access to server-side data.
//!
//! Reads are answered from the cache when possible and otherwise fetched
//! with the `archivist.raw*` commands; fetched values are decoded and cached.
//! Local modifications are never pushed back to the server.

use crate::cache::{CacheBackend, CachedValue};
use crate::command_center::{protocol::is_truthy, CommandCenter};
use crate::error::{MageError, Result};
use crate::events::ListenerId;
use crate::media;
use crate::router::CacheNotification;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const CMD_RAW_GET: &str = "archivist.rawGet";
pub const CMD_RAW_EXISTS: &str = "archivist.rawExists";
pub const CMD_RAW_MGET: &str = "archivist.rawMGet";
pub const CMD_RAW_LIST: &str = "archivist.rawList";

/// One `(topic, index)` lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivistQuery {
    pub topic: String,
    #[serde(default)]
    pub index: Value,
}

impl ArchivistQuery {
    pub fn new(topic: impl Into<String>, index: Value) -> Self {
        Self {
            topic: topic.into(),
            index,
        }
    }
}

/// Cache-backed reader. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Archivist {
    commands: CommandCenter,
}

impl Archivist {
    pub fn new(commands: CommandCenter) -> Self {
        Self { commands }
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        self.commands.router().cache()
    }

    /// Fetch one value. `Ok(None)` when the server has nothing.
    pub async fn get(
        &self,
        topic: &str,
        index: &Value,
        options: Option<Value>,
    ) -> Result<Option<CachedValue>> {
        if let Some(cached) = self.cache().get(topic, index) {
            return Ok(Some(cached));
        }

        let data = self
            .commands
            .send(CMD_RAW_GET, (topic, index, options_or_default(options)))
            .await?;
        if !is_truthy(&data) {
            return Ok(None);
        }

        let decoded = media::decode(&data)?;
        Ok(Some(self.cache().set(topic, index, decoded)))
    }

    pub async fn exists(&self, topic: &str, index: &Value, options: Option<Value>) -> Result<bool> {
        if self.cache().get(topic, index).is_some() {
            return Ok(true);
        }

        let found = self
            .commands
            .send(CMD_RAW_EXISTS, (topic, index, options_or_default(options)))
            .await?;
        Ok(is_truthy(&found))
    }

    /// Fetch several values; results are in query order.
    ///
    /// Cache hits are answered locally and the misses go out in a single
    /// `rawMGet`.
    pub async fn mget(
        &self,
        queries: &[ArchivistQuery],
        options: Option<Value>,
    ) -> Result<Vec<Option<CachedValue>>> {
        let mut results: Vec<Option<CachedValue>> = queries
            .iter()
            .map(|q| self.cache().get(&q.topic, &q.index))
            .collect();

        let misses: Vec<usize> = (0..queries.len()).filter(|&i| results[i].is_none()).collect();
        if misses.is_empty() {
            return Ok(results);
        }

        let server_queries: Vec<&ArchivistQuery> = misses.iter().map(|&i| &queries[i]).collect();
        debug!(
            "mget: {} cached, {} fetched",
            queries.len() - misses.len(),
            misses.len()
        );

        let data = self
            .commands
            .send(CMD_RAW_MGET, (server_queries, options_or_default(options)))
            .await?;

        let items = match data {
            Value::Null => return Ok(results),
            Value::Array(items) => items,
            other => {
                return Err(MageError::Protocol {
                    message: format!("{} must return an array, got {}", CMD_RAW_MGET, other),
                })
            }
        };

        for (slot, item) in misses.into_iter().zip(items.iter()) {
            let key = item
                .get("key")
                .map(|key| ArchivistQuery::deserialize(key))
                .transpose()?
                .ok_or_else(|| MageError::Protocol {
                    message: format!("{} result without key: {}", CMD_RAW_MGET, item),
                })?;
            let decoded = media::decode(item)?;
            results[slot] = Some(self.cache().set(&key.topic, &key.index, decoded));
        }

        Ok(results)
    }

    /// List indexes on a topic matching a partial index. Not cached.
    pub async fn list(
        &self,
        topic: &str,
        partial_index: &Value,
        options: Option<Value>,
    ) -> Result<Value> {
        self.commands
            .send(CMD_RAW_LIST, (topic, partial_index, options_or_default(options)))
            .await
    }

    /// Subscribe to cache mutations on a topic.
    pub fn on_topic<F>(&self, topic: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&CacheNotification) + Send + Sync + 'static,
    {
        self.commands.router().on_topic(topic, listener)
    }

    pub fn off_topic(&self, id: ListenerId) -> bool {
        self.commands.router().off_topic(id)
    }
}

fn options_or_default(options: Option<Value>) -> Value {
    options.unwrap_or_else(|| json!({}))
}

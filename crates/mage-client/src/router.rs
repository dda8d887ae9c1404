//! Routing of server events into the cache and out to subscribers.
//!
//! Events reach the client two ways: embedded in a batch response next to
//! the command that caused them, or delivered by the message stream. Both
//! paths call [`EventRouter::route`]. Cache events mutate the cache and
//! notify the topic's subscribers; every event is then re-emitted by name
//! with its raw payload.
//!
//! Servers name cache events either `archivist:<op>` or `item.<op>`. Both
//! spellings are applied the same way.

use crate::cache::{CacheBackend, CachedValue};
use crate::error::{MageError, Result};
use crate::events::{EventBus, ListenerId};
use crate::media::MediaValue;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub const EVENT_ARCHIVIST_SET: &str = "archivist:set";
pub const EVENT_ARCHIVIST_DEL: &str = "archivist:del";
pub const EVENT_ARCHIVIST_APPLY_DIFF: &str = "archivist:applyDiff";
pub const EVENT_ITEM_SET: &str = "item.set";
pub const EVENT_ITEM_DEL: &str = "item.del";
pub const EVENT_ITEM_APPLY_DIFF: &str = "item.applyDiff";

/// One `[eventName, eventData]` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub event_name: String,
    pub event_data: Value,
}

impl PushMessage {
    pub fn new(event_name: impl Into<String>, event_data: Value) -> Self {
        Self {
            event_name: event_name.into(),
            event_data,
        }
    }

    /// Parse a `[eventName, eventData]` pair. A missing payload is `null`.
    pub fn from_pair(pair: &Value) -> Result<Self> {
        let items = pair.as_array().ok_or_else(|| MageError::Protocol {
            message: format!("event must be an [name, data] pair, got {}", pair),
        })?;

        let event_name = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| MageError::Protocol {
                message: format!("event name must be a string, got {}", pair),
            })?;

        Ok(Self::new(
            event_name,
            items.get(1).cloned().unwrap_or(Value::Null),
        ))
    }

    /// Parse an array of pairs. `null` is an empty list.
    pub fn parse_list(list: &Value) -> Result<Vec<Self>> {
        match list {
            Value::Null => Ok(Vec::new()),
            Value::Array(pairs) => pairs.iter().map(Self::from_pair).collect(),
            other => Err(MageError::Protocol {
                message: format!("events must be an array, got {}", other),
            }),
        }
    }
}

/// Kind of cache mutation reported to topic subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOperation {
    Set,
    Del,
    ApplyDiff,
}

impl CacheOperation {
    /// Cache operation an event name stands for, if any.
    pub fn from_event(name: &str) -> Option<Self> {
        match name {
            EVENT_ARCHIVIST_SET | EVENT_ITEM_SET => Some(CacheOperation::Set),
            EVENT_ARCHIVIST_DEL | EVENT_ITEM_DEL => Some(CacheOperation::Del),
            EVENT_ARCHIVIST_APPLY_DIFF | EVENT_ITEM_APPLY_DIFF => Some(CacheOperation::ApplyDiff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOperation::Set => "set",
            CacheOperation::Del => "del",
            CacheOperation::ApplyDiff => "applyDiff",
        }
    }
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification published on a cache topic.
#[derive(Debug, Clone)]
pub struct CacheNotification {
    pub topic: String,
    pub operation: CacheOperation,
    pub index: Value,
    /// Entry after the mutation. `None` for deletes and for diffs against
    /// values that were not cached.
    pub value: Option<CachedValue>,
}

#[derive(Debug, Deserialize)]
struct ItemKey {
    topic: String,
    #[serde(default)]
    index: Value,
}

#[derive(Debug, Deserialize)]
struct SetItem {
    key: ItemKey,
    value: MediaValue,
}

#[derive(Debug, Deserialize)]
struct DelItem {
    key: ItemKey,
}

#[derive(Debug, Deserialize)]
struct DiffItem {
    key: ItemKey,
    #[serde(default)]
    diff: Value,
}

/// Applies server events to the cache and fans them out to listeners.
pub struct EventRouter {
    cache: Arc<dyn CacheBackend>,
    events: EventBus<Value>,
    topics: EventBus<CacheNotification>,
}

impl EventRouter {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            cache,
            events: EventBus::new(),
            topics: EventBus::new(),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    /// Route one event.
    ///
    /// Cache-mutating events that cannot be applied fail with a desync-class
    /// error (`Desync` or `CacheType`) and are not re-emitted.
    pub fn route(&self, name: &str, data: &Value) -> Result<()> {
        match CacheOperation::from_event(name) {
            Some(CacheOperation::Set) => self.route_set(name, data)?,
            Some(CacheOperation::Del) => self.route_del(name, data)?,
            Some(CacheOperation::ApplyDiff) => self.route_apply_diff(name, data)?,
            None => {}
        }

        let listeners = self.events.emit(name, data);
        debug!("Routed event {} to {} listeners", name, listeners);
        Ok(())
    }

    /// Route messages in order, stopping at the first failure.
    pub fn route_all(&self, messages: &[PushMessage]) -> Result<()> {
        for message in messages {
            self.route(&message.event_name, &message.event_data)?;
        }
        Ok(())
    }

    /// Subscribe to a server event by name.
    pub fn on_event<F>(&self, name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.events.on(name, listener)
    }

    pub fn off_event(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Subscribe to cache mutations on a topic.
    pub fn on_topic<F>(&self, topic: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&CacheNotification) + Send + Sync + 'static,
    {
        self.topics.on(topic, listener)
    }

    pub fn off_topic(&self, id: ListenerId) -> bool {
        self.topics.off(id)
    }

    fn route_set(&self, event: &str, data: &Value) -> Result<()> {
        let item: SetItem = parse_item(event, data)?;
        let decoded = item.value.decode().map_err(|e| MageError::Desync {
            message: format!(
                "cannot decode value for {} {}: {}",
                item.key.topic, item.key.index, e
            ),
        })?;

        let merged = self.cache.set(&item.key.topic, &item.key.index, decoded);
        self.notify(item.key, CacheOperation::Set, Some(merged));
        Ok(())
    }

    fn route_del(&self, event: &str, data: &Value) -> Result<()> {
        let item: DelItem = parse_item(event, data)?;
        self.cache.delete(&item.key.topic, &item.key.index);
        self.notify(item.key, CacheOperation::Del, None);
        Ok(())
    }

    fn route_apply_diff(&self, event: &str, data: &Value) -> Result<()> {
        let item: DiffItem = parse_item(event, data)?;
        let merged = self
            .cache
            .apply_diff(&item.key.topic, &item.key.index, &item.diff)
            .inspect_err(|e| warn!("Failed to apply diff: {}", e))?;
        self.notify(item.key, CacheOperation::ApplyDiff, merged);
        Ok(())
    }

    fn notify(&self, key: ItemKey, operation: CacheOperation, value: Option<CachedValue>) {
        let notification = CacheNotification {
            topic: key.topic,
            operation,
            index: key.index,
            value,
        };
        self.topics.emit(&notification.topic, &notification);
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("cached_entries", &self.cache.len())
            .field("events", &self.events)
            .field("topics", &self.topics)
            .finish()
    }
}

fn parse_item<T: DeserializeOwned>(event: &str, data: &Value) -> Result<T> {
    T::deserialize(data).map_err(|e| MageError::Desync {
        message: format!("malformed {} payload: {}", event, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;
    use std::sync::Mutex;

    fn router() -> EventRouter {
        EventRouter::new(Arc::new(MemoryCache::new()))
    }

    #[test]
    fn test_push_message_parsing() {
        let msg = PushMessage::from_pair(&json!(["chat.message", { "text": "hi" }])).unwrap();
        assert_eq!(msg.event_name, "chat.message");
        assert_eq!(msg.event_data, json!({ "text": "hi" }));

        let bare = PushMessage::from_pair(&json!(["ping"])).unwrap();
        assert_eq!(bare.event_data, Value::Null);

        assert!(PushMessage::from_pair(&json!({ "name": "x" })).is_err());
        assert!(PushMessage::from_pair(&json!([3, 4])).is_err());
        assert!(PushMessage::parse_list(&Value::Null).unwrap().is_empty());
        assert!(PushMessage::parse_list(&json!("x")).is_err());
    }

    #[test]
    fn test_set_updates_cache_and_notifies_topic() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        router.on_topic("t", move |n: &CacheNotification| {
            seen_clone.lock().unwrap().push((
                n.operation,
                n.index.clone(),
                n.value.as_ref().map(|v| v.to_json()),
            ));
        });

        router
            .route(
                EVENT_ARCHIVIST_SET,
                &json!({
                    "key": { "topic": "t", "index": "5" },
                    "value": { "mediaType": "application/json", "data": "{\"a\":1}" }
                }),
            )
            .unwrap();

        let cached = router.cache().get("t", &json!("5")).unwrap();
        assert_eq!(cached.to_json(), json!({ "a": 1 }));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(CacheOperation::Set, json!("5"), Some(json!({ "a": 1 })))]
        );
    }

    #[test]
    fn test_item_events_update_cache() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        router.on_topic("t", move |n: &CacheNotification| {
            seen_clone.lock().unwrap().push(n.operation);
        });

        let delivery = json!([[[
            "item.set",
            {
                "key": { "topic": "t", "index": "5" },
                "value": { "mediaType": "application/json", "data": "{\"a\":1}" }
            }
        ]]]);
        let messages = PushMessage::parse_list(&delivery[0]).unwrap();
        router.route_all(&messages).unwrap();

        let cached = router.cache().get("t", &json!("5")).unwrap();
        assert_eq!(cached.to_json(), json!({ "a": 1 }));
        assert_eq!(*seen.lock().unwrap(), vec![CacheOperation::Set]);

        router
            .route(EVENT_ITEM_DEL, &json!({ "key": { "topic": "t", "index": "5" } }))
            .unwrap();
        assert!(router.cache().get("t", &json!("5")).is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CacheOperation::Set, CacheOperation::Del]
        );
    }

    #[test]
    fn test_cache_event_names() {
        assert_eq!(CacheOperation::from_event("item.set"), Some(CacheOperation::Set));
        assert_eq!(CacheOperation::from_event("archivist:del"), Some(CacheOperation::Del));
        assert_eq!(
            CacheOperation::from_event("item.applyDiff"),
            Some(CacheOperation::ApplyDiff)
        );
        assert_eq!(CacheOperation::from_event("item.get"), None);
        assert_eq!(CacheOperation::from_event("chat.message"), None);
    }

    #[test]
    fn test_del_removes_and_notifies() {
        let router = router();
        router
            .cache()
            .set("t", &json!(1), CachedValue::Json(json!(true)));

        let ops = Arc::new(Mutex::new(Vec::new()));
        let ops_clone = ops.clone();
        router.on_topic("t", move |n| ops_clone.lock().unwrap().push(n.operation));

        router
            .route(EVENT_ARCHIVIST_DEL, &json!({ "key": { "topic": "t", "index": 1 } }))
            .unwrap();

        assert!(router.cache().get("t", &json!(1)).is_none());
        assert_eq!(*ops.lock().unwrap(), vec![CacheOperation::Del]);
    }

    #[test]
    fn test_apply_diff_merges() {
        let router = router();
        let stored = router
            .cache()
            .set("inv", &json!(1), CachedValue::mergeable(json!({ "gold": 1 })));

        router
            .route(
                EVENT_ARCHIVIST_APPLY_DIFF,
                &json!({ "key": { "topic": "inv", "index": 1 }, "diff": { "gold": 4 } }),
            )
            .unwrap();

        assert_eq!(stored.to_json(), json!({ "gold": 4 }));
    }

    #[test]
    fn test_apply_diff_failure_does_not_notify() {
        let router = router();
        router
            .cache()
            .set("cfg", &json!(1), CachedValue::Json(json!({ "a": 1 })));

        let topic_calls = Arc::new(Mutex::new(0));
        let tc = topic_calls.clone();
        router.on_topic("cfg", move |_| *tc.lock().unwrap() += 1);
        let event_calls = Arc::new(Mutex::new(0));
        let ec = event_calls.clone();
        router.on_event(EVENT_ARCHIVIST_APPLY_DIFF, move |_| *ec.lock().unwrap() += 1);

        let err = router
            .route(
                EVENT_ARCHIVIST_APPLY_DIFF,
                &json!({ "key": { "topic": "cfg", "index": 1 }, "diff": { "a": 2 } }),
            )
            .unwrap_err();

        assert!(matches!(err, MageError::CacheType { .. }));
        assert!(err.is_desync());
        assert_eq!(*topic_calls.lock().unwrap(), 0);
        assert_eq!(*event_calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_malformed_cache_event_is_desync() {
        let router = router();
        let err = router
            .route(EVENT_ARCHIVIST_SET, &json!({ "nope": true }))
            .unwrap_err();
        assert!(matches!(err, MageError::Desync { .. }));
    }

    #[test]
    fn test_plain_events_are_reemitted() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        router.on_event("chat.message", move |data| seen_clone.lock().unwrap().push(data.clone()));

        router
            .route_all(&[
                PushMessage::new("chat.message", json!("hello")),
                PushMessage::new("unrelated", json!(1)),
                PushMessage::new("chat.message", json!("bye")),
            ])
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!("hello"), json!("bye")]);
        assert!(router.cache().is_empty());
    }
}

//! Values stored in the cache.
//!
//! A [`MergeableValue`] is a shared JSON document that is updated in place, so
//! every holder of the `Arc` sees server-side diffs as they arrive. Everything
//! else is opaque and can only be replaced.

use bytes::Bytes;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Callback invoked with the new content after every mutation.
pub type Observer = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`MergeableValue::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// JSON document with identity-preserving in-place updates.
pub struct MergeableValue {
    content: RwLock<Value>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
}

impl MergeableValue {
    pub fn new(content: Value) -> Self {
        Self {
            content: RwLock::new(content),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    /// Wrap a document in a shared handle.
    pub fn shared(content: Value) -> Arc<Self> {
        Arc::new(Self::new(content))
    }

    /// Copy of the current content.
    pub fn snapshot(&self) -> Value {
        self.content
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a JSON merge patch (RFC 7386) in place.
    ///
    /// Objects merge recursively, a `null` member removes the key, and any
    /// other patch value replaces the target.
    pub fn apply_patch(&self, patch: &Value) {
        let updated = {
            let mut content = self.content.write().unwrap_or_else(PoisonError::into_inner);
            merge_patch(&mut content, patch);
            content.clone()
        };
        self.notify(&updated);
    }

    /// Replace the content in place, keeping this value's identity.
    pub fn assign(&self, content: Value) {
        {
            let mut current = self.content.write().unwrap_or_else(PoisonError::into_inner);
            *current = content.clone();
        }
        self.notify(&content);
    }

    /// Register an observer for future mutations.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    fn notify(&self, content: &Value) {
        // Clone the list so observers may (un)register without deadlocking.
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            observer(content);
        }
    }
}

impl fmt::Debug for MergeableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeableValue")
            .field("content", &self.snapshot())
            .finish_non_exhaustive()
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// A decoded value held by the cache.
#[derive(Debug, Clone)]
pub enum CachedValue {
    /// Shared document, updated in place by diffs.
    Mergeable(Arc<MergeableValue>),
    /// Parsed JSON, replace-only.
    Json(Value),
    /// Plain text, replace-only.
    Text(String),
    /// Raw bytes, replace-only.
    Binary(Bytes),
}

impl CachedValue {
    pub fn mergeable(content: Value) -> Self {
        CachedValue::Mergeable(MergeableValue::shared(content))
    }

    pub fn is_mergeable(&self) -> bool {
        matches!(self, CachedValue::Mergeable(_))
    }

    pub fn as_mergeable(&self) -> Option<&Arc<MergeableValue>> {
        match self {
            CachedValue::Mergeable(value) => Some(value),
            _ => None,
        }
    }

    /// Identity for mergeable values, equality for opaque ones.
    pub fn same_entry(&self, other: &CachedValue) -> bool {
        match (self, other) {
            (CachedValue::Mergeable(a), CachedValue::Mergeable(b)) => Arc::ptr_eq(a, b),
            (CachedValue::Json(a), CachedValue::Json(b)) => a == b,
            (CachedValue::Text(a), CachedValue::Text(b)) => a == b,
            (CachedValue::Binary(a), CachedValue::Binary(b)) => a == b,
            _ => false,
        }
    }

    /// JSON view of the value. Binary content is hex encoded.
    pub fn to_json(&self) -> Value {
        match self {
            CachedValue::Mergeable(value) => value.snapshot(),
            CachedValue::Json(value) => value.clone(),
            CachedValue::Text(text) => Value::String(text.clone()),
            CachedValue::Binary(bytes) => Value::String(hex::encode(bytes)),
        }
    }
}

//! Session state.
//!
//! The server announces a session with a `session.set` event (usually
//! attached to a login command). From then on the key rides along in the
//! header of every batch and in every message stream poll.

use crate::command_center::CommandCenter;
use crate::events::ListenerId;
use crate::msgstream::PollingClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

pub const EVENT_SESSION_SET: &str = "session.set";
pub const EVENT_SESSION_UNSET: &str = "session.unset";

/// Name of the batch header hook carrying the session key.
pub const SESSION_HOOK: &str = "mage.session";

/// Payload of `session.set`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

/// Shared session handle. Clones see the same session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    info: Arc<RwLock<SessionInfo>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(&self) -> Option<String> {
        self.read().key.clone()
    }

    pub fn actor_id(&self) -> Option<String> {
        self.read().actor_id.clone()
    }

    pub fn info(&self) -> SessionInfo {
        self.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().key.is_some()
    }

    pub fn set(&self, info: SessionInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    pub fn clear(&self) {
        self.set(SessionInfo::default());
    }

    /// Header fragment for the `mage.session` hook: `{"key": ...}` once a
    /// session exists.
    pub fn header(&self) -> Option<Map<String, Value>> {
        let key = self.key()?;
        let mut fragment = Map::new();
        fragment.insert("key".to_string(), Value::String(key));
        Some(fragment)
    }

    /// Install the header hook and the `session.set` / `session.unset`
    /// listeners. A new session is handed to the stream, which is started,
    /// or restarted when the key changed.
    pub(crate) fn attach(
        &self,
        commands: &CommandCenter,
        stream: &PollingClient,
    ) -> (ListenerId, ListenerId) {
        let session = self.clone();
        commands.register_hook(SESSION_HOOK, move |_| session.header());

        let router = commands.router();

        let session = self.clone();
        let stream = stream.downgrade();
        let on_set = router.on_event(EVENT_SESSION_SET, move |data| {
            let info = match SessionInfo::deserialize(data) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Ignoring malformed {} payload: {}", EVENT_SESSION_SET, e);
                    return;
                }
            };

            info!("Session established for actor {:?}", info.actor_id);
            session.set(info.clone());
            if let Some(stream) = stream.upgrade() {
                // A poll in flight still carries the old key.
                let changed = stream.session_key() != info.key;
                stream.set_session_key(info.key);
                stream.start(changed);
            }
        });

        let session = self.clone();
        let on_unset = router.on_event(EVENT_SESSION_UNSET, move |_| {
            info!("Session ended");
            session.clear();
        });

        (on_set, on_unset)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionInfo> {
        self.info.read().unwrap_or_else(PoisonError::into_inner)
    }
}

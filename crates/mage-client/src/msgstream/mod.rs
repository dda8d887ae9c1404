//! Server push message stream.
//!
//! The server queues events per session; the client polls for them and
//! confirms each delivered batch on its next poll. Two polling styles share
//! one implementation ([`PollingClient`]) and differ only in their transport
//! tag and default pause after a successful poll.

mod polling;

pub use polling::{PollingClient, PollingSettings};

use crate::config::{MsgStreamConfig, StreamConfig};
use crate::error::{MageError, Result};
use crate::router::{EventRouter, PushMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Polling style, also sent to the server as the `transport` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStyle {
    /// Server holds the request open; re-poll immediately.
    LongPolling,
    /// Server answers at once; re-poll on a fixed interval.
    ShortPolling,
}

impl TransportStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportStyle::LongPolling => "longpolling",
            TransportStyle::ShortPolling => "shortpolling",
        }
    }

    /// Pause after a successful (or timed out) poll.
    pub fn default_after_request_interval(&self) -> Duration {
        match self {
            TransportStyle::LongPolling => StreamConfig::LONGPOLLING_AFTER_REQUEST_INTERVAL,
            TransportStyle::ShortPolling => StreamConfig::SHORTPOLLING_AFTER_REQUEST_INTERVAL,
        }
    }
}

impl fmt::Display for TransportStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One group of pushed events, confirmed as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryBatch {
    /// Correlation id echoed back in `confirmIds`.
    pub id: String,
    pub messages: Vec<PushMessage>,
}

/// Signals published by the message stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Batches received by one poll, already routed and queued for confirmation.
    Delivery(Vec<DeliveryBatch>),
    /// A poll failed; the raw response body is attached when there was one.
    Error {
        error: MageError,
        data: Option<String>,
    },
    /// A pushed event could not be applied to the cache.
    Desync(MageError),
}

/// Parse a poll response body.
///
/// An array yields positional ids (`"0"`, `"1"`, ...); an object keyed by
/// message id yields those ids. An empty body or `null` means nothing was
/// delivered.
pub fn parse_delivery(body: &str) -> Result<Option<Vec<DeliveryBatch>>> {
    if body.trim().is_empty() {
        return Ok(None);
    }

    let batches = match serde_json::from_str::<Value>(body)? {
        Value::Null => return Ok(None),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                Ok(DeliveryBatch {
                    id: idx.to_string(),
                    messages: PushMessage::parse_list(item)?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        Value::Object(map) => map
            .iter()
            .map(|(id, item)| {
                Ok(DeliveryBatch {
                    id: id.clone(),
                    messages: PushMessage::parse_list(item)?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(MageError::Protocol {
                message: format!("unexpected message stream payload: {}", other),
            })
        }
    };

    Ok(Some(batches))
}

/// Transport factory.
pub struct MessageStream;

impl MessageStream {
    /// Build the first transport of the preference list that is configured.
    pub fn factory(
        config: &MsgStreamConfig,
        http: reqwest::Client,
        router: Arc<EventRouter>,
    ) -> Result<PollingClient> {
        for style in config.detect() {
            if let Some(transport) = config.transports.get(style) {
                let settings = PollingSettings::from_config(style, transport);
                return PollingClient::new(style, settings, http, router);
            }
        }

        Err(MageError::Config {
            message: "No valid configuration found for message stream".to_string(),
        })
    }
}

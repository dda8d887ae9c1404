//! MAGE Client - batching RPC, server push and a local cache for MAGE backends.
//!
//! Commands sent in the same scheduling tick travel to the server as one
//! HTTP batch. Events the server attaches to command responses, or pushes
//! through the long/short polling message stream, are applied to a local
//! cache and re-emitted to subscribers.
//!
//! Batching of a synchronous burst of calls into exactly one request holds
//! on a current-thread runtime. On a multi-thread runtime a burst may be
//! split across consecutive batches (see [`command_center`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use mage_client::{ClientConfig, MageClient};
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> mage_client::Result<()> {
//!     let text = std::fs::read_to_string("mage.json").expect("config file");
//!     let config = ClientConfig::from_json(&text)?;
//!     let client = MageClient::new(config)?;
//!
//!     client.on("chat.message", |data| println!("chat: {}", data));
//!
//!     // Both calls go out in one batch; login also starts the stream.
//!     let login = client.call("player", "login", json!(["alice", "pw"]));
//!     let shop = client.call("shop", "list", json!([]));
//!     println!("{} {}", login.await?, shop.await?);
//!
//!     Ok(())
//! }
//! ```

pub mod archivist;
pub mod cache;
pub mod command_center;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod msgstream;
pub mod router;
pub mod session;

mod client;

// Re-export commonly used types
pub use archivist::{Archivist, ArchivistQuery};
pub use cache::{CacheBackend, CacheKey, CachedValue, MemoryCache, MergeableValue};
pub use client::{MageClient, MageClientBuilder};
pub use command_center::{
    CommandCenter, CommandCenterEvent, CommandCenterSettings, PendingCommand,
};
pub use config::{ClientConfig, NetworkConfig, StreamConfig};
pub use error::{MageError, Result};
pub use events::{EventBus, ListenerId};
pub use msgstream::{
    DeliveryBatch, MessageStream, PollingClient, PollingSettings, StreamEvent, TransportStyle,
};
pub use router::{CacheNotification, CacheOperation, EventRouter, PushMessage};
pub use session::{Session, SessionInfo};

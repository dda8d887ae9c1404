//! The MAGE client facade.
//!
//! Wires one cache, router, command center, message stream, session and
//! archivist together from a [`ClientConfig`]. The command center and the
//! stream share one HTTP client and therefore one cookie jar.

use crate::archivist::Archivist;
use crate::cache::{CacheBackend, MemoryCache};
use crate::command_center::{CommandCenter, CommandCenterSettings, PendingCommand};
use crate::config::{ClientConfig, NetworkConfig};
use crate::error::{MageError, Result};
use crate::events::ListenerId;
use crate::msgstream::{MessageStream, PollingClient};
use crate::router::EventRouter;
use crate::session::Session;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Builder for [`MageClient`].
pub struct MageClientBuilder {
    config: ClientConfig,
    http: Option<reqwest::Client>,
    cache: Option<Arc<dyn CacheBackend>>,
}

impl MageClientBuilder {
    /// Use a preconfigured HTTP client instead of the default one.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Use a custom cache backend instead of an in-memory one.
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the client. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<MageClient> {
        self.config.validate()?;

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .user_agent(NetworkConfig::USER_AGENT)
                .cookie_store(true)
                .build()
                .map_err(|e| MageError::Config {
                    message: format!("failed to build HTTP client: {}", e),
                })?,
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let router = Arc::new(EventRouter::new(cache));

        let stream =
            MessageStream::factory(&self.config.server.msg_stream, http.clone(), router.clone())?;
        let commands = CommandCenter::new(
            http,
            CommandCenterSettings::from(&self.config.server.command_center),
            router.clone(),
        )?;

        let session = Session::new();
        session.attach(&commands, &stream);
        let archivist = Archivist::new(commands.clone());

        info!(
            "MAGE client ready: commands at {}, {} stream",
            self.config.server.command_center.url,
            stream.style()
        );

        Ok(MageClient {
            config: self.config,
            router,
            commands,
            stream,
            session,
            archivist,
        })
    }
}

/// Connection to a MAGE server.
///
/// Dropping the client stops the message stream.
pub struct MageClient {
    config: ClientConfig,
    router: Arc<EventRouter>,
    commands: CommandCenter,
    stream: PollingClient,
    session: Session,
    archivist: Archivist,
}

impl MageClient {
    pub fn builder(config: ClientConfig) -> MageClientBuilder {
        MageClientBuilder {
            config,
            http: None,
            cache: None,
        }
    }

    /// Build a client with default HTTP client and cache.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Call `module.command` from the configured command table.
    ///
    /// Commands missing from the table fail with
    /// [`MageError::UnknownCommand`] without touching the network.
    pub fn call<P: Serialize>(&self, module: &str, command: &str, params: P) -> PendingCommand {
        let name = format!("{}.{}", module, command);
        if !self.config.server.command_center.has_command(module, command) {
            return PendingCommand::failed(MageError::UnknownCommand { name });
        }
        self.commands.send(name, params)
    }

    /// Subscribe to a server event by name.
    pub fn on<F>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.router.on_event(event, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.router.off_event(id)
    }

    /// `module.command` names from the command table.
    pub fn command_names(&self) -> Vec<String> {
        self.config
            .server
            .command_center
            .commands
            .iter()
            .flat_map(|(module, cmds)| cmds.iter().map(move |c| format!("{}.{}", module, c.name)))
            .collect()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        self.router.cache()
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn commands(&self) -> &CommandCenter {
        &self.commands
    }

    pub fn stream(&self) -> &PollingClient {
        &self.stream
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn archivist(&self) -> &Archivist {
        &self.archivist
    }

    /// Stop the message stream.
    pub fn close(&self) {
        self.stream.stop();
    }
}

impl Drop for MageClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MageClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MageClient")
            .field("commands", &self.commands)
            .field("stream", &self.stream)
            .field("session", &self.session.info())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "server": {
            "commandCenter": {
                "url": "http://127.0.0.1:9/game",
                "commands": {
                    "player": [{ "name": "login" }],
                    "shop": [{ "name": "list" }, { "name": "buy" }]
                }
            },
            "msgStream": {
                "transports": { "shortpolling": { "url": "http://127.0.0.1:9/msgstream" } }
            }
        }
    }"#;

    #[tokio::test]
    async fn test_unknown_command_fails_locally() {
        let client = MageClient::new(ClientConfig::from_json(CONFIG).unwrap()).unwrap();

        match client.call("player", "delete", ()).await {
            Err(MageError::UnknownCommand { name }) => assert_eq!(name, "player.delete"),
            other => panic!("Expected UnknownCommand, got: {:?}", other),
        }
        assert_eq!(client.commands().queue_len(), 0);
        assert_eq!(client.commands().last_query_id(), 0);
    }

    #[tokio::test]
    async fn test_builder_wiring() {
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let client = MageClient::builder(ClientConfig::from_json(CONFIG).unwrap())
            .with_cache(cache.clone())
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(client.cache(), &cache));
        assert_eq!(
            client.stream().style(),
            crate::msgstream::TransportStyle::ShortPolling
        );
        assert!(!client.stream().is_running());
        assert_eq!(
            client.command_names(),
            vec!["player.login", "shop.list", "shop.buy"]
        );
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = MageClient::new(ClientConfig::from_json(CONFIG).unwrap());
        assert!(matches!(result, Err(MageError::Config { .. })));
    }
}

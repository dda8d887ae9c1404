//! Centralized configuration for the MAGE client.
//!
//! Constant tables hold the defaults; [`ClientConfig`] is the JSON document a
//! MAGE server hands to its clients (`server.commandCenter`,
//! `server.msgStream`). Durations in that document are milliseconds, and a
//! missing or zero value falls back to the default.

use crate::error::{MageError, Result};
use crate::msgstream::TransportStyle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Command center (batch request) configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = concat!("mage-client/", env!("CARGO_PKG_VERSION"));
    pub const BATCH_TIMEOUT: Duration = Duration::from_millis(5000);
    pub const BATCH_CONTENT_TYPE: &'static str = "text/plain; charset=UTF-8";
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}

/// Message stream (polling) configuration.
pub struct StreamConfig;

impl StreamConfig {
    pub const POLL_TIMEOUT: Duration = Duration::from_millis(60_000);
    pub const AFTER_ERROR_INTERVAL: Duration = Duration::from_millis(5000);
    pub const LONGPOLLING_AFTER_REQUEST_INTERVAL: Duration = Duration::ZERO;
    pub const SHORTPOLLING_AFTER_REQUEST_INTERVAL: Duration = Duration::from_millis(5000);
    pub const DEFAULT_DETECT: [TransportStyle; 2] =
        [TransportStyle::LongPolling, TransportStyle::ShortPolling];
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub command_center: CommandCenterConfig,
    pub msg_stream: MsgStreamConfig,
}

/// A single command exposed by a server module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCenterConfig {
    pub url: String,
    /// Batch timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Commands per module, used to build `module.command` names.
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<CommandDescriptor>>,
}

impl CommandCenterConfig {
    pub fn timeout(&self) -> Duration {
        millis_or(self.timeout, NetworkConfig::BATCH_TIMEOUT)
    }

    /// Whether `module.command` is in the command table.
    pub fn has_command(&self, module: &str, command: &str) -> bool {
        self.commands
            .get(module)
            .map(|cmds| cmds.iter().any(|c| c.name == command))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgStreamConfig {
    /// Transport preference order, first configured style wins.
    #[serde(default)]
    pub detect: Option<Vec<TransportStyle>>,
    #[serde(default)]
    pub transports: TransportsConfig,
}

impl MsgStreamConfig {
    pub fn detect(&self) -> Vec<TransportStyle> {
        self.detect
            .clone()
            .unwrap_or_else(|| StreamConfig::DEFAULT_DETECT.to_vec())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportsConfig {
    #[serde(default)]
    pub longpolling: Option<PollingConfig>,
    #[serde(default)]
    pub shortpolling: Option<PollingConfig>,
}

impl TransportsConfig {
    pub fn get(&self, style: TransportStyle) -> Option<&PollingConfig> {
        match style {
            TransportStyle::LongPolling => self.longpolling.as_ref(),
            TransportStyle::ShortPolling => self.shortpolling.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    pub url: String,
    #[serde(default)]
    pub after_request_interval: Option<u64>,
    #[serde(default)]
    pub after_error_interval: Option<u64>,
    /// Maximum time the server may hold a poll open, in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl ClientConfig {
    /// Parse a client configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.server.command_center.url).map_err(|e| MageError::Config {
            message: format!(
                "invalid command center url {}: {}",
                self.server.command_center.url, e
            ),
        })?;

        for style in self.server.msg_stream.detect() {
            if let Some(polling) = self.server.msg_stream.transports.get(style) {
                url::Url::parse(&polling.url).map_err(|e| MageError::Config {
                    message: format!("invalid {} url {}: {}", style, polling.url, e),
                })?;
            }
        }
        Ok(())
    }
}

/// Milliseconds from config, or the default when missing or zero.
pub(crate) fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    match value {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => default,
    }
}

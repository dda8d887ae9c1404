//! Decoding of server values by media type.

use crate::cache::CachedValue;
use crate::error::{MageError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MEDIA_TOME: &str = "application/x-tome";
pub const MEDIA_JSON: &str = "application/json";
pub const MEDIA_TEXT: &str = "text/plain";
pub const MEDIA_BINARY: &str = "application/octet-stream";

/// Encoded value as sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaValue {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub encoding: Option<String>,
}

impl MediaValue {
    /// Decode into the value the cache stores.
    ///
    /// Unknown or missing media types keep the data as is.
    pub fn decode(&self) -> Result<CachedValue> {
        match self.media_type.as_deref() {
            Some(MEDIA_TOME) => Ok(CachedValue::mergeable(parse_json(&self.data)?)),
            Some(MEDIA_JSON) => Ok(CachedValue::Json(parse_json(&self.data)?)),
            Some(MEDIA_BINARY) => self.decode_binary(),
            _ => Ok(match &self.data {
                Value::String(text) => CachedValue::Text(text.clone()),
                other => CachedValue::Json(other.clone()),
            }),
        }
    }

    fn decode_binary(&self) -> Result<CachedValue> {
        let Value::String(data) = &self.data else {
            return Err(MageError::Json {
                message: "binary media data must be a string".to_string(),
            });
        };

        let bytes = match self.encoding.as_deref() {
            Some("hex") => hex::decode(data).map_err(|e| MageError::Json {
                message: format!("invalid hex media data: {}", e),
            })?,
            Some("base64") => STANDARD.decode(data).map_err(|e| MageError::Json {
                message: format!("invalid base64 media data: {}", e),
            })?,
            None | Some("utf8") | Some("utf-8") => data.as_bytes().to_vec(),
            Some(other) => {
                return Err(MageError::Json {
                    message: format!("unsupported media encoding: {}", other),
                })
            }
        };
        Ok(CachedValue::Binary(Bytes::from(bytes)))
    }
}

/// JSON media carries its document as a string; tolerate inline documents.
fn parse_json(data: &Value) -> Result<Value> {
    match data {
        Value::String(text) => Ok(serde_json::from_str(text)?),
        other => Ok(other.clone()),
    }
}

/// Decode a raw `{mediaType, data, encoding}` object.
pub fn decode(value: &Value) -> Result<CachedValue> {
    let media: MediaValue = serde_json::from_value(value.clone())?;
    media.decode()
}

//! Batch wire format.
//!
//! Request:
//!
//! ```text
//! POST {base}/{cmd1,cmd2,...}?queryId={n}
//! Content-Type: text/plain; charset=UTF-8
//!
//! [header fragments]
//! [params of cmd1]
//! [params of cmd2]
//! ```
//!
//! Response: one `[errorCode, result, events]` triple per command, in order,
//! where `events` is `null` or a list of `[eventName, eventData]` pairs.

use crate::error::{MageError, Result};
use crate::router::PushMessage;
use serde_json::Value;
use url::Url;

/// Settled outcome of one command in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    /// Server error code, present only when truthy.
    pub error_code: Option<Value>,
    pub result: Value,
    /// Events to apply before the command settles.
    pub events: Vec<PushMessage>,
}

/// Build the batch endpoint for the given command names.
pub fn batch_url(base: &str, names: &[String], query_id: u64) -> Result<Url> {
    let raw = format!("{}/{}", base.trim_end_matches('/'), names.join(","));
    let mut url = Url::parse(&raw).map_err(|e| MageError::Config {
        message: format!("invalid command center url {}: {}", raw, e),
    })?;
    url.query_pairs_mut()
        .append_pair("queryId", &query_id.to_string());
    Ok(url)
}

/// Header line followed by one parameter line per command.
pub fn encode_body(header: &[Value], params: &[String]) -> Result<String> {
    let mut body = serde_json::to_string(header)?;
    body.push('\n');
    body.push_str(&params.join("\n"));
    Ok(body)
}

/// Decode a batch response carrying `expected` outcomes.
pub fn decode_response(text: &str, expected: usize) -> Result<Vec<CommandOutcome>> {
    let responses: Vec<Value> = if text.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(text).map_err(|e| MageError::Protocol {
            message: format!("response is not a JSON array: {}", e),
        })?
    };

    if responses.len() != expected {
        return Err(MageError::Protocol {
            message: format!(
                "expected {} responses, got {}",
                expected,
                responses.len()
            ),
        });
    }

    responses.iter().map(decode_outcome).collect()
}

fn decode_outcome(response: &Value) -> Result<CommandOutcome> {
    let items = response.as_array().ok_or_else(|| MageError::Protocol {
        message: format!("command response must be an array, got {}", response),
    })?;

    let error_code = items.first().filter(|code| is_truthy(code)).cloned();
    let result = items.get(1).cloned().unwrap_or(Value::Null);
    let events = match items.get(2) {
        Some(events) => PushMessage::parse_list(events)?,
        None => Vec::new(),
    };

    Ok(CommandOutcome {
        error_code,
        result,
        events,
    })
}

/// Truthiness as the server's runtime understands it.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

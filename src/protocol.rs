//! Wire format between the streamer client and the relay.
//!
//! Text frames carry JSON envelopes `{"type": ..., "data": ...}`; binary
//! frames carry raw media and never pass through here.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

/// One message read off the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Start(StartRequest),
    Stop,
}

/// A validated `start` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub channel_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decodes a text frame into a control message.
///
/// Returns `Malformed` for anything that is not an envelope of a known type
/// and `Validation` for a `start` whose payload cannot be used.
pub fn decode_control(text: &str) -> Result<Control> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| RelayError::Malformed(e.to_string()))?;

    match envelope.kind.as_str() {
        "start" => decode_start(envelope.data).map(Control::Start),
        "stop" => Ok(Control::Stop),
        other => Err(RelayError::Malformed(format!("unknown type {other:?}"))),
    }
}

fn decode_start(data: Value) -> Result<StartRequest> {
    let request: StartRequest = serde_json::from_value(data)
        .map_err(|_| RelayError::Validation("invalid start data".to_string()))?;
    if request.channel_name.trim().is_empty() {
        return Err(RelayError::Validation("channelName is required".to_string()));
    }
    Ok(request)
}

/// Server-to-client responses.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    StreamStarted,
    StreamStopped,
    Error(String),
}

#[derive(Serialize)]
#[serde(untagged)]
enum ReplyBody<'a> {
    Ack {
        #[serde(rename = "type")]
        kind: &'a str,
        data: &'a str,
    },
    Error {
        error: &'a str,
    },
}

impl Reply {
    pub fn to_json(&self) -> String {
        let body = match self {
            Reply::StreamStarted => ReplyBody::Ack {
                kind: "stream-start",
                data: "start",
            },
            Reply::StreamStopped => ReplyBody::Ack {
                kind: "stream-stop",
                data: "stopped",
            },
            Reply::Error(message) => ReplyBody::Error { error: message },
        };
        // Only string fields, so serialization cannot fail.
        serde_json::to_string(&body).unwrap_or_default()
    }
}

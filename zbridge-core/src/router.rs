//! Topic router.
//!
//! Stateless classification of one inbound `(topic, payload)` pair. The
//! checks run in a fixed order: device list, permit-join response, remove
//! response, logging stream, and finally a per-device state message.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{BridgeError, Result};

pub const DEVICES_SUFFIX: &str = "/bridge/devices";
pub const PERMIT_REQUEST_SUFFIX: &str = "/bridge/request/permit_join";
pub const PERMIT_RESPONSE_SUFFIX: &str = "/bridge/response/permit_join";
pub const REMOVE_REQUEST_SUFFIX: &str = "/bridge/request/device/remove";
pub const REMOVE_RESPONSE_SUFFIX: &str = "/bridge/response/device/remove";
pub const LOGGING_SUFFIX: &str = "/bridge/logging";

/// Body of a `bridge/response/...` message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BridgeResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Option<ResponseData>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub value: Option<bool>,
}

impl BridgeResponse {
    /// The bridge's verdict: `Err` when it reported an error.
    pub fn check(&self) -> Result<()> {
        match &self.error {
            Some(error) => Err(BridgeError::Protocol(error.clone())),
            None => Ok(()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.status.as_deref() == Some("ok")
    }

    pub fn id(&self) -> Option<&str> {
        self.data.as_ref().and_then(|d| d.id.as_deref())
    }
}

/// One line of the bridge's log stream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BridgeLog {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Full device list; shape is checked by the adapter.
    Devices(Value),
    PermitJoinResponse(BridgeResponse),
    RemoveResponse(BridgeResponse),
    Logging(BridgeLog),
    DeviceUpdate { friendly_name: String, payload: Value },
}

/// Classify an inbound message. Malformed JSON and topics without a
/// device segment are `Parse` errors; nothing here panics.
pub fn classify(topic: &str, payload: &[u8]) -> Result<Route> {
    let json: Value = serde_json::from_slice(payload).map_err(|e| {
        BridgeError::Parse(format!(
            "Could not process message {} on {}: {}",
            String::from_utf8_lossy(payload),
            topic,
            e
        ))
    })?;

    if topic.ends_with(DEVICES_SUFFIX) {
        return Ok(Route::Devices(json));
    }
    if topic.ends_with(PERMIT_RESPONSE_SUFFIX) {
        return Ok(Route::PermitJoinResponse(parse_body(topic, json)?));
    }
    if topic.ends_with(REMOVE_RESPONSE_SUFFIX) {
        return Ok(Route::RemoveResponse(parse_body(topic, json)?));
    }
    if topic.contains(LOGGING_SUFFIX) {
        return Ok(Route::Logging(parse_body(topic, json)?));
    }

    match topic.split('/').nth(1) {
        Some(friendly_name) => Ok(Route::DeviceUpdate {
            friendly_name: friendly_name.to_string(),
            payload: json,
        }),
        None => Err(BridgeError::Parse(format!("No device segment in topic {}", topic))),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(topic: &str, json: Value) -> Result<T> {
    serde_json::from_value(json)
        .map_err(|e| BridgeError::Parse(format!("Unexpected payload on {}: {}", topic, e)))
}

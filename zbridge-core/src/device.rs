//! Device model.
//!
//! A [`Device`] is built once from a `bridge/devices` entry and owns its
//! capabilities. Inbound state goes through [`Device::apply_update`];
//! outbound requests are produced as [`OutboundMessage`]s for the adapter
//! to publish.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{is_ignored, ActionSpec, Capability, DeviceTag, EventSpec};
use crate::error::{BridgeError, Result};
use crate::expose::parse_exposes;
use crate::transport::OutboundMessage;

/// A device as reported by `<prefix>/bridge/devices`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceDefinition {
    #[serde(default)]
    pub ieee_address: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub definition: Option<ModelDefinition>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub power_source: Option<String>,
    #[serde(default)]
    pub supported: bool,
    #[serde(default)]
    pub interview_completed: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub exposes: Vec<Value>,
}

impl DeviceDefinition {
    /// Only end devices and routers are bridged; the coordinator is not.
    pub fn is_bridgeable_type(&self) -> bool {
        self.device_type == "EndDevice" || self.device_type == "Router"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_source: Option<String>,
}

/// What the host is told about a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThingDescription {
    pub id: String,
    pub title: String,
    #[serde(rename = "@type")]
    pub tags: BTreeSet<DeviceTag>,
    pub friendly_name: String,
    pub topic: String,
    #[serde(flatten)]
    pub metadata: DeviceMetadata,
    pub properties: BTreeMap<String, Capability>,
    pub actions: BTreeMap<String, ActionSpec>,
    pub events: BTreeMap<String, EventSpec>,
}

/// One effect of an inbound state message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceChange {
    Property { name: String, value: Value },
    Event { name: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub changes: Vec<DeviceChange>,
    /// Keys that could not be applied. Never fatal to the rest of the message.
    pub misses: Vec<BridgeError>,
}

#[derive(Debug, Clone)]
pub struct Device {
    identity: String,
    friendly_name: String,
    topic: String,
    title: String,
    metadata: DeviceMetadata,
    capabilities: BTreeMap<String, Capability>,
    actions: BTreeMap<String, ActionSpec>,
    events: BTreeMap<String, EventSpec>,
    tags: BTreeSet<DeviceTag>,
}

impl Device {
    /// Build a device from its bridge definition. Returns the parser's
    /// diagnostics alongside.
    pub fn from_definition(prefix: &str, def: &DeviceDefinition) -> (Self, Vec<String>) {
        let identity = def.ieee_address.clone();
        let (friendly_name, title) = if def.friendly_name.is_empty() {
            (identity.clone(), format!("Zigbee2MQTT ({})", identity))
        } else {
            (def.friendly_name.clone(), def.friendly_name.clone())
        };

        let model = def.definition.clone().unwrap_or_default();
        let schema = parse_exposes(&model.exposes);

        let device = Self {
            topic: format!("{}/{}", prefix, friendly_name),
            identity,
            friendly_name,
            title,
            metadata: DeviceMetadata {
                manufacturer: model.vendor.or_else(|| def.manufacturer.clone()),
                model: model.model.or_else(|| def.model_id.clone()),
                description: model.description,
                power_source: def.power_source.clone(),
            },
            capabilities: schema
                .capabilities
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
            actions: schema.actions.into_iter().map(|a| (a.name.clone(), a)).collect(),
            events: schema.events.into_iter().map(|e| (e.name.clone(), e)).collect(),
            tags: schema.tags,
        };
        (device, schema.diagnostics)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    pub fn tags(&self) -> &BTreeSet<DeviceTag> {
        &self.tags
    }

    fn label(&self) -> String {
        format!("{} ({})", self.friendly_name, self.identity)
    }

    pub fn description(&self) -> ThingDescription {
        ThingDescription {
            id: self.identity.clone(),
            title: self.title.clone(),
            tags: self.tags.clone(),
            friendly_name: self.friendly_name.clone(),
            topic: self.topic.clone(),
            metadata: self.metadata.clone(),
            properties: self.capabilities.clone(),
            actions: self.actions.clone(),
            events: self.events.clone(),
        }
    }

    /// Apply a state message from `<topic>`. Every key is handled on its
    /// own; a bad key never blocks the others.
    pub fn apply_update(&mut self, payload: &Value) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();
        let Some(entries) = payload.as_object() else {
            outcome.misses.push(BridgeError::Parse(format!(
                "Expected JSON object on {}, got {}",
                self.topic, payload
            )));
            return outcome;
        };

        for (key, wire) in entries {
            if is_ignored(key) {
                continue;
            }

            if key == "action" {
                match wire.as_str() {
                    Some(event) if self.events.contains_key(event) => {
                        outcome.changes.push(DeviceChange::Event { name: event.to_string() })
                    }
                    Some(event) => outcome.misses.push(BridgeError::UnknownEvent {
                        device: self.label(),
                        event: event.to_string(),
                    }),
                    None => outcome.misses.push(BridgeError::Parse(format!(
                        "Expected string action on {}, got {}",
                        self.topic, wire
                    ))),
                }
                continue;
            }

            match self.capabilities.get_mut(key) {
                Some(capability) => {
                    let value = capability.apply_wire(wire);
                    outcome.changes.push(DeviceChange::Property { name: key.clone(), value });
                }
                None => outcome.misses.push(BridgeError::UnknownCapability {
                    device: self.label(),
                    name: key.clone(),
                }),
            }
        }
        outcome
    }

    /// Validate a logical value and produce the `<topic>/set` message.
    /// The cached value is updated optimistically.
    pub fn write_request(&mut self, name: &str, logical: &Value) -> Result<OutboundMessage> {
        let label = self.label();
        let capability = self
            .capabilities
            .get_mut(name)
            .ok_or_else(|| BridgeError::UnknownCapability {
                device: label,
                name: name.to_string(),
            })?;
        capability.validate(logical)?;
        capability.value = Some(logical.clone());

        let mut body = Map::new();
        body.insert(name.to_string(), capability.to_wire(logical));
        Ok(OutboundMessage::json(format!("{}/set", self.topic), &Value::Object(body)))
    }

    /// One `<topic>/get` message naming every readable capability, or
    /// `None` when nothing is readable.
    pub fn refresh_request(&self) -> Option<OutboundMessage> {
        let body: Map<String, Value> = self
            .capabilities
            .values()
            .filter(|c| c.is_readable())
            .map(|c| (c.name.clone(), Value::String(String::new())))
            .collect();
        if body.is_empty() {
            return None;
        }
        Some(OutboundMessage::json(format!("{}/get", self.topic), &Value::Object(body)))
    }

    pub fn action_request(&self, name: &str, input: &Value) -> Result<OutboundMessage> {
        if !self.actions.contains_key(name) {
            return Err(BridgeError::UnknownCapability {
                device: self.label(),
                name: name.to_string(),
            });
        }
        let mut body = Map::new();
        body.insert(name.to_string(), input.clone());
        Ok(OutboundMessage::json(format!("{}/set", self.topic), &Value::Object(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device(definition: Value) -> Device {
        let def: DeviceDefinition = serde_json::from_value(definition).unwrap();
        Device::from_definition("zigbee2mqtt", &def).0
    }

    fn lamp() -> Device {
        device(json!({
            "type": "EndDevice",
            "ieee_address": "0x1",
            "friendly_name": "lamp",
            "definition": {"exposes": [
                {"type": "light", "features": [{"name": "state", "type": "binary", "access": 7}]}
            ]}
        }))
    }

    fn payload(msg: &OutboundMessage) -> Value {
        serde_json::from_str(&msg.payload).unwrap()
    }

    #[test]
    fn test_lamp_on() {
        let mut lamp = lamp();
        assert_eq!(lamp.topic(), "zigbee2mqtt/lamp");
        assert_eq!(lamp.capability("state").unwrap().value, None);

        let outcome = lamp.apply_update(&json!({"state": "ON"}));
        assert!(outcome.misses.is_empty());
        assert_eq!(
            outcome.changes,
            vec![DeviceChange::Property { name: "state".into(), value: json!(true) }]
        );
        assert_eq!(lamp.capability("state").unwrap().value, Some(json!(true)));
    }

    #[test]
    fn test_contact_inverted() {
        let mut sensor = device(json!({
            "type": "EndDevice",
            "ieee_address": "0x2",
            "friendly_name": "door",
            "definition": {"exposes": [{"type": "binary", "name": "contact", "access": 1}]}
        }));

        sensor.apply_update(&json!({"contact": true}));
        assert_eq!(sensor.capability("contact").unwrap().value, Some(json!(false)));
        sensor.apply_update(&json!({"contact": false}));
        assert_eq!(sensor.capability("contact").unwrap().value, Some(json!(true)));
        assert!(sensor.tags().contains(&DeviceTag::DoorSensor));
    }

    #[test]
    fn test_title_fallback() {
        let unnamed = device(json!({"type": "Router", "ieee_address": "0x3"}));
        assert_eq!(unnamed.title(), "Zigbee2MQTT (0x3)");
        assert_eq!(unnamed.friendly_name(), "0x3");
        assert_eq!(unnamed.topic(), "zigbee2mqtt/0x3");
    }

    #[test]
    fn test_update_misses_do_not_block_other_keys() {
        let mut lamp = lamp();
        let outcome = lamp.apply_update(&json!({
            "linkquality": 87,
            "hue": 12,
            "state": "OFF"
        }));

        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.misses.len(), 1);
        assert!(outcome.misses[0].is_routing_miss());
        assert_eq!(lamp.capability("state").unwrap().value, Some(json!(false)));
    }

    #[test]
    fn test_non_object_update() {
        let mut lamp = lamp();
        let outcome = lamp.apply_update(&json!(["state", "ON"]));
        assert!(outcome.changes.is_empty());
        assert!(matches!(outcome.misses[..], [BridgeError::Parse(_)]));
    }

    #[test]
    fn test_action_events() {
        let mut button = device(json!({
            "type": "EndDevice",
            "ieee_address": "0x4",
            "friendly_name": "button",
            "definition": {"exposes": [
                {"type": "enum", "name": "action", "access": 1,
                 "values": ["single", "double", "hold"]},
                {"type": "numeric", "name": "battery", "access": 1, "unit": "%"}
            ]}
        }));

        let outcome = button.apply_update(&json!({"action": "double", "battery": 90}));
        assert!(outcome.changes.contains(&DeviceChange::Event { name: "double".into() }));
        assert!(outcome.misses.is_empty());

        let outcome = button.apply_update(&json!({"action": "triple"}));
        assert!(outcome.changes.is_empty());
        assert!(matches!(outcome.misses[..], [BridgeError::UnknownEvent { .. }]));

        let outcome = button.apply_update(&json!({"action": 3}));
        assert!(matches!(outcome.misses[..], [BridgeError::Parse(_)]));
    }

    #[test]
    fn test_write_request() {
        let mut bulb = device(json!({
            "type": "Router",
            "ieee_address": "0x5",
            "friendly_name": "bulb",
            "definition": {"exposes": [{"type": "light", "features": [
                {"type": "binary", "name": "state", "access": 7},
                {"type": "numeric", "name": "brightness", "access": 7,
                 "value_min": 0, "value_max": 254},
                {"type": "numeric", "name": "color_temp", "access": 7,
                 "value_min": 150, "value_max": 500}
            ]}]}
        }));

        let msg = bulb.write_request("state", &json!(true)).unwrap();
        assert_eq!(msg.topic, "zigbee2mqtt/bulb/set");
        assert_eq!(payload(&msg), json!({"state": "ON"}));

        let msg = bulb.write_request("brightness", &json!(50)).unwrap();
        assert_eq!(payload(&msg), json!({"brightness": 127}));
        assert_eq!(bulb.capability("brightness").unwrap().value, Some(json!(50)));

        let msg = bulb.write_request("color_temp", &json!(4000)).unwrap();
        assert_eq!(payload(&msg), json!({"color_temp": 250}));

        assert!(matches!(
            bulb.write_request("brightness", &json!(150)),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(
            bulb.write_request("hue", &json!(1)),
            Err(BridgeError::UnknownCapability { .. })
        ));
    }

    #[test]
    fn test_refresh_request_batches_readable() {
        let sensor = device(json!({
            "type": "EndDevice",
            "ieee_address": "0x6",
            "friendly_name": "plug",
            "definition": {"exposes": [
                {"type": "switch", "features": [{"type": "binary", "name": "state", "access": 7}]},
                {"type": "numeric", "name": "power", "access": 5},
                {"type": "numeric", "name": "energy", "access": 1}
            ]}
        }));

        let msg = sensor.refresh_request().unwrap();
        assert_eq!(msg.topic, "zigbee2mqtt/plug/get");
        assert_eq!(payload(&msg), json!({"state": "", "power": ""}));
    }

    #[test]
    fn test_refresh_request_without_readable() {
        let sensor = device(json!({
            "type": "EndDevice",
            "ieee_address": "0x7",
            "friendly_name": "motion",
            "definition": {"exposes": [{"type": "binary", "name": "occupancy", "access": 1}]}
        }));
        assert!(sensor.refresh_request().is_none());
    }

    #[test]
    fn test_action_request() {
        let bulb = device(json!({
            "type": "Router",
            "ieee_address": "0x8",
            "friendly_name": "bulb",
            "definition": {"exposes": [
                {"type": "enum", "name": "effect", "access": 2, "values": ["blink", "okay"]}
            ]}
        }));

        let msg = bulb.action_request("effect", &json!("blink")).unwrap();
        assert_eq!(msg.topic, "zigbee2mqtt/bulb/set");
        assert_eq!(payload(&msg), json!({"effect": "blink"}));
        assert!(bulb.action_request("identify", &Value::Null).is_err());
    }

    #[test]
    fn test_description() {
        let thing = device(json!({
            "type": "EndDevice",
            "ieee_address": "0x9",
            "friendly_name": "hall sensor",
            "power_source": "Battery",
            "definition": {
                "vendor": "Aqara", "model": "RTCGQ11LM", "description": "Motion sensor",
                "exposes": [{"type": "binary", "name": "occupancy", "access": 1}]
            }
        }))
        .description();

        let json = serde_json::to_value(&thing).unwrap();
        assert_eq!(json["id"], "0x9");
        assert_eq!(json["title"], "hall sensor");
        assert_eq!(json["manufacturer"], "Aqara");
        assert_eq!(json["@type"], json!(["MotionSensor"]));
        assert_eq!(json["properties"]["occupancy"]["@type"], "MotionProperty");
        assert_eq!(json["properties"]["occupancy"]["readOnly"], true);
    }
}

//! Live capabilities (properties), actions, and events of a device.
//!
//! A [`Capability`] is built once at discovery time from a parsed expose
//! and owns its [`Transform`] and the last logical value seen on the wire.
//! Semantic tags are looked up in static tables here and never change
//! after construction.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;

use crate::error::{BridgeError, Result};
use crate::expose::{Access, CapabilityDescriptor, DescriptorKind};
use crate::transform::Transform;

/// Logical value type presented to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Boolean,
    Integer,
    Number,
    String,
    Object,
}

impl ValueType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Boolean => value.is_boolean(),
            ValueType::Integer => value.is_i64() || value.is_u64() || is_whole(value),
            ValueType::Number => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::Object => true,
        }
    }
}

fn is_whole(value: &Value) -> bool {
    value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
}

/// Semantic role of a device as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DeviceTag {
    Light,
    OnOffSwitch,
    Thermostat,
    PushButton,
    MotionSensor,
    TemperatureSensor,
    HumiditySensor,
    BarometricPressureSensor,
    SmokeSensor,
    DoorSensor,
    LeakSensor,
}

/// Semantic role of a single property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyTag {
    #[serde(rename = "OnOffProperty")]
    OnOff,
    #[serde(rename = "BrightnessProperty")]
    Brightness,
    #[serde(rename = "ColorTemperatureProperty")]
    ColorTemperature,
    #[serde(rename = "ColorProperty")]
    Color,
    #[serde(rename = "HeatingCoolingProperty")]
    HeatingCooling,
    #[serde(rename = "ThermostatModeProperty")]
    ThermostatMode,
    #[serde(rename = "LevelProperty")]
    Level,
    #[serde(rename = "MotionProperty")]
    Motion,
    #[serde(rename = "InstantaneousPowerProperty")]
    InstantaneousPower,
    #[serde(rename = "CurrentProperty")]
    Current,
    #[serde(rename = "TemperatureProperty")]
    Temperature,
    #[serde(rename = "TargetTemperatureProperty")]
    TargetTemperature,
    #[serde(rename = "HumidityProperty")]
    Humidity,
    #[serde(rename = "BarometricPressureProperty")]
    BarometricPressure,
    #[serde(rename = "SmokeProperty")]
    Smoke,
    #[serde(rename = "OpenProperty")]
    Open,
    #[serde(rename = "LeakProperty")]
    Leak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventTag {
    #[serde(rename = "PressedEvent")]
    Pressed,
    #[serde(rename = "DoublePressedEvent")]
    DoublePressed,
    #[serde(rename = "LongPressedEvent")]
    LongPressed,
}

/// Fixed classification for well-known leaf names.
struct LeafRule {
    name: &'static str,
    title: Option<&'static str>,
    tag: Option<PropertyTag>,
    device_tag: Option<DeviceTag>,
    transform: Transform,
}

const fn rule(
    name: &'static str,
    title: Option<&'static str>,
    tag: Option<PropertyTag>,
    device_tag: Option<DeviceTag>,
) -> LeafRule {
    LeafRule { name, title, tag, device_tag, transform: Transform::Identity }
}

// contact and water_leak report the opposite of what the host expects
// ("contact" = closed, "water_leak" = leaking), hence the inversion.
const LEAF_RULES: &[LeafRule] = &[
    rule("occupancy", None, Some(PropertyTag::Motion), Some(DeviceTag::MotionSensor)),
    rule("power", None, Some(PropertyTag::InstantaneousPower), None),
    rule("current", None, Some(PropertyTag::Current), None),
    rule("local_temperature", Some("Current temperature"), Some(PropertyTag::Temperature), None),
    rule(
        "occupied_heating_setpoint",
        Some("Target temperature"),
        Some(PropertyTag::TargetTemperature),
        None,
    ),
    rule("system_mode", Some("Mode"), Some(PropertyTag::ThermostatMode), None),
    rule("pi_heating_demand", Some("Valve state"), None, None),
    rule("battery", Some("Battery"), None, None),
    rule(
        "temperature",
        Some("Temperature"),
        Some(PropertyTag::Temperature),
        Some(DeviceTag::TemperatureSensor),
    ),
    rule(
        "humidity",
        Some("Humidity"),
        Some(PropertyTag::Humidity),
        Some(DeviceTag::HumiditySensor),
    ),
    rule(
        "pressure",
        Some("Barometric pressure"),
        Some(PropertyTag::BarometricPressure),
        Some(DeviceTag::BarometricPressureSensor),
    ),
    rule("smoke", Some("Smoke"), Some(PropertyTag::Smoke), Some(DeviceTag::SmokeSensor)),
    LeafRule {
        name: "contact",
        title: Some("Open"),
        tag: Some(PropertyTag::Open),
        device_tag: Some(DeviceTag::DoorSensor),
        transform: Transform::Invert,
    },
    LeafRule {
        name: "water_leak",
        title: Some("Leak"),
        tag: Some(PropertyTag::Leak),
        device_tag: Some(DeviceTag::LeakSensor),
        transform: Transform::Invert,
    },
];

/// Telemetry keys that are never surfaced, neither at discovery nor on update.
pub const IGNORED_PROPERTIES: &[&str] = &[
    "linkquality",
    "local_temperature_calibration",
    "update",
    "update_available",
    "color_temp_startup",
    "voltage",
    "led_indication",
    "occupancy_timeout",
    "illuminance",
    "motion_sensitivity",
    "requested_brightness_percent",
    "requested_brightness_level",
    "action_side",
    "eurotronic_trv_mode",
    "eurotronic_valve_position",
];

pub fn is_ignored(key: &str) -> bool {
    IGNORED_PROPERTIES.contains(&key)
}

/// A typed, bidirectional property of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capability {
    /// Key used in wire payloads.
    pub name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(rename = "multipleOf", skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(rename = "readOnly")]
    pub read_only: bool,
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub tag: Option<PropertyTag>,
    #[serde(skip)]
    pub access: Access,
    #[serde(skip)]
    pub transform: Transform,
    /// Last known logical value.
    pub value: Option<Value>,
}

impl Capability {
    /// Generic capability straight from a descriptor: access-derived
    /// defaults, identity transform, no tag.
    pub fn from_descriptor(desc: &CapabilityDescriptor) -> Self {
        Self {
            name: desc.name.clone(),
            title: desc.name.clone(),
            description: desc.description.clone(),
            value_type: value_type_of(&desc.kind),
            unit: desc.unit.clone(),
            minimum: desc.min,
            maximum: desc.max,
            multiple_of: desc.step,
            enum_values: desc.enum_values.clone(),
            read_only: !desc.access.is_writable(),
            tag: None,
            access: desc.access,
            transform: Transform::Identity,
            value: None,
        }
    }

    /// Generic capability enriched from the leaf classification table.
    /// Returns the device-level tag the leaf implies, if any.
    pub fn classified(desc: &CapabilityDescriptor) -> (Self, Option<DeviceTag>) {
        let mut capability = Self::from_descriptor(desc);
        if capability.unit.as_deref() == Some("%") {
            capability.tag = Some(PropertyTag::Level);
        }

        let Some(rule) = LEAF_RULES.iter().find(|r| r.name == desc.name) else {
            return (capability, None);
        };

        if let Some(title) = rule.title {
            capability.title = title.to_string();
        }
        if rule.tag.is_some() {
            capability.tag = rule.tag;
        }
        if rule.transform == Transform::Invert {
            capability.value_type = ValueType::Boolean;
        }
        capability.transform = rule.transform;
        (capability, rule.device_tag)
    }

    pub fn is_readable(&self) -> bool {
        self.access.is_readable()
    }

    /// Convert a wire value, cache it, and return the logical value.
    pub fn apply_wire(&mut self, wire: &Value) -> Value {
        let logical = self.transform.to_logical(wire);
        self.value = Some(logical.clone());
        logical
    }

    pub fn to_wire(&self, logical: &Value) -> Value {
        self.transform.to_wire(logical)
    }

    /// Check a logical value against the declared metadata before it is
    /// written.
    pub fn validate(&self, value: &Value) -> Result<()> {
        if self.read_only {
            return Err(BridgeError::Validation(format!("{} is read-only", self.name)));
        }
        if !self.value_type.accepts(value) {
            return Err(BridgeError::Validation(format!(
                "{} expects a value of type {:?}, got {}",
                self.name, self.value_type, value
            )));
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum {
                if n < min {
                    return Err(BridgeError::Validation(format!(
                        "Value less than minimum: {}",
                        min
                    )));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    return Err(BridgeError::Validation(format!(
                        "Value greater than maximum: {}",
                        max
                    )));
                }
            }
            if let Some(step) = self.multiple_of {
                if step > 0.0 && !is_multiple_of(n, step) {
                    return Err(BridgeError::Validation(format!(
                        "Value is not a multiple of: {}",
                        step
                    )));
                }
            }
        }

        if let (Some(allowed), Some(s)) = (&self.enum_values, value.as_str()) {
            if !allowed.iter().any(|v| v == s) {
                return Err(BridgeError::Validation(format!(
                    "Invalid enum value: {}",
                    s
                )));
            }
        }

        Ok(())
    }
}

fn is_multiple_of(n: f64, step: f64) -> bool {
    let q = n / step;
    (q - q.round()).abs() < 1e-6
}

pub fn value_type_of(kind: &DescriptorKind) -> ValueType {
    match kind {
        DescriptorKind::Numeric { integer: true } => ValueType::Integer,
        DescriptorKind::Numeric { integer: false } => ValueType::Number,
        DescriptorKind::Binary => ValueType::Boolean,
        DescriptorKind::Enum | DescriptorKind::Text => ValueType::String,
        DescriptorKind::Composite { .. } => ValueType::Object,
    }
}

/// Input schema of a write-only action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionInput {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

/// A one-shot write with no readable state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input: ActionInput,
}

impl ActionSpec {
    pub fn from_descriptor(desc: &CapabilityDescriptor) -> Self {
        Self {
            name: desc.name.clone(),
            description: desc.description.clone(),
            input: ActionInput {
                value_type: value_type_of(&desc.kind),
                unit: desc.unit.clone(),
                enum_values: desc.enum_values.clone(),
                minimum: desc.min,
                maximum: desc.max,
            },
        }
    }
}

/// A discrete event a device may raise through its `action` key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSpec {
    pub name: String,
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub tag: Option<EventTag>,
}

impl EventSpec {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), tag: event_tag(name) }
    }
}

/// Press classification of an action value. Later rules win.
pub fn event_tag(value: &str) -> Option<EventTag> {
    let mut tag = None;
    if value.contains("single") || value == "on" || value == "toggle" {
        tag = Some(EventTag::Pressed);
    }
    if value.contains("double") {
        tag = Some(EventTag::DoublePressed);
    }
    if value.contains("release") {
        tag = Some(EventTag::LongPressed);
    }
    tag
}

/// Device tags implied by a set of events.
pub fn event_device_tags(events: &[EventSpec]) -> BTreeSet<DeviceTag> {
    let mut tags = BTreeSet::new();
    if events.iter().any(|e| e.tag.is_some()) {
        tags.insert(DeviceTag::PushButton);
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn numeric(name: &str, access: u8) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: name.to_string(),
            declared_name: name.to_string(),
            kind: DescriptorKind::Numeric { integer: false },
            access: Access::new(access),
            unit: None,
            min: None,
            max: None,
            step: None,
            enum_values: None,
            description: None,
        }
    }

    #[test]
    fn test_generic_capability_defaults() {
        let mut desc = numeric("local_temperature", 5);
        desc.unit = Some("degree celsius".into());
        let cap = Capability::from_descriptor(&desc);

        assert_eq!(cap.title, "local_temperature");
        assert_eq!(cap.value_type, ValueType::Number);
        assert!(cap.read_only);
        assert!(cap.is_readable());
        assert_eq!(cap.transform, Transform::Identity);
        assert_eq!(cap.tag, None);
    }

    #[test]
    fn test_classification_table() {
        let (cap, device_tag) = Capability::classified(&numeric("temperature", 1));
        assert_eq!(cap.title, "Temperature");
        assert_eq!(cap.tag, Some(PropertyTag::Temperature));
        assert_eq!(device_tag, Some(DeviceTag::TemperatureSensor));

        let (cap, device_tag) = Capability::classified(&numeric("battery", 5));
        assert_eq!(cap.title, "Battery");
        assert_eq!(cap.tag, None);
        assert_eq!(device_tag, None);
    }

    #[test]
    fn test_classified_leaves_are_not_ignored() {
        for rule in LEAF_RULES {
            assert!(!is_ignored(rule.name), "{} is classified but ignored", rule.name);
        }
    }

    #[test]
    fn test_percent_unit_is_level() {
        let mut desc = numeric("valve_position", 7);
        desc.unit = Some("%".into());
        let (cap, _) = Capability::classified(&desc);
        assert_eq!(cap.tag, Some(PropertyTag::Level));

        // Table tags take precedence over the unit rule.
        let mut desc = numeric("humidity", 1);
        desc.unit = Some("%".into());
        let (cap, _) = Capability::classified(&desc);
        assert_eq!(cap.tag, Some(PropertyTag::Humidity));
    }

    #[test]
    fn test_contact_is_inverted() {
        let mut desc = numeric("contact", 1);
        desc.kind = DescriptorKind::Binary;
        let (mut cap, device_tag) = Capability::classified(&desc);

        assert_eq!(device_tag, Some(DeviceTag::DoorSensor));
        assert_eq!(cap.apply_wire(&json!(true)), json!(false));
        assert_eq!(cap.value, Some(json!(false)));
        assert_eq!(cap.apply_wire(&json!(false)), json!(true));
    }

    #[test]
    fn test_validate_bounds_and_access() {
        let mut desc = numeric("occupied_heating_setpoint", 7);
        desc.min = Some(5.0);
        desc.max = Some(30.0);
        desc.step = Some(0.5);
        let cap = Capability::from_descriptor(&desc);

        assert!(cap.validate(&json!(21.5)).is_ok());
        assert!(matches!(cap.validate(&json!(4)), Err(BridgeError::Validation(_))));
        assert!(matches!(cap.validate(&json!(31)), Err(BridgeError::Validation(_))));
        assert!(matches!(cap.validate(&json!(21.3)), Err(BridgeError::Validation(_))));
        assert!(matches!(cap.validate(&json!("warm")), Err(BridgeError::Validation(_))));

        let read_only = Capability::from_descriptor(&numeric("power", 5));
        assert!(matches!(read_only.validate(&json!(1)), Err(BridgeError::Validation(_))));
    }

    #[test]
    fn test_validate_enum() {
        let mut desc = numeric("system_mode", 7);
        desc.kind = DescriptorKind::Enum;
        desc.enum_values = Some(vec!["off".into(), "heat".into()]);
        let cap = Capability::from_descriptor(&desc);

        assert!(cap.validate(&json!("heat")).is_ok());
        assert!(cap.validate(&json!("cool")).is_err());
    }

    #[test]
    fn test_event_tags() {
        assert_eq!(event_tag("single"), Some(EventTag::Pressed));
        assert_eq!(event_tag("on"), Some(EventTag::Pressed));
        assert_eq!(event_tag("toggle"), Some(EventTag::Pressed));
        assert_eq!(event_tag("double_left"), Some(EventTag::DoublePressed));
        assert_eq!(event_tag("hold_release"), Some(EventTag::LongPressed));
        assert_eq!(event_tag("brightness_move_up"), None);

        let events = vec![EventSpec::new("brightness_stop"), EventSpec::new("single")];
        assert!(event_device_tags(&events).contains(&DeviceTag::PushButton));
        assert!(event_device_tags(&[EventSpec::new("shake")]).is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let mut desc = numeric("brightness", 7);
        desc.max = Some(254.0);
        let cap = Capability::from_descriptor(&desc);
        let json = serde_json::to_value(&cap).unwrap();

        assert_eq!(json["type"], "number");
        assert_eq!(json["readOnly"], false);
        assert_eq!(json["maximum"], 254.0);
        assert!(json.get("transform").is_none());
        assert!(json.get("@type").is_none());
    }
}

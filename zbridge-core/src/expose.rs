//! Parser for zigbee2mqtt `exposes`.
//!
//! Each entry of a device definition's `exposes` array is read into an
//! [`Expose`], normalized into a [`CapabilityDescriptor`], and then
//! expanded into the device's capabilities, actions, and events:
//!
//! - leaves (`numeric`, `enum`, `binary`, anything else as text) become one
//!   capability each, classified through the leaf table in `capability.rs`
//! - a leaf named `action` becomes the device's event set
//! - a write-only leaf becomes a one-shot action
//! - `light`, `switch`, `climate` composites expand feature by feature, with
//!   the special features listed in [`FEATURE_RULES`]
//! - `fan`, `cover`, `lock` are recognized but produce nothing yet
//!
//! Parsing never fails. Anything skipped is reported in
//! [`ParsedSchema::diagnostics`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{
    event_device_tags, is_ignored, ActionSpec, Capability, DeviceTag, EventSpec, PropertyTag,
    ValueType,
};
use crate::transform::{mired_to_kelvin, Transform, DEFAULT_DEVICE_MAX};

pub const PUBLISH_BIT: u8 = 0b001;
pub const WRITE_BIT: u8 = 0b010;
pub const READ_BIT: u8 = 0b100;

/// zigbee2mqtt access bitmask, kept exactly as received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Access(u8);

impl Access {
    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & WRITE_BIT != 0
    }

    /// Readable means the value can be requested through `<topic>/get`.
    pub fn is_readable(&self) -> bool {
        self.0 & READ_BIT != 0
    }

    /// Settable but neither published nor gettable.
    pub fn is_write_only(&self) -> bool {
        self.0 == WRITE_BIT
    }
}

/// One entry of `definition.exposes`, as sent by the bridge.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Expose {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub access: Option<u8>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub value_min: Option<f64>,
    #[serde(default)]
    pub value_max: Option<f64>,
    #[serde(default)]
    pub value_step: Option<f64>,
    /// Enum values; some converters send numbers.
    #[serde(default)]
    pub values: Option<Vec<Value>>,
    /// Read one at a time so a bad feature only drops itself.
    #[serde(default)]
    pub features: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKind {
    Light,
    Switch,
    Climate,
    Fan,
    Cover,
    Lock,
    /// zigbee2mqtt's plain `composite` type.
    Generic,
}

impl CompositeKind {
    fn from_type(kind: &str) -> Option<Self> {
        match kind {
            "light" => Some(Self::Light),
            "switch" => Some(Self::Switch),
            "climate" => Some(Self::Climate),
            "fan" => Some(Self::Fan),
            "cover" => Some(Self::Cover),
            "lock" => Some(Self::Lock),
            "composite" => Some(Self::Generic),
            _ => None,
        }
    }

    fn device_tag(&self) -> Option<DeviceTag> {
        match self {
            Self::Light => Some(DeviceTag::Light),
            Self::Switch => Some(DeviceTag::OnOffSwitch),
            Self::Climate => Some(DeviceTag::Thermostat),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::Climate => "climate",
            Self::Fan => "fan",
            Self::Cover => "cover",
            Self::Lock => "lock",
            Self::Generic => "composite",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorKind {
    /// `integer` when the expose declares `value_step == 1`.
    Numeric { integer: bool },
    Enum,
    Binary,
    /// Absent or unrecognized type, surfaced as a string.
    Text,
    /// `children` is `None` when the expose carried no `features` array.
    /// Features that could not be read are listed in `rejected`.
    Composite {
        composite: CompositeKind,
        children: Option<Vec<CapabilityDescriptor>>,
        rejected: Vec<String>,
    },
}

/// Normalized form of one expose.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDescriptor {
    /// Wire key: the expose's `property`, falling back to `name`.
    pub name: String,
    /// The expose's declared `name`; empty when absent.
    pub declared_name: String,
    pub kind: DescriptorKind,
    pub access: Access,
    pub unit: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub enum_values: Option<Vec<String>>,
    pub description: Option<String>,
}

impl CapabilityDescriptor {
    pub fn from_expose(expose: &Expose) -> Self {
        let declared_name = expose.name.clone().unwrap_or_default();
        let name = expose
            .property
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| declared_name.clone());

        Self {
            name,
            declared_name,
            kind: parse_kind(expose),
            access: Access::new(expose.access.unwrap_or(0)),
            unit: parse_unit(expose.unit.as_deref()),
            min: expose.value_min,
            max: expose.value_max,
            step: expose.value_step,
            enum_values: expose
                .values
                .as_ref()
                .map(|values| values.iter().map(enum_label).collect()),
            description: expose.description.clone(),
        }
    }
}

/// Read one raw expose or feature.
pub fn read_expose(raw: &Value) -> Result<CapabilityDescriptor, String> {
    serde_json::from_value::<Expose>(raw.clone())
        .map(|expose| CapabilityDescriptor::from_expose(&expose))
        .map_err(|e| format!("Could not read expose {}: {}", raw, e))
}

fn enum_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_kind(expose: &Expose) -> DescriptorKind {
    let kind = expose.kind.as_deref().unwrap_or("");
    if let Some(composite) = CompositeKind::from_type(kind) {
        let mut rejected = Vec::new();
        let children = expose.features.as_ref().map(|features| {
            let mut children = Vec::with_capacity(features.len());
            for raw in features {
                match read_expose(raw) {
                    Ok(child) => children.push(child),
                    Err(diagnostic) => rejected.push(diagnostic),
                }
            }
            children
        });
        return DescriptorKind::Composite { composite, children, rejected };
    }

    match kind {
        "numeric" => DescriptorKind::Numeric { integer: expose.value_step == Some(1.0) },
        "enum" => DescriptorKind::Enum,
        "binary" => DescriptorKind::Binary,
        _ => DescriptorKind::Text,
    }
}

/// Normalize the bridge's unit strings. The bridge sometimes sends the
/// degree sign double-encoded.
pub fn parse_unit(unit: Option<&str>) -> Option<String> {
    match unit {
        Some("°C") | Some("Â°C") => Some("degree celsius".to_string()),
        other => other.map(str::to_string),
    }
}

#[derive(Debug, Clone, Copy)]
enum KeyMatch {
    /// Matches the feature's declared name.
    Name(&'static str),
    /// Matches the start of the feature's wire key.
    Prefix(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum FeatureRole {
    OnOff,
    Brightness,
    ColorTemperature,
    Color,
    HeatingCooling,
}

struct FeatureRule {
    composite: CompositeKind,
    key: KeyMatch,
    role: FeatureRole,
}

/// Composite features that need more than the generic leaf treatment.
const FEATURE_RULES: &[FeatureRule] = &[
    FeatureRule {
        composite: CompositeKind::Light,
        key: KeyMatch::Name("state"),
        role: FeatureRole::OnOff,
    },
    FeatureRule {
        composite: CompositeKind::Light,
        key: KeyMatch::Name("brightness"),
        role: FeatureRole::Brightness,
    },
    FeatureRule {
        composite: CompositeKind::Light,
        key: KeyMatch::Name("color_temp"),
        role: FeatureRole::ColorTemperature,
    },
    FeatureRule {
        composite: CompositeKind::Light,
        key: KeyMatch::Name("color_xy"),
        role: FeatureRole::Color,
    },
    FeatureRule {
        composite: CompositeKind::Switch,
        key: KeyMatch::Prefix("state"),
        role: FeatureRole::OnOff,
    },
    FeatureRule {
        composite: CompositeKind::Climate,
        key: KeyMatch::Name("running_state"),
        role: FeatureRole::HeatingCooling,
    },
];

impl FeatureRule {
    fn matches(&self, composite: CompositeKind, feature: &CapabilityDescriptor) -> bool {
        self.composite == composite
            && match self.key {
                KeyMatch::Name(name) => feature.declared_name == name,
                KeyMatch::Prefix(prefix) => feature.name.starts_with(prefix),
            }
    }
}

impl FeatureRole {
    fn build(&self, feature: &CapabilityDescriptor) -> Capability {
        let mut cap = Capability::from_descriptor(feature);
        match self {
            FeatureRole::OnOff => {
                cap.title = "On".to_string();
                cap.tag = Some(PropertyTag::OnOff);
                cap.value_type = ValueType::Boolean;
                cap.transform = Transform::OnOffToken;
            }
            FeatureRole::Brightness => {
                let device_max = feature.max.filter(|m| *m > 0.0).unwrap_or(DEFAULT_DEVICE_MAX);
                cap.title = "Brightness".to_string();
                cap.tag = Some(PropertyTag::Brightness);
                cap.value_type = ValueType::Number;
                cap.unit = Some("percent".to_string());
                cap.minimum = Some(0.0);
                cap.maximum = Some(100.0);
                cap.multiple_of = None;
                cap.transform = Transform::Percent { device_max };
            }
            FeatureRole::ColorTemperature => {
                // Mired and kelvin are reciprocal, so the bounds swap.
                cap.title = "Color temperature".to_string();
                cap.tag = Some(PropertyTag::ColorTemperature);
                cap.value_type = ValueType::Number;
                cap.unit = Some("kelvin".to_string());
                cap.minimum = feature.max.map(mired_to_kelvin).filter(|k| k.is_finite());
                cap.maximum = feature.min.map(mired_to_kelvin).filter(|k| k.is_finite());
                cap.multiple_of = None;
                cap.transform = Transform::MiredKelvin;
            }
            FeatureRole::Color => {
                cap.name = "color".to_string();
                cap.title = "Color".to_string();
                cap.tag = Some(PropertyTag::Color);
                cap.value_type = ValueType::Object;
            }
            FeatureRole::HeatingCooling => {
                cap.title = "Running state".to_string();
                cap.tag = Some(PropertyTag::HeatingCooling);
                cap.value_type = ValueType::String;
            }
        }
        cap
    }
}

/// Everything a device declares, ready to be installed on a `Device`.
#[derive(Debug, Clone, Default)]
pub struct ParsedSchema {
    pub capabilities: Vec<Capability>,
    pub actions: Vec<ActionSpec>,
    pub events: Vec<EventSpec>,
    pub tags: BTreeSet<DeviceTag>,
    pub diagnostics: Vec<String>,
}

/// Parse a device definition's `exposes` array.
pub fn parse_exposes(exposes: &[Value]) -> ParsedSchema {
    let mut schema = ParsedSchema::default();
    for raw in exposes {
        match read_expose(raw) {
            Ok(desc) => schema.add_expose(&desc),
            Err(diagnostic) => schema.diagnostics.push(diagnostic),
        }
    }
    schema
}

impl ParsedSchema {
    fn add_expose(&mut self, desc: &CapabilityDescriptor) {
        match &desc.kind {
            DescriptorKind::Composite { composite, children, rejected } => {
                self.diagnostics.extend(rejected.iter().cloned());
                self.add_composite(*composite, desc, children.as_deref())
            }
            _ => self.add_leaf(desc),
        }
    }

    fn add_composite(
        &mut self,
        composite: CompositeKind,
        desc: &CapabilityDescriptor,
        children: Option<&[CapabilityDescriptor]>,
    ) {
        match composite {
            CompositeKind::Fan | CompositeKind::Cover | CompositeKind::Lock => {
                self.diagnostics.push(format!(
                    "{} exposes are not implemented yet, skipping {}",
                    composite.as_str(),
                    describe(desc)
                ));
                return;
            }
            CompositeKind::Generic
                if desc.access.is_write_only() && !desc.declared_name.is_empty() =>
            {
                self.actions.push(ActionSpec::from_descriptor(desc));
                return;
            }
            _ => {}
        }

        let Some(children) = children else {
            self.diagnostics.push(format!(
                "Expected features array in {} expose {}",
                composite.as_str(),
                describe(desc)
            ));
            return;
        };

        if let Some(tag) = composite.device_tag() {
            self.tags.insert(tag);
        }
        for feature in children {
            self.add_feature(composite, feature);
        }
    }

    fn add_feature(&mut self, composite: CompositeKind, feature: &CapabilityDescriptor) {
        if feature.declared_name.is_empty() {
            self.diagnostics.push(format!(
                "Ignoring {} feature without name: {}",
                composite.as_str(),
                describe(feature)
            ));
            return;
        }

        match FEATURE_RULES.iter().find(|r| r.matches(composite, feature)) {
            Some(rule) => self.insert_capability(rule.role.build(feature)),
            None => self.add_expose(feature),
        }
    }

    fn add_leaf(&mut self, desc: &CapabilityDescriptor) {
        if desc.declared_name.is_empty() {
            self.diagnostics.push(format!("Ignoring expose without name: {}", describe(desc)));
            return;
        }
        if desc.declared_name == "action" {
            self.add_events(desc);
            return;
        }
        if desc.access.is_write_only() {
            self.actions.push(ActionSpec::from_descriptor(desc));
            return;
        }
        if is_ignored(&desc.name) {
            return;
        }

        let (capability, device_tag) = Capability::classified(desc);
        if let Some(tag) = device_tag {
            self.tags.insert(tag);
        }
        self.insert_capability(capability);
    }

    fn add_events(&mut self, desc: &CapabilityDescriptor) {
        let values = match &desc.enum_values {
            Some(values) if !values.is_empty() => values,
            _ => {
                self.diagnostics
                    .push(format!("Expected list of action values in {}", describe(desc)));
                return;
            }
        };

        for value in values {
            if !self.events.iter().any(|e| &e.name == value) {
                self.events.push(EventSpec::new(value));
            }
        }
        self.tags.extend(event_device_tags(&self.events));
    }

    fn insert_capability(&mut self, capability: Capability) {
        if self.capabilities.iter().any(|c| c.name == capability.name) {
            self.diagnostics
                .push(format!("Duplicate property {}, keeping the first one", capability.name));
            return;
        }
        self.capabilities.push(capability);
    }
}

fn describe(desc: &CapabilityDescriptor) -> String {
    if desc.name.is_empty() {
        format!("(unnamed, access {})", desc.access.bits())
    } else {
        desc.name.clone()
    }
}

//! Wire <-> logical value transforms.
//!
//! Each capability carries one [`Transform`]. `to_logical` runs on every
//! inbound state update, `to_wire` on every outbound write. Transforms are
//! pure and never fail: a JSON value of a kind the transform does not
//! understand passes through unchanged, and out-of-range numbers are
//! converted, not clamped (bound checks belong to the write path).

use serde::Serialize;
use serde_json::Value;

/// Default wire maximum for brightness when the expose omits `value_max`.
pub const DEFAULT_DEVICE_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Identity,
    /// Wire `0..=device_max` <-> logical `0..=100`.
    Percent { device_max: f64 },
    /// Wire mired <-> logical kelvin. Same function both directions.
    MiredKelvin,
    /// Boolean polarity inversion.
    Invert,
    /// Wire `"ON"`/`"OFF"` <-> logical boolean.
    OnOffToken,
}

impl Transform {
    pub fn to_logical(&self, wire: &Value) -> Value {
        match self {
            Transform::Identity => wire.clone(),
            Transform::Percent { device_max } => map_number(wire, |w| w / device_max * 100.0),
            Transform::MiredKelvin => map_number(wire, mired_to_kelvin),
            Transform::Invert => invert(wire),
            Transform::OnOffToken => Value::Bool(token_to_bool(wire)),
        }
    }

    pub fn to_wire(&self, logical: &Value) -> Value {
        match self {
            Transform::Identity => logical.clone(),
            Transform::Percent { device_max } => map_number(logical, |l| l / 100.0 * device_max),
            Transform::MiredKelvin => map_number(logical, mired_to_kelvin),
            Transform::Invert => invert(logical),
            Transform::OnOffToken => match logical {
                Value::Bool(on) => Value::String(bool_to_token(*on).to_string()),
                other => other.clone(),
            },
        }
    }
}

/// `round(1_000_000 / x)`. Converts mired to kelvin and kelvin to mired.
pub fn mired_to_kelvin(x: f64) -> f64 {
    (1_000_000.0 / x).round()
}

fn token_to_bool(wire: &Value) -> bool {
    matches!(wire, Value::String(s) if s == "ON")
}

fn bool_to_token(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn invert(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::Bool(!b),
        other => other.clone(),
    }
}

/// Apply `f` to a numeric value and round to the nearest integer.
/// Non-numeric input and non-finite results return the input unchanged.
fn map_number(value: &Value, f: impl Fn(f64) -> f64) -> Value {
    let Some(x) = value.as_f64() else {
        return value.clone();
    };
    let y = f(x).round();
    if y.is_finite() {
        Value::from(y as i64)
    } else {
        value.clone()
    }
}

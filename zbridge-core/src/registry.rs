//! Host-side device registry.
//!
//! Adapters announce devices and push value changes through the
//! [`DeviceHost`] trait. [`ThingRegistry`] is the in-process host: it keeps
//! the latest description of every thing, timestamps changes, and fans
//! them out on a broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::device::ThingDescription;

/// Receiver of device lifecycle and value notifications.
pub trait DeviceHost: Send + Sync {
    fn device_added(&self, adapter_id: &str, thing: &ThingDescription);
    fn device_removed(&self, id: &str);
    fn property_changed(&self, id: &str, name: &str, value: &Value);
    fn event_raised(&self, id: &str, event: &str);
}

#[derive(Debug, Clone, Serialize)]
pub struct RaisedEvent {
    pub name: String,
    pub at: DateTime<Utc>,
}

/// A thing as the host currently knows it.
#[derive(Debug, Clone, Serialize)]
pub struct ThingState {
    /// Adapter that announced the thing; requests for it go back there.
    pub adapter_id: String,
    #[serde(flatten)]
    pub thing: ThingDescription,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<RaisedEvent>,
}

/// Fired on every registry change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThingEvent {
    Added { id: String },
    Removed { id: String },
    PropertyChanged { id: String, name: String, value: Value },
    EventRaised { id: String, event: String },
}

pub struct Metrics {
    pub things_added: AtomicU64,
    pub things_removed: AtomicU64,
    pub property_changes: AtomicU64,
    pub events_raised: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            things_added: AtomicU64::new(0),
            things_removed: AtomicU64::new(0),
            property_changes: AtomicU64::new(0),
            events_raised: AtomicU64::new(0),
        }
    }
}

pub struct ThingRegistry {
    things: Arc<DashMap<String, ThingState>>,
    event_tx: broadcast::Sender<ThingEvent>,
    pub metrics: Metrics,
}

impl ThingRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            things: Arc::new(DashMap::new()),
            event_tx,
            metrics: Metrics::new(),
        }
    }

    /// All things, ordered by id.
    pub fn get_all(&self) -> Vec<ThingState> {
        let mut things: Vec<ThingState> =
            self.things.iter().map(|entry| entry.value().clone()).collect();
        things.sort_by(|a, b| a.thing.id.cmp(&b.thing.id));
        things
    }

    pub fn get(&self, id: &str) -> Option<ThingState> {
        self.things.get(id).map(|entry| entry.value().clone())
    }

    pub fn adapter_for(&self, id: &str) -> Option<String> {
        self.things.get(id).map(|entry| entry.adapter_id.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThingEvent> {
        self.event_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.things.len()
    }

    pub fn is_empty(&self) -> bool {
        self.things.is_empty()
    }

    fn fire(&self, event: ThingEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

impl DeviceHost for ThingRegistry {
    fn device_added(&self, adapter_id: &str, thing: &ThingDescription) {
        let id = thing.id.clone();
        self.things.insert(
            id.clone(),
            ThingState {
                adapter_id: adapter_id.to_string(),
                thing: thing.clone(),
                last_updated: Utc::now(),
                last_event: None,
            },
        );
        self.metrics.things_added.fetch_add(1, Ordering::Relaxed);
        self.fire(ThingEvent::Added { id });
    }

    fn device_removed(&self, id: &str) {
        if self.things.remove(id).is_some() {
            self.metrics.things_removed.fetch_add(1, Ordering::Relaxed);
            self.fire(ThingEvent::Removed { id: id.to_string() });
        }
    }

    fn property_changed(&self, id: &str, name: &str, value: &Value) {
        {
            let Some(mut entry) = self.things.get_mut(id) else {
                tracing::debug!("Property change for unknown thing {}", id);
                return;
            };
            let Some(property) = entry.thing.properties.get_mut(name) else {
                tracing::debug!("Unknown property {} on thing {}", name, id);
                return;
            };
            property.value = Some(value.clone());
            entry.last_updated = Utc::now();
        }

        self.metrics.property_changes.fetch_add(1, Ordering::Relaxed);
        self.fire(ThingEvent::PropertyChanged {
            id: id.to_string(),
            name: name.to_string(),
            value: value.clone(),
        });
    }

    fn event_raised(&self, id: &str, event: &str) {
        {
            let Some(mut entry) = self.things.get_mut(id) else {
                tracing::debug!("Event for unknown thing {}", id);
                return;
            };
            let now = Utc::now();
            entry.last_event = Some(RaisedEvent { name: event.to_string(), at: now });
            entry.last_updated = now;
        }

        self.metrics.events_raised.fetch_add(1, Ordering::Relaxed);
        self.fire(ThingEvent::EventRaised { id: id.to_string(), event: event.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceDefinition};
    use serde_json::json;

    fn thing(id: &str, name: &str) -> ThingDescription {
        let def: DeviceDefinition = serde_json::from_value(json!({
            "type": "EndDevice",
            "ieee_address": id,
            "friendly_name": name,
            "definition": {"exposes": [
                {"type": "binary", "name": "occupancy", "access": 1},
                {"type": "enum", "name": "action", "access": 1, "values": ["single"]}
            ]}
        }))
        .unwrap();
        Device::from_definition("zigbee2mqtt", &def).0.description()
    }

    #[test]
    fn test_add_and_get() {
        let registry = ThingRegistry::new(16);
        registry.device_added("z2m-adapter-a", &thing("0x2", "b"));
        registry.device_added("z2m-adapter-a", &thing("0x1", "a"));

        assert_eq!(registry.len(), 2);
        let ids: Vec<String> = registry.get_all().into_iter().map(|t| t.thing.id).collect();
        assert_eq!(ids, vec!["0x1", "0x2"]);
        assert_eq!(registry.adapter_for("0x1").as_deref(), Some("z2m-adapter-a"));
        assert!(registry.get("0x3").is_none());
    }

    #[test]
    fn test_property_and_event_updates() {
        let registry = ThingRegistry::new(16);
        let mut rx = registry.subscribe();
        registry.device_added("z2m-adapter-a", &thing("0x1", "hall"));

        registry.property_changed("0x1", "occupancy", &json!(true));
        registry.event_raised("0x1", "single");
        // Unknown property and thing are ignored.
        registry.property_changed("0x1", "hue", &json!(3));
        registry.property_changed("0x9", "occupancy", &json!(true));

        let state = registry.get("0x1").unwrap();
        assert_eq!(state.thing.properties["occupancy"].value, Some(json!(true)));
        assert_eq!(state.last_event.unwrap().name, "single");

        assert_eq!(rx.try_recv().unwrap(), ThingEvent::Added { id: "0x1".into() });
        assert!(matches!(rx.try_recv().unwrap(), ThingEvent::PropertyChanged { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ThingEvent::EventRaised { .. }));
        assert!(rx.try_recv().is_err());

        assert_eq!(registry.metrics.property_changes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_remove() {
        let registry = ThingRegistry::new(16);
        registry.device_added("z2m-adapter-a", &thing("0x1", "hall"));
        registry.device_removed("0x1");
        registry.device_removed("0x1");

        assert!(registry.is_empty());
        assert_eq!(registry.metrics.things_removed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_serialized_state() {
        let registry = ThingRegistry::new(16);
        registry.device_added("z2m-adapter-a", &thing("0x1", "hall"));
        let json = serde_json::to_value(registry.get("0x1").unwrap()).unwrap();

        assert_eq!(json["adapter_id"], "z2m-adapter-a");
        assert_eq!(json["id"], "0x1");
        assert_eq!(json["title"], "hall");
        assert!(json.get("last_event").is_none());
    }
}

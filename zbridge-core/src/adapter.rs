//! zigbee2mqtt adapter: one per upstream bridge.
//!
//! The adapter owns every device the bridge announced and is the only
//! place where device state changes. It runs as a single task
//! ([`Adapter::run`]) that serially handles inbound MQTT traffic and
//! commands from the host, so its indices need no locking:
//!
//! - `<prefix>/bridge/devices` creates devices (never re-parses known ones)
//! - `<prefix>/bridge/response/*` acknowledges pairing and removal
//! - `<prefix>/<friendly_name>` updates one device
//!
//! Publishes run on their own tasks; the loop never waits on the broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{AdapterConfig, Config};
use crate::device::{Device, DeviceChange, DeviceDefinition};
use crate::error::{BridgeError, Result};
use crate::registry::DeviceHost;
use crate::router::{
    self, BridgeLog, BridgeResponse, Route, DEVICES_SUFFIX, LOGGING_SUFFIX,
    PERMIT_REQUEST_SUFFIX, PERMIT_RESPONSE_SUFFIX, REMOVE_REQUEST_SUFFIX, REMOVE_RESPONSE_SUFFIX,
};
use crate::transport::{
    spawn_event_pump, Inbound, MqttTransport, OutboundMessage, PendingPublish, Transport,
};

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub id: String,
    pub prefix: String,
    /// Raw traffic at info instead of trace.
    pub debug_logs: bool,
    /// Subscribe to `<prefix>/bridge/logging`.
    pub bridge_logging: bool,
}

impl AdapterSettings {
    pub fn from_config(config: &Config, adapter: &AdapterConfig) -> Self {
        Self {
            id: adapter.adapter_id(),
            prefix: adapter.topic_prefix.clone(),
            debug_logs: config.adapter_debug_logs,
            bridge_logging: config.zigbee2mqtt_debug_logs,
        }
    }
}

pub struct Adapter {
    settings: AdapterSettings,
    transport: Arc<dyn Transport>,
    host: Arc<dyn DeviceHost>,
    /// Authoritative set, keyed by ieee address.
    devices: HashMap<String, Device>,
    /// Routing index: friendly name -> ieee address.
    by_friendly_name: HashMap<String, String>,
}

impl Adapter {
    pub fn new(
        settings: AdapterSettings,
        transport: Arc<dyn Transport>,
        host: Arc<dyn DeviceHost>,
    ) -> Self {
        Self {
            settings,
            transport,
            host,
            devices: HashMap::new(),
            by_friendly_name: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn device_by_friendly_name(&self, name: &str) -> Option<&Device> {
        self.by_friendly_name.get(name).and_then(|id| self.devices.get(id))
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Connected => self.handle_connected(),
            Inbound::Message { topic, payload } => self.handle_message(&topic, &payload),
        }
    }

    /// Run until the inbound stream ends. Commands are served until their
    /// channel closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        tracing::info!("{}: adapter started", self.settings.id);
        let mut commands_open = true;

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.dispatch(msg),
                    None => {
                        tracing::info!("{}: inbound stream closed, stopping", self.settings.id);
                        break;
                    }
                },
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.execute(cmd),
                    None => commands_open = false,
                },
            }
        }
    }

    // ── Inbound ─────────────────────────────────────────

    fn handle_connected(&self) {
        tracing::info!("{}: connected to broker", self.settings.id);

        let prefix = &self.settings.prefix;
        let mut topics = vec![
            format!("{}{}", prefix, DEVICES_SUFFIX),
            format!("{}{}", prefix, PERMIT_RESPONSE_SUFFIX),
            format!("{}{}", prefix, REMOVE_RESPONSE_SUFFIX),
        ];
        if self.settings.bridge_logging {
            topics.push(format!("{}{}", prefix, LOGGING_SUFFIX));
        }
        topics.extend(self.devices.values().map(|d| d.topic().to_string()));

        for topic in topics {
            self.subscribe(topic);
        }
    }

    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let id = &self.settings.id;
        let body = String::from_utf8_lossy(payload);
        if self.settings.debug_logs {
            tracing::info!("{}: received on {}: {}", id, topic, body);
        } else {
            tracing::trace!("{}: received on {}: {}", id, topic, body);
        }

        if let Err(e) = self.route(topic, payload) {
            self.record(&e);
        }
    }

    fn route(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        match router::classify(topic, payload)? {
            Route::Devices(list) => self.handle_devices(&list),
            Route::PermitJoinResponse(response) => self.handle_permit_response(&response),
            Route::RemoveResponse(response) => self.handle_remove_response(&response),
            Route::Logging(log) => {
                forward_bridge_log(&log);
                Ok(())
            }
            Route::DeviceUpdate { friendly_name, payload } => {
                self.handle_device_update(&friendly_name, &payload)
            }
        }
    }

    fn handle_devices(&mut self, list: &Value) -> Result<()> {
        let Some(definitions) = list.as_array() else {
            return Err(BridgeError::Parse(format!(
                "Expected list of devices but got {}",
                json_kind(list)
            )));
        };

        for raw in definitions {
            match serde_json::from_value::<DeviceDefinition>(raw.clone()) {
                Ok(def) => self.handle_definition(def),
                Err(e) => self.record(&BridgeError::Parse(format!(
                    "Could not read device definition {}: {}",
                    raw, e
                ))),
            }
        }
        Ok(())
    }

    fn handle_definition(&mut self, def: DeviceDefinition) {
        if !def.is_bridgeable_type() {
            tracing::debug!("{}: ignoring device of type {:?}", self.settings.id, def.device_type);
            return;
        }
        if def.ieee_address.is_empty() {
            tracing::debug!("{}: ignoring device without id", self.settings.id);
            return;
        }

        if let Some(known) = self.devices.get(&def.ieee_address) {
            if !def.friendly_name.is_empty() && known.friendly_name() != def.friendly_name {
                tracing::debug!(
                    "{}: {} is now called {}, keeping {}",
                    self.settings.id,
                    def.ieee_address,
                    def.friendly_name,
                    known.friendly_name()
                );
            }
            return;
        }

        self.add_device(&def);
    }

    fn add_device(&mut self, def: &DeviceDefinition) {
        let (device, diagnostics) = Device::from_definition(&self.settings.prefix, def);
        for diagnostic in &diagnostics {
            tracing::warn!("{}: {}: {}", self.settings.id, device.friendly_name(), diagnostic);
        }

        if let Some(other) = self.by_friendly_name.get(device.friendly_name()) {
            tracing::warn!(
                "{}: friendly name {} is already used by {}, skipping {}",
                self.settings.id,
                device.friendly_name(),
                other,
                device.identity()
            );
            return;
        }

        self.host.device_added(&self.settings.id, &device.description());
        self.subscribe(device.topic().to_string());
        if let Some(refresh) = device.refresh_request() {
            self.publish(refresh);
        }

        tracing::info!(
            "{}: device added: {} ({}), {} tags",
            self.settings.id,
            device.title(),
            device.identity(),
            device.tags().len()
        );
        self.by_friendly_name
            .insert(device.friendly_name().to_string(), device.identity().to_string());
        self.devices.insert(device.identity().to_string(), device);
    }

    fn handle_permit_response(&self, response: &BridgeResponse) -> Result<()> {
        response.check().map_err(|e| {
            BridgeError::Protocol(format!(
                "Could not change permit join mode: {}",
                protocol_reason(&e)
            ))
        })?;

        if response.is_ok() {
            let id = &self.settings.id;
            if response.data.as_ref().and_then(|d| d.value).unwrap_or(false) {
                tracing::info!("{}: bridge is now permitting new devices to join", id);
            } else {
                tracing::info!("{}: bridge is no longer permitting new devices to join", id);
            }
        }
        Ok(())
    }

    fn handle_remove_response(&mut self, response: &BridgeResponse) -> Result<()> {
        let id = response.id().unwrap_or("unknown").to_string();
        response.check().map_err(|e| {
            BridgeError::Protocol(format!(
                "Could not remove device {}: {}",
                id,
                protocol_reason(&e)
            ))
        })?;
        if !response.is_ok() {
            return Ok(());
        }

        match self.remove_local(&id) {
            Some(device) => {
                tracing::info!("{}: removed {} ({})", self.settings.id, device.title(), id);
                Ok(())
            }
            None => Err(BridgeError::UnknownDevice(id)),
        }
    }

    /// Drop a device from both indices and the host in one step.
    fn remove_local(&mut self, id: &str) -> Option<Device> {
        let device = self.devices.remove(id)?;
        if self.by_friendly_name.get(device.friendly_name()).map(String::as_str) == Some(id) {
            self.by_friendly_name.remove(device.friendly_name());
        }
        self.host.device_removed(id);
        self.unsubscribe(device.topic().to_string());
        Some(device)
    }

    fn handle_device_update(&mut self, friendly_name: &str, payload: &Value) -> Result<()> {
        let id = self
            .by_friendly_name
            .get(friendly_name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownDevice(friendly_name.to_string()))?;
        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| BridgeError::UnknownDevice(id.clone()))?;

        let outcome = device.apply_update(payload);
        for change in outcome.changes {
            match change {
                DeviceChange::Property { name, value } => {
                    self.host.property_changed(&id, &name, &value)
                }
                DeviceChange::Event { name } => self.host.event_raised(&id, &name),
            }
        }
        for miss in &outcome.misses {
            self.record(miss);
        }
        Ok(())
    }

    // ── Outbound ────────────────────────────────────────

    pub fn write_property(
        &mut self,
        id: &str,
        name: &str,
        value: &Value,
    ) -> Result<PendingPublish> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownDevice(id.to_string()))?;
        let message = device.write_request(name, value)?;
        self.host.property_changed(id, name, value);
        Ok(self.publish(message))
    }

    pub fn perform_action(&self, id: &str, name: &str, input: &Value) -> Result<PendingPublish> {
        let message = self.known(id)?.action_request(name, input)?;
        Ok(self.publish(message))
    }

    /// Ask the bridge for fresh values. `None` when the device has
    /// nothing readable.
    pub fn refresh(&self, id: &str) -> Result<Option<PendingPublish>> {
        Ok(self.known(id)?.refresh_request().map(|message| self.publish(message)))
    }

    pub fn start_pairing(&self, seconds: u64) -> PendingPublish {
        tracing::info!("{}: permit joining for {} seconds", self.settings.id, seconds);
        self.publish(OutboundMessage::json(
            format!("{}{}", self.settings.prefix, PERMIT_REQUEST_SUFFIX),
            &json!({"value": true, "time": seconds}),
        ))
    }

    pub fn cancel_pairing(&self) -> PendingPublish {
        tracing::info!("{}: deny joining", self.settings.id);
        self.publish(OutboundMessage::json(
            format!("{}{}", self.settings.prefix, PERMIT_REQUEST_SUFFIX),
            &json!({"value": false}),
        ))
    }

    /// Ask the bridge to remove a device. Local state changes only once the
    /// bridge confirms.
    pub fn remove_device(&self, id: &str) -> Result<PendingPublish> {
        let device = self.known(id)?;
        tracing::info!("{}: removing {} ({})", self.settings.id, device.title(), id);
        Ok(self.publish(OutboundMessage::json(
            format!("{}{}", self.settings.prefix, REMOVE_REQUEST_SUFFIX),
            &json!({"id": id}),
        )))
    }

    fn known(&self, id: &str) -> Result<&Device> {
        self.devices
            .get(id)
            .ok_or_else(|| BridgeError::UnknownDevice(id.to_string()))
    }

    fn publish(&self, message: OutboundMessage) -> PendingPublish {
        let id = &self.settings.id;
        if self.settings.debug_logs {
            tracing::info!("{}: sending {} to {}", id, message.payload, message.topic);
        } else {
            tracing::trace!("{}: sending {} to {}", id, message.payload, message.topic);
        }
        PendingPublish::spawn(self.transport.clone(), message)
    }

    fn subscribe(&self, topic: String) {
        let transport = self.transport.clone();
        let id = self.settings.id.clone();
        tokio::spawn(async move {
            match transport.subscribe(&topic).await {
                Ok(()) => tracing::debug!("{}: subscribed to {}", id, topic),
                Err(e) => tracing::warn!("{}: could not subscribe to {}: {}", id, topic, e),
            }
        });
    }

    fn unsubscribe(&self, topic: String) {
        let transport = self.transport.clone();
        let id = self.settings.id.clone();
        tokio::spawn(async move {
            match transport.unsubscribe(&topic).await {
                Ok(()) => tracing::debug!("{}: unsubscribed from {}", id, topic),
                Err(e) => tracing::warn!("{}: could not unsubscribe from {}: {}", id, topic, e),
            }
        });
    }

    fn record(&self, error: &BridgeError) {
        if error.is_routing_miss() {
            tracing::debug!("{}: {}", self.settings.id, error);
        } else {
            tracing::warn!("{}: {}", self.settings.id, error);
        }
    }

    // ── Commands ────────────────────────────────────────

    fn execute(&mut self, command: Command) {
        match command {
            Command::WriteProperty { id, name, value, reply } => {
                let _ = reply.send(self.write_property(&id, &name, &value));
            }
            Command::PerformAction { id, name, input, reply } => {
                let _ = reply.send(self.perform_action(&id, &name, &input));
            }
            Command::Refresh { id, reply } => {
                let _ = reply.send(self.refresh(&id));
            }
            Command::StartPairing { seconds, reply } => {
                let _ = reply.send(Ok(self.start_pairing(seconds)));
            }
            Command::CancelPairing { reply } => {
                let _ = reply.send(Ok(self.cancel_pairing()));
            }
            Command::RemoveDevice { id, reply } => {
                let _ = reply.send(self.remove_device(&id));
            }
        }
    }
}

fn protocol_reason(error: &BridgeError) -> String {
    match error {
        BridgeError::Protocol(reason) => reason.clone(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Re-emit a bridge log line under the `zigbee2mqtt` target.
fn forward_bridge_log(log: &BridgeLog) {
    match log.level.as_str() {
        "error" => tracing::error!(target: "zigbee2mqtt", "{}", log.message),
        "warning" | "warn" => tracing::warn!(target: "zigbee2mqtt", "{}", log.message),
        "info" => tracing::info!(target: "zigbee2mqtt", "{}", log.message),
        _ => tracing::debug!(target: "zigbee2mqtt", "{}", log.message),
    }
}

// ── Handle ──────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T>>;

pub enum Command {
    WriteProperty { id: String, name: String, value: Value, reply: Reply<PendingPublish> },
    PerformAction { id: String, name: String, input: Value, reply: Reply<PendingPublish> },
    Refresh { id: String, reply: Reply<Option<PendingPublish>> },
    StartPairing { seconds: u64, reply: Reply<PendingPublish> },
    CancelPairing { reply: Reply<PendingPublish> },
    RemoveDevice { id: String, reply: Reply<PendingPublish> },
}

/// Cloneable handle to a running adapter.
#[derive(Clone)]
pub struct AdapterHandle {
    id: String,
    tx: mpsc::Sender<Command>,
}

impl AdapterHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| BridgeError::AdapterStopped)?;
        rx.await.map_err(|_| BridgeError::AdapterStopped)?
    }

    pub async fn write_property(
        &self,
        id: &str,
        name: &str,
        value: Value,
    ) -> Result<PendingPublish> {
        self.request(|reply| Command::WriteProperty {
            id: id.to_string(),
            name: name.to_string(),
            value,
            reply,
        })
        .await
    }

    pub async fn perform_action(
        &self,
        id: &str,
        name: &str,
        input: Value,
    ) -> Result<PendingPublish> {
        self.request(|reply| Command::PerformAction {
            id: id.to_string(),
            name: name.to_string(),
            input,
            reply,
        })
        .await
    }

    pub async fn refresh(&self, id: &str) -> Result<Option<PendingPublish>> {
        self.request(|reply| Command::Refresh { id: id.to_string(), reply }).await
    }

    pub async fn start_pairing(&self, seconds: u64) -> Result<PendingPublish> {
        self.request(|reply| Command::StartPairing { seconds, reply }).await
    }

    pub async fn cancel_pairing(&self) -> Result<PendingPublish> {
        self.request(|reply| Command::CancelPairing { reply }).await
    }

    pub async fn remove_device(&self, id: &str) -> Result<PendingPublish> {
        self.request(|reply| Command::RemoveDevice { id: id.to_string(), reply }).await
    }
}

/// Run `adapter` on its own task, fed by `inbound`.
pub fn spawn(
    adapter: Adapter,
    inbound: mpsc::Receiver<Inbound>,
) -> (AdapterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = AdapterHandle { id: adapter.settings.id.clone(), tx };
    let task = tokio::spawn(adapter.run(inbound, rx));
    (handle, task)
}

/// Connect to one bridge over MQTT and start its adapter.
pub fn start(config: &Config, adapter: &AdapterConfig, host: Arc<dyn DeviceHost>) -> AdapterHandle {
    tracing::info!("Connecting to broker mqtt://{}:{}", adapter.host, adapter.port);

    let (transport, eventloop) = MqttTransport::connect(adapter);
    let (tx, rx) = mpsc::channel(256);
    spawn_event_pump(eventloop, tx, Duration::from_millis(adapter.reconnect_delay_ms));

    let settings = AdapterSettings::from_config(config, adapter);
    let (handle, _task) = spawn(Adapter::new(settings, Arc::new(transport), host), rx);
    handle
}

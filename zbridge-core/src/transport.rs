//! MQTT transport boundary.
//!
//! The core only needs `publish(topic, payload)`, `subscribe(topic)` and
//! `unsubscribe(topic)` on the way out, and a serial stream of [`Inbound`]
//! items on the way in.
//! [`MqttTransport`] implements that over rumqttc; tests swap in a
//! recording double.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::AdapterConfig;
use crate::error::{BridgeError, Result};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
}

impl OutboundMessage {
    pub fn json(topic: impl Into<String>, body: &Value) -> Self {
        Self {
            topic: topic.into(),
            payload: body.to_string(),
        }
    }
}

/// Items delivered by the event pump, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The broker accepted a (re)connection.
    Connected,
    Message { topic: String, payload: Vec<u8> },
}

// ── Publish results ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Pending,
    Acked,
    Failed(String),
}

/// Handle to a publish running in the background.
///
/// The publish is started on construction; callers either poll
/// [`outcome`](Self::outcome) or await [`wait`](Self::wait).
pub struct PendingPublish {
    rx: oneshot::Receiver<Result<()>>,
    settled: Option<Result<()>>,
}

impl PendingPublish {
    pub fn spawn(transport: Arc<dyn Transport>, message: OutboundMessage) -> Self {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = transport.publish(&message.topic, message.payload.clone()).await;
            if let Err(e) = &result {
                tracing::warn!("Could not send {} to {}: {}", message.payload, message.topic, e);
            }
            let _ = tx.send(result);
        });
        Self { rx, settled: None }
    }

    pub fn outcome(&mut self) -> PublishOutcome {
        if self.settled.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.settled = Some(result),
                Err(oneshot::error::TryRecvError::Empty) => return PublishOutcome::Pending,
                Err(oneshot::error::TryRecvError::Closed) => self.settled = Some(Err(task_lost())),
            }
        }
        match &self.settled {
            Some(Ok(())) => PublishOutcome::Acked,
            Some(Err(e)) => PublishOutcome::Failed(e.to_string()),
            None => PublishOutcome::Pending,
        }
    }

    /// Wait for the transport's verdict. Without a timeout this waits as
    /// long as the transport does.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<()> {
        if let Some(result) = self.settled {
            return result;
        }
        let rx = self.rx;
        let verdict = async move { rx.await.unwrap_or_else(|_| Err(task_lost())) };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, verdict)
                .await
                .map_err(|_| BridgeError::Timeout)?,
            None => verdict.await,
        }
    }
}

fn task_lost() -> BridgeError {
    BridgeError::Transport("publish task ended without a result".to_string())
}

// ── rumqttc implementation ──────────────────────────────

pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Build a client for one bridge. Nothing is sent until the returned
    /// event loop is polled.
    pub fn connect(config: &AdapterConfig) -> (Self, EventLoop) {
        let client_id = format!("zbridge-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        (Self { client }, eventloop)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}

/// Drive the rumqttc event loop, forwarding connections and publishes.
/// Stops when the receiving side is dropped.
pub fn spawn_event_pump(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<Inbound>,
    reconnect_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let inbound = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => Inbound::Connected,
                Ok(Event::Incoming(Packet::Publish(publish))) => Inbound::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                },
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(
                        "MQTT connection error, retrying in {:?}: {}",
                        reconnect_delay,
                        e
                    );
                    tokio::time::sleep(reconnect_delay).await;
                    continue;
                }
            };

            if tx.send(inbound).await.is_err() {
                tracing::debug!("Inbound receiver dropped, stopping MQTT event loop");
                break;
            }
        }
    })
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records everything sent through it. Publishes fail while
    /// `fail_publishes(true)` is in effect.
    #[derive(Default)]
    pub struct RecordingTransport {
        published: Mutex<Vec<OutboundMessage>>,
        subscribed: Mutex<Vec<String>>,
        unsubscribed: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn fail_publishes(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn published(&self) -> Vec<(String, Value)> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|m| (m.topic.clone(), serde_json::from_str(&m.payload).unwrap()))
                .collect()
        }

        pub fn subscribed(&self) -> Vec<String> {
            self.subscribed.lock().unwrap().clone()
        }

        pub fn unsubscribed(&self) -> Vec<String> {
            self.unsubscribed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn publish(&self, topic: &str, payload: String) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::Transport("broker unavailable".to_string()));
            }
            self.published.lock().unwrap().push(OutboundMessage {
                topic: topic.to_string(),
                payload,
            });
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<()> {
            self.subscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<()> {
            self.unsubscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }
    }

    /// Accepts publishes and never completes them.
    pub struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn publish(&self, _topic: &str, _payload: String) -> Result<()> {
            std::future::pending().await
        }

        async fn subscribe(&self, _topic: &str) -> Result<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingTransport, StalledTransport};
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_json() {
        let msg = OutboundMessage::json("zigbee2mqtt/lamp/set", &json!({"state": "ON"}));
        assert_eq!(msg.topic, "zigbee2mqtt/lamp/set");
        assert_eq!(msg.payload, r#"{"state":"ON"}"#);
    }

    #[tokio::test]
    async fn test_publish_acked() {
        let transport = RecordingTransport::new();
        let pending = PendingPublish::spawn(
            transport.clone(),
            OutboundMessage::json("zigbee2mqtt/lamp/set", &json!({"state": "ON"})),
        );

        assert!(pending.wait(None).await.is_ok());
        assert_eq!(
            transport.published(),
            vec![("zigbee2mqtt/lamp/set".to_string(), json!({"state": "ON"}))]
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let transport = RecordingTransport::new();
        transport.fail_publishes(true);
        let mut pending = PendingPublish::spawn(
            transport.clone(),
            OutboundMessage::json("zigbee2mqtt/lamp/set", &json!({"state": "ON"})),
        );

        for _ in 0..10 {
            if pending.outcome() != PublishOutcome::Pending {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(pending.outcome(), PublishOutcome::Failed(_)));
        assert!(matches!(pending.wait(None).await, Err(BridgeError::Transport(_))));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_wait_times_out_only_when_asked() {
        let mut pending = PendingPublish::spawn(
            Arc::new(StalledTransport),
            OutboundMessage::json("zigbee2mqtt/lamp/get", &json!({"state": ""})),
        );
        tokio::task::yield_now().await;
        assert_eq!(pending.outcome(), PublishOutcome::Pending);

        let result = pending.wait(Some(Duration::from_millis(20))).await;
        assert_eq!(result, Err(BridgeError::Timeout));
    }
}

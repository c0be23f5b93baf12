//! Error taxonomy for the bridge core.
//!
//! Nothing here is fatal. Parse and routing errors are recorded and the
//! offending message is dropped; transport errors reject only the
//! operation that triggered them.

/// Errors produced by parsing, routing, and outbound operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// Malformed JSON, a non-array device list, or a payload of the wrong shape.
    #[error("Parse error: {0}")]
    Parse(String),

    /// No device is indexed under this friendly name or identity.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Property '{name}' does not exist on {device}")]
    UnknownCapability { device: String, name: String },

    #[error("Event '{event}' does not exist on {device}")]
    UnknownEvent { device: String, event: String },

    /// The transport reported a publish or subscribe failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The bridge answered a control request with an `error` field.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A write request violates the capability's declared metadata.
    #[error("Invalid value: {0}")]
    Validation(String),

    #[error("Timed out waiting for publish acknowledgment")]
    Timeout,

    #[error("Adapter is not running")]
    AdapterStopped,
}

impl BridgeError {
    /// Routing misses are expected during normal operation (devices the
    /// bridge knows about but we skipped, chatty telemetry keys) and are
    /// only worth a debug line.
    pub fn is_routing_miss(&self) -> bool {
        matches!(
            self,
            BridgeError::UnknownDevice(_)
                | BridgeError::UnknownCapability { .. }
                | BridgeError::UnknownEvent { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_miss_classification() {
        assert!(BridgeError::UnknownDevice("lamp".into()).is_routing_miss());
        assert!(BridgeError::UnknownEvent {
            device: "button".into(),
            event: "triple".into(),
        }
        .is_routing_miss());
        assert!(!BridgeError::Parse("bad".into()).is_routing_miss());
        assert!(!BridgeError::Transport("closed".into()).is_routing_miss());
    }

    #[test]
    fn test_display() {
        let err = BridgeError::UnknownCapability {
            device: "lamp (0x1)".into(),
            name: "hue".into(),
        };
        assert_eq!(err.to_string(), "Property 'hue' does not exist on lamp (0x1)");
    }
}

//! Process configuration.
//!
//! Read from a YAML file (`ZBRIDGE_CONFIG`, default `zbridge.yaml`). A
//! missing file is not an error: the bridge starts with defaults and no
//! adapters. `ZBRIDGE_HTTP_PORT` overrides the file's `http_port`.

use std::path::Path;

use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "zbridge.yaml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Log raw inbound and outbound traffic at info instead of trace.
    #[serde(default)]
    pub adapter_debug_logs: bool,
    /// Subscribe to and forward the bridge's own log stream.
    #[serde(default)]
    pub zigbee2mqtt_debug_logs: bool,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

/// One upstream zigbee2mqtt bridge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdapterConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_http_port() -> u16 {
    8125
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "zigbee2mqtt".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            adapter_debug_logs: false,
            zigbee2mqtt_debug_logs: false,
            adapters: Vec::new(),
        }
    }
}

impl AdapterConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }

    /// Stable id of the adapter serving this bridge.
    pub fn adapter_id(&self) -> String {
        format!("z2m-adapter-{}:{}:{}", self.host, self.port, self.topic_prefix)
    }
}

/// Load the configuration file at `path`, then apply env overrides.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        tracing::info!(
            "Loaded config from {} ({} adapters)",
            path.display(),
            config.adapters.len()
        );
        config
    } else {
        tracing::info!("No config file at {}, using defaults", path.display());
        Config::default()
    };

    if let Some(port) = std::env::var("ZBRIDGE_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
    {
        config.http_port = port;
    }

    Ok(config)
}

/// Config path from `ZBRIDGE_CONFIG`, or the default.
pub fn config_path() -> String {
    std::env::var("ZBRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_applied() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "adapters:\n  - host: broker.local").unwrap();

        let config = load(file.path()).unwrap();
        assert!(!config.adapter_debug_logs);
        assert_eq!(config.adapters.len(), 1);

        let adapter = &config.adapters[0];
        assert_eq!(adapter.port, 1883);
        assert_eq!(adapter.topic_prefix, "zigbee2mqtt");
        assert_eq!(adapter.keep_alive_secs, 60);
        assert_eq!(adapter.username, None);
        assert_eq!(adapter.adapter_id(), "z2m-adapter-broker.local:1883:zigbee2mqtt");
    }

    #[test]
    fn test_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
http_port: 9000
adapter_debug_logs: true
zigbee2mqtt_debug_logs: true
adapters:
  - host: 10.0.0.2
    port: 1884
    username: bridge
    password: secret
    topic_prefix: z2m-garage
"#
        )
        .unwrap();

        let config = load(file.path()).unwrap();
        assert!(config.adapter_debug_logs);
        assert!(config.zigbee2mqtt_debug_logs);
        let adapter = &config.adapters[0];
        assert_eq!(adapter.username.as_deref(), Some("bridge"));
        assert_eq!(adapter.adapter_id(), "z2m-adapter-10.0.0.2:1884:z2m-garage");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.yaml")).unwrap();
        assert!(config.adapters.is_empty());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "adapters: [{{port: 1883}}]").unwrap();
        assert!(load(file.path()).is_err());
    }
}

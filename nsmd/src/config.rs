use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::registry::MediumClass;

const DEFAULT_CONFIG_PATH: &str = "/etc/nsmd/nsmd.toml";
const ENV_CONFIG_PATH: &str = "NSMD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

impl Config {
    /// Load configuration from file. The path can be overridden with
    /// the `NSMD_CONFIG` environment variable. If the file is missing
    /// or fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match fs::read_to_string(PathBuf::from(path)) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// Load from an explicit path; unlike `load`, a broken file is a
    /// hard error here because the operator asked for it by name.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Unix socket of the MCTP demux daemon.
    #[serde(default = "default_socket_path")]
    pub socket: String,
    /// Socket path this daemon binds for replies and events.
    #[serde(default = "default_local_socket_path")]
    pub local_socket: String,
    /// Our own endpoint id, named as the event receiver in
    /// subscriptions.
    #[serde(default = "default_local_eid")]
    pub local_eid: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket: default_socket_path(),
            local_socket: default_local_socket_path(),
            local_eid: default_local_eid(),
        }
    }
}

fn default_socket_path() -> String {
    "/run/mctp-demux.sock".to_string()
}
fn default_local_socket_path() -> String {
    "/run/nsmd.sock".to_string()
}
fn default_local_eid() -> u8 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,
    #[serde(default = "default_tick_min_ms")]
    pub tick_min_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_long_running_timeout_ms")]
    pub long_running_timeout_ms: u64,
    #[serde(default = "default_offline_ping_ms")]
    pub offline_ping_ms: u64,
    #[serde(default = "default_decode_error_window_ms")]
    pub decode_error_window_ms: u64,
}

impl PollingConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }
    pub fn tick_min(&self) -> Duration {
        Duration::from_millis(self.tick_min_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn long_running_timeout(&self) -> Duration {
        Duration::from_millis(self.long_running_timeout_ms)
    }
    pub fn offline_ping(&self) -> Duration {
        Duration::from_millis(self.offline_ping_ms)
    }
    pub fn decode_error_window(&self) -> Duration {
        Duration::from_millis(self.decode_error_window_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_interval_ms(),
            tick_min_ms: default_tick_min_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            long_running_timeout_ms: default_long_running_timeout_ms(),
            offline_ping_ms: default_offline_ping_ms(),
            decode_error_window_ms: default_decode_error_window_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    500
}
fn default_tick_min_ms() -> u64 {
    10
}
fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_long_running_timeout_ms() -> u64 {
    120_000
}
fn default_offline_ping_ms() -> u64 {
    1000
}
fn default_decode_error_window_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Global event generation setting pushed to every endpoint:
    /// "disabled", "poll" or "push".
    #[serde(default = "default_event_generation")]
    pub event_generation: String,
    /// Event ids enabled in the subscription mask.
    #[serde(default = "default_event_sources")]
    pub event_sources: Vec<u8>,
}

impl DiscoveryConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            event_generation: default_event_generation(),
            event_sources: default_event_sources(),
        }
    }
}

fn default_backoff_initial_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}
fn default_event_generation() -> String {
    "push".to_string()
}
fn default_event_sources() -> Vec<u8> {
    vec![
        nsm_wire::capability::REDISCOVERY_EVENT_ID,
        nsm_wire::capability::LONG_RUNNING_EVENT_ID,
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Optional NDJSON file every published reading is appended to.
    #[serde(default)]
    pub readings_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub eid: u8,
    pub uuid: Uuid,
    #[serde(default = "default_medium")]
    pub medium: MediumClass,
}

fn default_medium() -> MediumClass {
    MediumClass::Pcie
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    pub name: String,
    /// Constructor key: "temperature", "power", "energy",
    /// "inventory", "power_cap", "presence_power", "port_bandwidth".
    pub kind: String,
    pub uuid: Uuid,
    #[serde(default)]
    pub priority: bool,
    /// Member of the per-command aggregate instead of polling alone.
    #[serde(default)]
    pub aggregate: bool,
    #[serde(default)]
    pub sensor_id: u8,
    #[serde(default)]
    pub averaging_interval: u8,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub long_running: bool,
    /// Inventory property name for kind = "inventory".
    #[serde(default)]
    pub property: Option<String>,
    /// Requested limit for kind = "power_cap".
    #[serde(default)]
    pub power_limit_watts: Option<f64>,
    #[serde(default)]
    pub port_id: u8,
    /// Output binding.
    pub object_path: String,
    #[serde(default = "default_object_property")]
    pub object_property: String,
}

fn default_object_property() -> String {
    "Value".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[transport]
socket = "/run/mctp-demux.sock"
local_eid = 8
[polling]
default_interval_ms = 500
request_timeout_ms = 2000
[discovery]
backoff_initial_ms = 1000
backoff_cap_ms = 60000

[[endpoints]]
eid = 30
uuid = "c0fef542-1e25-47ea-b46c-3e1f3a0a3a2a"
medium = "pcie"

[[sensors]]
name = "gpu0_temp"
kind = "temperature"
uuid = "c0fef542-1e25-47ea-b46c-3e1f3a0a3a2a"
sensor_id = 2
object_path = "/inventory/gpu0/temp"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.transport.local_eid, 8);
        assert_eq!(cfg.transport.socket, "/run/mctp-demux.sock");
        assert_eq!(cfg.polling.default_interval_ms, 500);
        assert_eq!(cfg.polling.tick_min_ms, 10);
        assert_eq!(cfg.polling.request_timeout_ms, 2000);
        assert_eq!(cfg.polling.long_running_timeout_ms, 120_000);
        assert_eq!(cfg.discovery.backoff_cap_ms, 60_000);
        assert_eq!(cfg.discovery.event_generation, "push");
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.endpoints[0].eid, 30);
        assert_eq!(cfg.endpoints[0].medium, MediumClass::Pcie);
        assert_eq!(cfg.sensors.len(), 1);
        let sensor = &cfg.sensors[0];
        assert_eq!(sensor.kind, "temperature");
        assert_eq!(sensor.sensor_id, 2);
        assert!(!sensor.priority);
        assert!(!sensor.aggregate);
        assert_eq!(sensor.object_property, "Value");
        assert!(sensor.interval_ms.is_none());
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nlocal_eid = 12").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.transport.local_eid, 12);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn load_from_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not toml at all [").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }
}

//! Daemon configuration.
//!
//! Loaded from a single YAML file merging user-facing settings (broker
//! credentials, per-feature metadata, covers) with defaults. The
//! hardware-definition format lives in [`crate::registry::hardware`] —
//! malformed input surfaces as [`UnipiError::ConfigInvalid`], which is
//! fatal at startup.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::UnipiError;

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keepalive_secs() -> u64 {
    15
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_retry_limit() -> u32 {
    10
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_scan_interval_ms() -> u64 {
    200
}

fn default_scan_interval_serial_ms() -> u64 {
    500
}

fn default_scan_interval_degraded_ms() -> u64 {
    5000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_cover_run_time() -> f64 {
    30.0
}

/// Root daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device name used as the MQTT topic prefix; defaults to the host's
    /// hostname when absent.
    #[serde(default)]
    pub device_name: Option<String>,

    pub mqtt: MqttConfig,

    #[serde(default)]
    pub modbus: ModbusConfig,

    #[serde(default)]
    pub features: Vec<FeatureConfig>,

    #[serde(default)]
    pub covers: Vec<CoverConfig>,

    #[serde(default)]
    pub homeassistant: HomeAssistantConfig,

    #[serde(default)]
    pub advanced: AdvancedConfig,
}

impl Config {
    /// Load and parse a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, UnipiError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            UnipiError::ConfigInvalid(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, UnipiError> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|e| UnipiError::ConfigInvalid(format!("invalid config yaml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), UnipiError> {
        for cover in &self.covers {
            if cover.cover_up_circuit == cover.cover_down_circuit {
                return Err(UnipiError::ConfigInvalid(format!(
                    "cover '{}' has identical up/down circuits",
                    cover.id
                )));
            }
            if cover.device_class != CoverDeviceClass::Blind && cover.tilt_change_time.is_some() {
                return Err(UnipiError::ConfigInvalid(format!(
                    "cover '{}' sets tilt_change_time but is not a blind",
                    cover.id
                )));
            }
        }
        Ok(())
    }

    /// Resolve the effective device name, falling back to the host's
    /// hostname when none was configured.
    pub fn device_name(&self) -> String {
        self.device_name.clone().unwrap_or_else(|| {
            nix::unistd::gethostname()
                .ok()
                .and_then(|n| n.into_string().ok())
                .unwrap_or_else(|| "unipi".to_string())
        })
    }

    /// Base directory for cover persistence files, per `advanced.persistent_tmp_dir`.
    pub fn persistence_dir(&self) -> &'static str {
        if self.advanced.persistent_tmp_dir {
            "/var/tmp/unipi"
        } else {
            "/tmp/unipi"
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModbusConfig {
    #[serde(default)]
    pub tcp: Option<TcpUnitConfig>,

    #[serde(default)]
    pub serial: Vec<SerialUnitConfig>,

    /// Path to the hardware-definition YAML file for the Neuron/Patron
    /// model in use (register blocks + feature layout).
    pub hardware_definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpUnitConfig {
    pub transport_id: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialUnitConfig {
    pub transport_id: String,
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: SerialParity,
    pub unit_id: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

/// User-provided metadata overlay for a single feature, keyed by circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub circuit: String,

    #[serde(default)]
    pub friendly_name: Option<String>,

    #[serde(default)]
    pub device_class: Option<String>,

    #[serde(default)]
    pub state_class: Option<String>,

    #[serde(default)]
    pub unit_of_measurement: Option<String>,

    #[serde(default)]
    pub suggested_area: Option<String>,

    #[serde(default)]
    pub icon: Option<String>,

    #[serde(default)]
    pub invert_state: bool,

    #[serde(default)]
    pub object_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverDeviceClass {
    Blind,
    Shutter,
    Garage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverConfig {
    pub id: String,
    pub device_class: CoverDeviceClass,

    #[serde(default = "default_cover_run_time")]
    pub cover_run_time: f64,

    #[serde(default)]
    pub tilt_change_time: Option<f64>,

    pub cover_up_circuit: String,
    pub cover_down_circuit: String,

    #[serde(default)]
    pub object_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery_prefix: default_discovery_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    #[serde(default)]
    pub persistent_tmp_dir: bool,

    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    #[serde(default = "default_scan_interval_serial_ms")]
    pub scan_interval_serial_ms: u64,

    #[serde(default = "default_scan_interval_degraded_ms")]
    pub scan_interval_degraded_ms: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            persistent_tmp_dir: false,
            scan_interval_ms: default_scan_interval_ms(),
            scan_interval_serial_ms: default_scan_interval_serial_ms(),
            scan_interval_degraded_ms: default_scan_interval_degraded_ms(),
        }
    }
}

/// Per-feature metadata lookup, built once at startup.
pub type FeatureConfigMap = HashMap<String, FeatureConfig>;

pub fn index_feature_configs(configs: &[FeatureConfig]) -> FeatureConfigMap {
    configs
        .iter()
        .map(|c| (c.circuit.clone(), c.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_cover_with_matching_relays() {
        let yaml = r#"
mqtt:
  host: localhost
modbus:
  hardware_definition: hw.yaml
covers:
  - id: blind_1
    device_class: blind
    cover_up_circuit: ro_2_01
    cover_down_circuit: ro_2_01
"#;
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, UnipiError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_tilt_time_on_non_blind() {
        let yaml = r#"
mqtt:
  host: localhost
modbus:
  hardware_definition: hw.yaml
covers:
  - id: shutter_1
    device_class: shutter
    tilt_change_time: 1.5
    cover_up_circuit: ro_2_01
    cover_down_circuit: ro_2_02
"#;
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, UnipiError::ConfigInvalid(_)));
    }

    #[test]
    fn defaults_apply() {
        let yaml = r#"
mqtt:
  host: localhost
modbus:
  hardware_definition: hw.yaml
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.advanced.scan_interval_ms, 200);
        assert_eq!(config.persistence_dir(), "/tmp/unipi");
    }
}

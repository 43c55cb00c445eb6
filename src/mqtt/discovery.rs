//! Home Assistant MQTT discovery (base spec §4.H): one retained JSON
//! document per feature and per cover, published on every successful
//! connect when `homeassistant.enabled`.

use serde_json::{json, Value};

use crate::config::{Config, CoverDeviceClass};
use crate::registry::{Feature, FeatureKind, FeatureRegistry};

use super::topics;

fn cover_device_class_str(class: CoverDeviceClass) -> &'static str {
    match class {
        CoverDeviceClass::Blind => "blind",
        CoverDeviceClass::Shutter => "shutter",
        CoverDeviceClass::Garage => "garage",
    }
}

/// Builds `(topic, payload)` pairs for every discoverable feature and
/// cover. Stateless — callers publish each pair retained, QoS 1.
pub struct DiscoveryEmitter<'a> {
    config: &'a Config,
    registry: &'a FeatureRegistry,
    device_name: String,
}

impl<'a> DiscoveryEmitter<'a> {
    pub fn new(config: &'a Config, registry: &'a FeatureRegistry, device_name: String) -> Self {
        Self { config, registry, device_name }
    }

    pub fn documents(&self) -> Vec<(String, Value)> {
        let mut docs = Vec::new();
        let device = json!({
            "identifiers": [self.device_name.clone()],
            "name": self.device_name.clone(),
            "manufacturer": "Unipi Technology",
        });

        for feature in self.registry.iter() {
            let Some((component, state_topic)) = self.component_and_state_topic(feature) else {
                continue;
            };
            let object_id = feature.meta.object_id.clone().unwrap_or_else(|| feature.circuit.clone());

            let mut payload = json!({
                "name": feature.meta.friendly_name.clone().unwrap_or_else(|| feature.id.clone()),
                "unique_id": format!("{}_{}", self.device_name, feature.id),
                "state_topic": state_topic,
                "availability_topic": topics::availability_topic(&self.device_name),
                "device": device.clone(),
            });
            if let Some(set_topic) = topics::feature_set_topic(&self.device_name, feature) {
                payload["command_topic"] = json!(set_topic);
            }
            if let Some(dc) = &feature.meta.device_class {
                payload["device_class"] = json!(dc);
            }
            if let Some(sc) = &feature.meta.state_class {
                payload["state_class"] = json!(sc);
            }
            if let Some(u) = &feature.meta.unit_of_measurement {
                payload["unit_of_measurement"] = json!(u);
            }
            if let Some(area) = &feature.meta.suggested_area {
                payload["suggested_area"] = json!(area);
            }
            if let Some(icon) = &feature.meta.icon {
                payload["icon"] = json!(icon);
            }

            let topic = format!(
                "{}/{}/{}/{}/config",
                self.config.homeassistant.discovery_prefix, component, self.device_name, object_id
            );
            docs.push((topic, payload));
        }

        for cover in &self.config.covers {
            let object_id = cover.object_id.clone().unwrap_or_else(|| cover.id.clone());
            let class = cover.device_class;
            let payload = json!({
                "name": cover.object_id.clone().unwrap_or_else(|| cover.id.clone()),
                "unique_id": format!("{}_{}", self.device_name, cover.id),
                "device_class": cover_device_class_str(class),
                "state_topic": topics::cover_state_topic(&self.device_name, &object_id, class),
                "command_topic": topics::cover_set_topic(&self.device_name, &object_id, class),
                "position_topic": topics::cover_position_topic(&self.device_name, &object_id, class),
                "set_position_topic": topics::cover_position_set_topic(&self.device_name, &object_id, class),
                "tilt_status_topic": topics::cover_tilt_topic(&self.device_name, &object_id, class),
                "tilt_command_topic": topics::cover_tilt_set_topic(&self.device_name, &object_id, class),
                "availability_topic": topics::availability_topic(&self.device_name),
                "device": device.clone(),
            });

            let topic = format!(
                "{}/cover/{}/{}/config",
                self.config.homeassistant.discovery_prefix, self.device_name, object_id
            );
            docs.push((topic, payload));
        }

        docs
    }

    /// HA component family plus the feature's retained state topic, or
    /// `None` for kinds HA has no natural discovery component for
    /// (analog outputs have no simple read-back sensor/switch mapping).
    fn component_and_state_topic(&self, feature: &Feature) -> Option<(&'static str, String)> {
        let topic = topics::feature_get_topic(&self.device_name, feature)?;
        let component = match &feature.kind {
            FeatureKind::RelayOutput { .. } | FeatureKind::DigitalOutput { .. } => "switch",
            FeatureKind::DigitalInput { .. } => "binary_sensor",
            FeatureKind::MeterField { .. } | FeatureKind::AnalogInput { .. } => "sensor",
            FeatureKind::AnalogOutput { .. } => return None,
        };
        Some((component, topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureConfigMap, HomeAssistantConfig, MqttConfig, ModbusConfig, AdvancedConfig};
    use crate::registry::hardware::{AccessMode, FeatureDef, FeatureKindDef, HardwareDefinition, RegisterBlockDef, UnitDef};

    fn sample_config() -> Config {
        Config {
            device_name: Some("unipi".to_string()),
            mqtt: MqttConfig {
                host: "localhost".to_string(),
                port: 1883,
                user: None,
                password: None,
                client_id: None,
                keepalive_secs: 15,
                reconnect_interval_secs: 5,
                retry_limit: 10,
            },
            modbus: ModbusConfig::default(),
            features: vec![],
            covers: vec![],
            homeassistant: HomeAssistantConfig { enabled: true, discovery_prefix: "homeassistant".to_string() },
            advanced: AdvancedConfig::default(),
        }
    }

    #[test]
    fn emits_switch_document_for_relay() {
        let config = sample_config();
        let hw = HardwareDefinition {
            model: "test".to_string(),
            units: vec![UnitDef {
                transport_id: "neuron".to_string(),
                unit_id: 0,
                blocks: vec![RegisterBlockDef { start: 0, count: 1, access: AccessMode::ReadWrite }],
            }],
            features: vec![FeatureDef {
                id: "ro_2_01".to_string(),
                circuit: "ro_2_01".to_string(),
                transport_id: "neuron".to_string(),
                unit_id: 0,
                kind: FeatureKindDef::RelayOutput { address: 0, bit: 0, is_coil: true },
            }],
        };
        let registry = FeatureRegistry::new(&hw, &FeatureConfigMap::new()).unwrap();
        let emitter = DiscoveryEmitter::new(&config, &registry, "unipi".to_string());
        let docs = emitter.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, "homeassistant/switch/unipi/ro_2_01/config");
        assert_eq!(docs[0].1["state_topic"], "unipi/relay/ro_2_01/get");
    }
}

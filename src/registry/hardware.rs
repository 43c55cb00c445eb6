//! Hardware-definition file schema.
//!
//! One YAML document per Unipi model (e.g. the Neuron S103 or the Eastron
//! SDM120M serial meter), describing the Modbus register blocks and the
//! feature layout bound to them. This crate only needs the shape required
//! to build [`crate::registry::FeatureRegistry`] — it does not replicate
//! every upstream validation rule.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::UnipiError;

/// `<type>_<group>_<channel>` circuit identifiers (base spec §6, GLOSSARY),
/// e.g. `ro_3_02` — relay output, slot 3, channel 2. Only digital/relay
/// circuits follow this grammar; meter fields and user-chosen cover ids do
/// not and are not checked against it.
static CIRCUIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:di|do|ro)_[1-9]_[0-9]{2}$").expect("static regex is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBlockDef {
    pub start: u16,
    pub count: u16,
    pub access: AccessMode,
}

/// Byte order for multi-register (32-bit) values. Eastron energy meters
/// are known to disagree on word order between firmware revisions, so
/// this is an explicit per-register schema field rather than a single
/// global guess applied at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
    /// Big-endian words, but the two 16-bit words are swapped (common on
    /// Eastron energy meters).
    BigEndianWordSwap,
    LittleEndianWordSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalogCodec {
    /// Single `u16` register, optionally scaled.
    Raw,
    /// Two consecutive `u16` registers assembled into an IEEE-754 `f32`.
    Float32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKindDef {
    DigitalInput {
        address: u16,
        bit: u8,
    },
    DigitalOutput {
        address: u16,
        bit: u8,
        /// True if this bit is addressable as a Modbus coil (function code
        /// 5); false means it is packed into a multi-bit holding register
        /// and must be written whole via function code 6.
        is_coil: bool,
    },
    RelayOutput {
        address: u16,
        bit: u8,
        is_coil: bool,
    },
    AnalogInput {
        address: u16,
        codec: AnalogCodec,
        #[serde(default)]
        byte_order: Option<ByteOrder>,
        #[serde(default = "default_scale")]
        scale: f64,
    },
    AnalogOutput {
        address: u16,
        codec: AnalogCodec,
        #[serde(default)]
        byte_order: Option<ByteOrder>,
        #[serde(default = "default_scale")]
        scale: f64,
    },
    MeterField {
        address: u16,
        codec: AnalogCodec,
        #[serde(default)]
        byte_order: Option<ByteOrder>,
        #[serde(default = "default_scale")]
        scale: f64,
        unit_of_measurement: String,
    },
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDef {
    pub id: String,
    pub circuit: String,
    pub transport_id: String,
    pub unit_id: u8,

    #[serde(flatten)]
    pub kind: FeatureKindDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDef {
    pub transport_id: String,
    pub unit_id: u8,
    pub blocks: Vec<RegisterBlockDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareDefinition {
    pub model: String,
    pub units: Vec<UnitDef>,
    pub features: Vec<FeatureDef>,
}

impl HardwareDefinition {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, UnipiError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            UnipiError::ConfigInvalid(format!(
                "failed to read hardware definition {}: {e}",
                path.display()
            ))
        })?;
        let def: HardwareDefinition = serde_yaml::from_str(&raw).map_err(|e| {
            UnipiError::ConfigInvalid(format!("invalid hardware definition yaml: {e}"))
        })?;
        def.validate()?;
        Ok(def)
    }

    fn validate(&self) -> Result<(), UnipiError> {
        for unit in &self.units {
            let mut sorted = unit.blocks.clone();
            sorted.sort_by_key(|b| b.start);
            for pair in sorted.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                if a.access == b.access && a.start + a.count > b.start {
                    return Err(UnipiError::ConfigInvalid(format!(
                        "overlapping register blocks on unit {} ({:?})",
                        unit.unit_id, a.access
                    )));
                }
            }
        }
        let mut ids = std::collections::HashSet::new();
        for feature in &self.features {
            if !ids.insert(&feature.id) {
                return Err(UnipiError::ConfigInvalid(format!(
                    "duplicate feature id: {}",
                    feature.id
                )));
            }
            let is_digital_or_relay = matches!(
                feature.kind,
                FeatureKindDef::DigitalInput { .. }
                    | FeatureKindDef::DigitalOutput { .. }
                    | FeatureKindDef::RelayOutput { .. }
            );
            if is_digital_or_relay && !CIRCUIT_PATTERN.is_match(&feature.circuit) {
                return Err(UnipiError::ConfigInvalid(format!(
                    "circuit '{}' does not match the <type>_<group>_<channel> grammar",
                    feature.circuit
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlapping_blocks() {
        let yaml = r#"
model: S103
units:
  - transport_id: neuron
    unit_id: 0
    blocks:
      - start: 0
        count: 10
        access: read
      - start: 5
        count: 5
        access: read
features: []
"#;
        let def: HardwareDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn accepts_non_overlapping_blocks_different_access() {
        let yaml = r#"
model: S103
units:
  - transport_id: neuron
    unit_id: 0
    blocks:
      - start: 0
        count: 10
        access: read
      - start: 0
        count: 10
        access: read_write
features: []
"#;
        let def: HardwareDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(def.validate().is_ok());
    }
}

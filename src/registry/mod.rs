//! Feature Registry (base spec §4.C): the typed view over register blocks.

pub mod hardware;

use std::collections::HashMap;
use std::time::Instant;

use crate::config::{FeatureConfig, FeatureConfigMap};
use crate::error::UnipiError;
use crate::modbus::RegisterCache;
use hardware::{AnalogCodec, ByteOrder, FeatureKindDef, HardwareDefinition};

/// Decoded payload of a feature. `None` (represented as `Option<FeatureValue>`
/// at call sites) means no successful read has happened yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue {
    Bool(bool),
    Float(f32),
}

impl FeatureValue {
    /// MQTT wire representation for digital features: `"ON"`/`"OFF"`.
    pub fn as_on_off(&self) -> Option<&'static str> {
        match self {
            FeatureValue::Bool(true) => Some("ON"),
            FeatureValue::Bool(false) => Some("OFF"),
            FeatureValue::Float(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FeatureKind {
    DigitalInput {
        address: u16,
        bit: u8,
    },
    DigitalOutput {
        address: u16,
        bit: u8,
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
        byte_order: ByteOrder,
        scale: f64,
    },
    AnalogOutput {
        address: u16,
        codec: AnalogCodec,
        byte_order: ByteOrder,
        scale: f64,
    },
    MeterField {
        address: u16,
        codec: AnalogCodec,
        byte_order: ByteOrder,
        scale: f64,
        unit_of_measurement: String,
    },
}

impl FeatureKind {
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            FeatureKind::DigitalOutput { .. }
                | FeatureKind::RelayOutput { .. }
                | FeatureKind::AnalogOutput { .. }
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureMeta {
    pub friendly_name: Option<String>,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub suggested_area: Option<String>,
    pub icon: Option<String>,
    pub invert_state: bool,
    pub object_id: Option<String>,
}

impl From<&FeatureConfig> for FeatureMeta {
    fn from(c: &FeatureConfig) -> Self {
        Self {
            friendly_name: c.friendly_name.clone(),
            device_class: c.device_class.clone(),
            state_class: c.state_class.clone(),
            unit_of_measurement: c.unit_of_measurement.clone(),
            suggested_area: c.suggested_area.clone(),
            icon: c.icon.clone(),
            invert_state: c.invert_state,
            object_id: c.object_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub id: String,
    pub circuit: String,
    pub transport_id: String,
    pub unit_id: u8,
    pub kind: FeatureKind,
    pub meta: FeatureMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    SetCoil,
    SetRegister,
}

#[derive(Debug, Clone, Copy)]
pub enum WriteValue {
    Bool(bool),
    Register(u16),
}

/// A write produced by the router or Cover Controller, consumed by the
/// Command Queue (base spec §3, §4.E).
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub transport_id: String,
    pub unit_id: u8,
    pub address: u16,
    pub value: WriteValue,
    pub kind: WriteKind,
    pub deadline: Option<Instant>,
}

fn ieee754_from_words(hi: u16, lo: u16) -> f32 {
    f32::from_bits(((hi as u32) << 16) | lo as u32)
}

fn assemble_float(registers: &[u16], byte_order: ByteOrder) -> Option<f32> {
    if registers.len() < 2 {
        return None;
    }
    let (w0, w1) = (registers[0], registers[1]);
    Some(match byte_order {
        ByteOrder::BigEndian => ieee754_from_words(w0, w1),
        ByteOrder::LittleEndian => ieee754_from_words(w1, w0),
        ByteOrder::BigEndianWordSwap => ieee754_from_words(w1, w0),
        ByteOrder::LittleEndianWordSwap => ieee754_from_words(w0, w1),
    })
}

fn split_float(value: f32, byte_order: ByteOrder) -> (u16, u16) {
    let bits = value.to_bits();
    let hi = (bits >> 16) as u16;
    let lo = (bits & 0xFFFF) as u16;
    match byte_order {
        ByteOrder::BigEndian | ByteOrder::LittleEndianWordSwap => (hi, lo),
        ByteOrder::LittleEndian | ByteOrder::BigEndianWordSwap => (lo, hi),
    }
}

/// Set of typed I/O points bound to register slices (base spec §4.C).
pub struct FeatureRegistry {
    features: HashMap<String, Feature>,
    by_circuit: HashMap<String, String>,
}

impl FeatureRegistry {
    pub fn new(hw: &HardwareDefinition, user_meta: &FeatureConfigMap) -> Result<Self, UnipiError> {
        let mut features = HashMap::new();
        let mut by_circuit = HashMap::new();

        for def in &hw.features {
            let kind = match &def.kind {
                FeatureKindDef::DigitalInput { address, bit } => FeatureKind::DigitalInput {
                    address: *address,
                    bit: *bit,
                },
                FeatureKindDef::DigitalOutput { address, bit, is_coil } => {
                    if !is_coil && *bit != 0 {
                        return Err(UnipiError::ConfigInvalid(format!(
                            "feature '{}' packs bit {} into a non-coil register; only bit 0 is \
                             writable without a read-modify-write path",
                            def.id, bit
                        )));
                    }
                    FeatureKind::DigitalOutput {
                        address: *address,
                        bit: *bit,
                        is_coil: *is_coil,
                    }
                }
                FeatureKindDef::RelayOutput { address, bit, is_coil } => {
                    if !is_coil && *bit != 0 {
                        return Err(UnipiError::ConfigInvalid(format!(
                            "feature '{}' packs bit {} into a non-coil register; only bit 0 is \
                             writable without a read-modify-write path",
                            def.id, bit
                        )));
                    }
                    FeatureKind::RelayOutput {
                        address: *address,
                        bit: *bit,
                        is_coil: *is_coil,
                    }
                }
                FeatureKindDef::AnalogInput {
                    address,
                    codec,
                    byte_order,
                    scale,
                } => FeatureKind::AnalogInput {
                    address: *address,
                    codec: *codec,
                    byte_order: byte_order.unwrap_or(ByteOrder::BigEndian),
                    scale: *scale,
                },
                FeatureKindDef::AnalogOutput {
                    address,
                    codec,
                    byte_order,
                    scale,
                } => FeatureKind::AnalogOutput {
                    address: *address,
                    codec: *codec,
                    byte_order: byte_order.unwrap_or(ByteOrder::BigEndian),
                    scale: *scale,
                },
                FeatureKindDef::MeterField {
                    address,
                    codec,
                    byte_order,
                    scale,
                    unit_of_measurement,
                } => FeatureKind::MeterField {
                    address: *address,
                    codec: *codec,
                    byte_order: byte_order.unwrap_or(ByteOrder::BigEndian),
                    scale: *scale,
                    unit_of_measurement: unit_of_measurement.clone(),
                },
            };

            let meta = user_meta
                .get(&def.circuit)
                .map(FeatureMeta::from)
                .unwrap_or_default();

            let feature = Feature {
                id: def.id.clone(),
                circuit: def.circuit.clone(),
                transport_id: def.transport_id.clone(),
                unit_id: def.unit_id,
                kind,
                meta,
            };

            if features.contains_key(&feature.id) {
                return Err(UnipiError::ConfigInvalid(format!(
                    "duplicate feature id: {}",
                    feature.id
                )));
            }

            by_circuit.insert(feature.circuit.clone(), feature.id.clone());
            features.insert(feature.id.clone(), feature);
        }

        Ok(Self { features, by_circuit })
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    /// Resolve a writable feature by its circuit identifier, used to bind
    /// `cover_up_circuit`/`cover_down_circuit` to actual bit features.
    pub fn by_output_circuit(&self, circuit: &str) -> Option<&Feature> {
        let id = self.by_circuit.get(circuit)?;
        let feature = self.features.get(id)?;
        feature.kind.is_writable().then_some(feature)
    }

    pub fn iter_writable(&self) -> impl Iterator<Item = &Feature> {
        self.features.values().filter(|f| f.kind.is_writable())
    }

    pub fn iter_readable(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }

    /// Decode a feature's current value from the cache's latest snapshot.
    pub async fn decode(&self, feature: &Feature, cache: &RegisterCache) -> Option<FeatureValue> {
        match &feature.kind {
            FeatureKind::DigitalInput { address, bit } => {
                let raw = cache.value(feature.unit_id, *address).await?;
                let mut value = (raw >> bit) & 1 != 0;
                if feature.meta.invert_state {
                    value = !value;
                }
                Some(FeatureValue::Bool(value))
            }
            FeatureKind::DigitalOutput { address, bit, .. }
            | FeatureKind::RelayOutput { address, bit, .. } => {
                let raw = cache.value(feature.unit_id, *address).await?;
                Some(FeatureValue::Bool((raw >> bit) & 1 != 0))
            }
            FeatureKind::AnalogInput {
                address,
                codec,
                byte_order,
                scale,
            }
            | FeatureKind::AnalogOutput {
                address,
                codec,
                byte_order,
                scale,
            } => self.decode_analog(feature.unit_id, *address, *codec, *byte_order, *scale, cache).await,
            FeatureKind::MeterField {
                address,
                codec,
                byte_order,
                scale,
                ..
            } => {
                self.decode_analog(feature.unit_id, *address, *codec, *byte_order, *scale, cache)
                    .await
            }
        }
    }

    async fn decode_analog(
        &self,
        unit_id: u8,
        address: u16,
        codec: AnalogCodec,
        byte_order: ByteOrder,
        scale: f64,
        cache: &RegisterCache,
    ) -> Option<FeatureValue> {
        match codec {
            AnalogCodec::Raw => {
                let raw = cache.value(unit_id, address).await?;
                Some(FeatureValue::Float((raw as f64 * scale) as f32))
            }
            AnalogCodec::Float32 => {
                let w0 = cache.value(unit_id, address).await?;
                let w1 = cache.value(unit_id, address + 1).await?;
                let value = assemble_float(&[w0, w1], byte_order)?;
                Some(FeatureValue::Float((value as f64 * scale) as f32))
            }
        }
    }

    /// Build the write this feature/value pair requires. Digital writes
    /// honor the function-code-5-vs-6 policy from §4.C; no read-modify-write
    /// path is ever synthesized.
    pub fn encode_write(&self, feature: &Feature, value: FeatureValue) -> Result<PendingCommand, UnipiError> {
        match &feature.kind {
            FeatureKind::DigitalOutput { address, is_coil, .. }
            | FeatureKind::RelayOutput { address, is_coil, .. } => {
                let FeatureValue::Bool(on) = value else {
                    return Err(UnipiError::ConfigInvalid(format!(
                        "feature '{}' expects a boolean value",
                        feature.id
                    )));
                };
                if *is_coil {
                    Ok(PendingCommand {
                        transport_id: feature.transport_id.clone(),
                        unit_id: feature.unit_id,
                        address: *address,
                        value: WriteValue::Bool(on),
                        kind: WriteKind::SetCoil,
                        deadline: None,
                    })
                } else {
                    Ok(PendingCommand {
                        transport_id: feature.transport_id.clone(),
                        unit_id: feature.unit_id,
                        address: *address,
                        value: WriteValue::Register(if on { 1 } else { 0 }),
                        kind: WriteKind::SetRegister,
                        deadline: None,
                    })
                }
            }
            FeatureKind::AnalogOutput {
                address,
                codec,
                byte_order,
                scale,
            } => {
                let FeatureValue::Float(v) = value else {
                    return Err(UnipiError::ConfigInvalid(format!(
                        "feature '{}' expects a numeric value",
                        feature.id
                    )));
                };
                let scaled = (v as f64 / scale) as f32;
                match codec {
                    AnalogCodec::Raw => Ok(PendingCommand {
                        transport_id: feature.transport_id.clone(),
                        unit_id: feature.unit_id,
                        address: *address,
                        value: WriteValue::Register(scaled as u16),
                        kind: WriteKind::SetRegister,
                        deadline: None,
                    }),
                    AnalogCodec::Float32 => {
                        let (_hi, _lo) = split_float(scaled, *byte_order);
                        // Two-register writes need two PendingCommands built
                        // from split_float directly; this type only carries one.
                        Err(UnipiError::ConfigInvalid(format!(
                            "feature '{}' is a two-register analog output; not supported by single-register PendingCommand",
                            feature.id
                        )))
                    }
                }
            }
            _ => Err(UnipiError::ConfigInvalid(format!(
                "feature '{}' is not writable",
                feature.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::hardware::{AccessMode, FeatureDef, RegisterBlockDef, UnitDef};

    fn sample_hw() -> HardwareDefinition {
        HardwareDefinition {
            model: "test".to_string(),
            units: vec![UnitDef {
                transport_id: "neuron".to_string(),
                unit_id: 0,
                blocks: vec![RegisterBlockDef {
                    start: 0,
                    count: 10,
                    access: AccessMode::ReadWrite,
                }],
            }],
            features: vec![
                FeatureDef {
                    id: "di_1_01".to_string(),
                    circuit: "di_1_01".to_string(),
                    transport_id: "neuron".to_string(),
                    unit_id: 0,
                    kind: FeatureKindDef::DigitalInput { address: 0, bit: 0 },
                },
                FeatureDef {
                    id: "ro_2_01".to_string(),
                    circuit: "ro_2_01".to_string(),
                    transport_id: "neuron".to_string(),
                    unit_id: 0,
                    kind: FeatureKindDef::RelayOutput {
                        address: 1,
                        bit: 0,
                        is_coil: true,
                    },
                },
                FeatureDef {
                    id: "meter_voltage".to_string(),
                    circuit: "meter_voltage".to_string(),
                    transport_id: "meter".to_string(),
                    unit_id: 1,
                    kind: FeatureKindDef::MeterField {
                        address: 10,
                        codec: AnalogCodec::Float32,
                        byte_order: Some(ByteOrder::BigEndian),
                        scale: 1.0,
                        unit_of_measurement: "V".to_string(),
                    },
                },
            ],
        }
    }

    #[tokio::test]
    async fn decodes_digital_input_bit() {
        let hw = sample_hw();
        let registry = FeatureRegistry::new(&hw, &FeatureConfigMap::new()).unwrap();
        let cache = RegisterCache::new();
        cache.update_block(0, 0, vec![0b0000_0001]).await;

        let feature = registry.get("di_1_01").unwrap();
        let value = registry.decode(feature, &cache).await.unwrap();
        assert_eq!(value, FeatureValue::Bool(true));
    }

    #[tokio::test]
    async fn invert_state_flips_digital_input_only() {
        let hw = sample_hw();
        let mut user_meta = FeatureConfigMap::new();
        user_meta.insert(
            "di_1_01".to_string(),
            FeatureConfig {
                circuit: "di_1_01".to_string(),
                friendly_name: None,
                device_class: None,
                state_class: None,
                unit_of_measurement: None,
                suggested_area: None,
                icon: None,
                invert_state: true,
                object_id: None,
            },
        );
        let registry = FeatureRegistry::new(&hw, &user_meta).unwrap();
        let cache = RegisterCache::new();
        cache.update_block(0, 0, vec![0]).await;

        let feature = registry.get("di_1_01").unwrap();
        let value = registry.decode(feature, &cache).await.unwrap();
        assert_eq!(value, FeatureValue::Bool(true));
    }

    #[tokio::test]
    async fn decodes_meter_float32_big_endian() {
        let hw = sample_hw();
        let registry = FeatureRegistry::new(&hw, &FeatureConfigMap::new()).unwrap();
        let cache = RegisterCache::new();
        let bits = 230.5f32.to_bits();
        let hi = (bits >> 16) as u16;
        let lo = (bits & 0xFFFF) as u16;
        cache.update_block(1, 10, vec![hi, lo]).await;

        let feature = registry.get("meter_voltage").unwrap();
        let value = registry.decode(feature, &cache).await.unwrap();
        assert_eq!(value, FeatureValue::Float(230.5));
    }

    #[test]
    fn encode_write_coil_relay() {
        let hw = sample_hw();
        let registry = FeatureRegistry::new(&hw, &FeatureConfigMap::new()).unwrap();
        let feature = registry.get("ro_2_01").unwrap();
        let cmd = registry.encode_write(feature, FeatureValue::Bool(true)).unwrap();
        assert_eq!(cmd.kind, WriteKind::SetCoil);
        assert!(matches!(cmd.value, WriteValue::Bool(true)));
    }

    #[test]
    fn rejects_non_coil_bit_above_zero() {
        let mut hw = sample_hw();
        hw.features.push(FeatureDef {
            id: "do_3_02".to_string(),
            circuit: "do_3_02".to_string(),
            transport_id: "neuron".to_string(),
            unit_id: 0,
            kind: FeatureKindDef::DigitalOutput {
                address: 2,
                bit: 1,
                is_coil: false,
            },
        });
        let err = FeatureRegistry::new(&hw, &FeatureConfigMap::new()).unwrap_err();
        assert!(matches!(err, UnipiError::ConfigInvalid(_)));
    }

    #[test]
    fn by_output_circuit_rejects_read_only() {
        let hw = sample_hw();
        let registry = FeatureRegistry::new(&hw, &FeatureConfigMap::new()).unwrap();
        assert!(registry.by_output_circuit("di_1_01").is_none());
        assert!(registry.by_output_circuit("ro_2_01").is_some());
    }
}

#[cfg(test)]
mod digital_output_round_trip {
    use super::*;
    use crate::registry::hardware::{AccessMode, FeatureDef, RegisterBlockDef, UnitDef};
    use proptest::prelude::*;

    fn hw_with_bit(bit: u8, is_coil: bool) -> HardwareDefinition {
        HardwareDefinition {
            model: "test".to_string(),
            units: vec![UnitDef {
                transport_id: "neuron".to_string(),
                unit_id: 0,
                blocks: vec![RegisterBlockDef { start: 0, count: 1, access: AccessMode::ReadWrite }],
            }],
            features: vec![FeatureDef {
                id: "ro_1_01".to_string(),
                circuit: "ro_1_01".to_string(),
                transport_id: "neuron".to_string(),
                unit_id: 0,
                kind: FeatureKindDef::RelayOutput { address: 0, bit, is_coil },
            }],
        }
    }

    proptest! {
        /// Publishing a value and reflecting it into the cache the way the
        /// transport would after executing the write always decodes back
        /// to the same value, for every coil bit position.
        #[test]
        fn encode_then_apply_then_decode_round_trips(bit in 0u8..16, on in any::<bool>()) {
            tokio_test::block_on(async move {
                let hw = hw_with_bit(bit, true);
                let registry = FeatureRegistry::new(&hw, &FeatureConfigMap::new()).unwrap();
                let feature = registry.get("ro_1_01").unwrap();
                let cache = RegisterCache::new();
                cache.update_block(0, 0, vec![0]).await;

                let command = registry.encode_write(feature, FeatureValue::Bool(on)).unwrap();
                let WriteValue::Bool(written) = command.value else { panic!("expected bool write") };
                prop_assert_eq!(written, on);

                let mut raw = 0u16;
                if on {
                    raw |= 1 << bit;
                }
                cache.update_block(0, 0, vec![raw]).await;

                let decoded = registry.decode(feature, &cache).await.unwrap();
                prop_assert_eq!(decoded, FeatureValue::Bool(on));
                Ok(())
            })?;
        }
    }
}

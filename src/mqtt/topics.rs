//! MQTT topic grammar (base spec §6). Every topic is derived here so the
//! router and the discovery emitter never format a topic string by hand.

use crate::config::CoverDeviceClass;
use crate::registry::{Feature, FeatureKind};

pub fn availability_topic(device: &str) -> String {
    format!("{device}/availability")
}

/// The retained `/get` topic a feature's current value is published to,
/// or `None` for a kind the topic grammar does not cover.
pub fn feature_get_topic(device: &str, feature: &Feature) -> Option<String> {
    match &feature.kind {
        FeatureKind::RelayOutput { .. } | FeatureKind::DigitalOutput { .. } => {
            Some(format!("{device}/relay/{}/get", feature.circuit))
        }
        FeatureKind::DigitalInput { .. } => Some(format!("{device}/input/{}/get", feature.circuit)),
        FeatureKind::MeterField { unit_of_measurement, .. } => {
            Some(format!("{device}/meter/{}_{}/get", feature.circuit, unit_of_measurement))
        }
        FeatureKind::AnalogInput { .. } | FeatureKind::AnalogOutput { .. } => {
            Some(format!("{device}/analog/{}/get", feature.circuit))
        }
    }
}

/// The `/set` topic a writable feature subscribes to, or `None` if the
/// feature is read-only.
pub fn feature_set_topic(device: &str, feature: &Feature) -> Option<String> {
    match &feature.kind {
        FeatureKind::RelayOutput { .. } | FeatureKind::DigitalOutput { .. } => {
            Some(format!("{device}/relay/{}/set", feature.circuit))
        }
        FeatureKind::AnalogOutput { .. } => Some(format!("{device}/analog/{}/set", feature.circuit)),
        _ => None,
    }
}

fn cover_device_class_str(class: CoverDeviceClass) -> &'static str {
    match class {
        CoverDeviceClass::Blind => "blind",
        CoverDeviceClass::Shutter => "shutter",
        CoverDeviceClass::Garage => "garage",
    }
}

fn cover_base(device: &str, object_id: &str, class: CoverDeviceClass) -> String {
    format!("{device}/{object_id}/cover/{}", cover_device_class_str(class))
}

pub fn cover_state_topic(device: &str, object_id: &str, class: CoverDeviceClass) -> String {
    format!("{}/state", cover_base(device, object_id, class))
}

pub fn cover_set_topic(device: &str, object_id: &str, class: CoverDeviceClass) -> String {
    format!("{}/set", cover_base(device, object_id, class))
}

pub fn cover_position_topic(device: &str, object_id: &str, class: CoverDeviceClass) -> String {
    format!("{}/position", cover_base(device, object_id, class))
}

pub fn cover_position_set_topic(device: &str, object_id: &str, class: CoverDeviceClass) -> String {
    format!("{}/position/set", cover_base(device, object_id, class))
}

pub fn cover_tilt_topic(device: &str, object_id: &str, class: CoverDeviceClass) -> String {
    format!("{}/tilt", cover_base(device, object_id, class))
}

pub fn cover_tilt_set_topic(device: &str, object_id: &str, class: CoverDeviceClass) -> String {
    format!("{}/tilt/set", cover_base(device, object_id, class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::hardware::ByteOrder;

    fn relay_feature() -> Feature {
        Feature {
            id: "ro_2_01".to_string(),
            circuit: "ro_2_01".to_string(),
            transport_id: "neuron".to_string(),
            unit_id: 0,
            kind: FeatureKind::RelayOutput { address: 1, bit: 0, is_coil: true },
            meta: Default::default(),
        }
    }

    #[test]
    fn relay_topics_match_grammar() {
        let feature = relay_feature();
        assert_eq!(feature_get_topic("unipi", &feature).unwrap(), "unipi/relay/ro_2_01/get");
        assert_eq!(feature_set_topic("unipi", &feature).unwrap(), "unipi/relay/ro_2_01/set");
    }

    #[test]
    fn meter_topic_includes_unit() {
        let feature = Feature {
            id: "meter_voltage".to_string(),
            circuit: "meter_voltage".to_string(),
            transport_id: "meter".to_string(),
            unit_id: 1,
            kind: FeatureKind::MeterField {
                address: 10,
                codec: crate::registry::hardware::AnalogCodec::Float32,
                byte_order: ByteOrder::BigEndian,
                scale: 1.0,
                unit_of_measurement: "V".to_string(),
            },
            meta: Default::default(),
        };
        assert_eq!(feature_get_topic("unipi", &feature).unwrap(), "unipi/meter/meter_voltage_V/get");
        assert!(feature_set_topic("unipi", &feature).is_none());
    }

    #[test]
    fn cover_topics_match_grammar() {
        assert_eq!(
            cover_state_topic("unipi", "blind_1", CoverDeviceClass::Blind),
            "unipi/blind_1/cover/blind/state"
        );
        assert_eq!(
            cover_position_set_topic("unipi", "blind_1", CoverDeviceClass::Blind),
            "unipi/blind_1/cover/blind/position/set"
        );
    }
}

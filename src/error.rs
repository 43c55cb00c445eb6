//! Error kinds shared across the daemon.

use std::time::Duration;

/// Errors produced by the Modbus/MQTT bridge's core subsystems.
///
/// The Scan Loop, Command Queue and MQTT Plane are resilient to every
/// variant here except [`UnipiError::ConfigInvalid`] and a
/// retry-exhausted [`UnipiError::MqttDisconnect`], which are fatal at
/// startup / after reconnect exhaustion respectively.
#[derive(Debug, thiserror::Error)]
pub enum UnipiError {
    #[error("transport io error on unit {unit_id}: {source}")]
    TransportIo {
        unit_id: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("modbus exception from unit {unit_id} at address {address}: {exception}")]
    ModbusException {
        unit_id: u8,
        address: u16,
        exception: String,
    },

    #[error("framing error on unit {unit_id}: {reason}")]
    FramingError { unit_id: u8, reason: String },

    #[error("command timed out after {elapsed:?} for unit {unit_id} address {address}")]
    CommandTimeout {
        unit_id: u8,
        address: u16,
        elapsed: Duration,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("mqtt disconnected: {0}")]
    MqttDisconnect(String),

    #[error("cover safety violation on cover {cover_id}: {reason}")]
    CoverSafetyViolation { cover_id: String, reason: String },
}

impl UnipiError {
    /// Whether this error should terminate the process per the propagation
    /// policy. Only configuration errors are unconditionally fatal; MQTT
    /// disconnects are fatal only after the caller has exhausted its retry
    /// budget, which is tracked by the caller, not this type.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UnipiError::ConfigInvalid(_))
    }
}

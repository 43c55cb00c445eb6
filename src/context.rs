//! Explicit wiring root (base spec §9): everything that would otherwise
//! be ambient global state — config, transports, caches, queues — is
//! built once here and handed to each task at construction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::command_queue::CommandQueue;
use crate::config::{index_feature_configs, Config};
use crate::error::UnipiError;
use crate::modbus::{Endpoint, RegisterCache, Transport};
use crate::registry::hardware::HardwareDefinition;
use crate::registry::FeatureRegistry;
use crate::scan::{EventBus, ScanBlock, ScanLoop, TransportStatusEvent};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Serial,
}

pub struct Context {
    pub config: Config,
    pub device_name: String,
    pub hardware: HardwareDefinition,
    pub registry: Arc<FeatureRegistry>,
    pub transports: HashMap<String, Arc<Transport>>,
    pub transport_kinds: HashMap<String, TransportKind>,
    pub caches: HashMap<String, Arc<RegisterCache>>,
    pub command_queues: HashMap<String, Arc<CommandQueue>>,
    pub events: Arc<EventBus>,
}

/// Event channel depth. Small and bounded: the bus itself coalesces
/// repeat values per feature, so depth only needs to cover the number of
/// distinct features that can change in a single scan cycle.
const EVENT_BUS_CAPACITY: usize = 512;

impl Context {
    pub fn build(config: Config) -> Result<Self, UnipiError> {
        let hardware = HardwareDefinition::from_file(&config.modbus.hardware_definition)?;
        let user_meta = index_feature_configs(&config.features);
        let registry = Arc::new(FeatureRegistry::new(&hardware, &user_meta)?);
        let device_name = config.device_name();

        let mut transports = HashMap::new();
        let mut transport_kinds = HashMap::new();
        let mut caches = HashMap::new();
        let mut command_queues = HashMap::new();

        if let Some(tcp) = &config.modbus.tcp {
            transports.insert(
                tcp.transport_id.clone(),
                Arc::new(Transport::new(
                    tcp.transport_id.clone(),
                    Endpoint::Tcp { host: tcp.host.clone(), port: tcp.port },
                )),
            );
            transport_kinds.insert(tcp.transport_id.clone(), TransportKind::Tcp);
            caches.insert(tcp.transport_id.clone(), Arc::new(RegisterCache::new()));
            command_queues.insert(tcp.transport_id.clone(), Arc::new(CommandQueue::new(tcp.transport_id.clone())));
        }

        for serial in &config.modbus.serial {
            transports.insert(
                serial.transport_id.clone(),
                Arc::new(Transport::new(
                    serial.transport_id.clone(),
                    Endpoint::Serial {
                        device: serial.device.clone(),
                        baud_rate: serial.baud_rate,
                        parity: serial.parity,
                    },
                )),
            );
            transport_kinds.insert(serial.transport_id.clone(), TransportKind::Serial);
            caches.insert(serial.transport_id.clone(), Arc::new(RegisterCache::new()));
            command_queues.insert(
                serial.transport_id.clone(),
                Arc::new(CommandQueue::new(serial.transport_id.clone())),
            );
        }

        for unit in &hardware.units {
            if !transports.contains_key(&unit.transport_id) {
                return Err(UnipiError::ConfigInvalid(format!(
                    "hardware definition references unknown transport '{}'",
                    unit.transport_id
                )));
            }
        }

        Ok(Self {
            config,
            device_name,
            hardware,
            registry,
            transports,
            transport_kinds,
            caches,
            command_queues,
            events: Arc::new(EventBus::new(EVENT_BUS_CAPACITY)),
        })
    }

    /// Builds one [`ScanLoop`] per transport, covering every unit/block
    /// the hardware definition assigns to it. Each loop shares `status_events`
    /// to report degraded/recovered transitions to the MQTT Plane.
    pub fn build_scan_loops(&self, status_events: mpsc::Sender<TransportStatusEvent>) -> Vec<ScanLoop> {
        let mut blocks_by_transport: HashMap<String, Vec<ScanBlock>> = HashMap::new();
        for unit in &self.hardware.units {
            let blocks = blocks_by_transport.entry(unit.transport_id.clone()).or_default();
            for block in &unit.blocks {
                blocks.push(ScanBlock {
                    unit_id: unit.unit_id,
                    start: block.start,
                    count: block.count,
                    access: block.access,
                });
            }
        }

        blocks_by_transport
            .into_iter()
            .filter_map(|(transport_id, blocks)| {
                let transport = self.transports.get(&transport_id)?.clone();
                let cache = self.caches.get(&transport_id)?.clone();
                let queue = self.command_queues.get(&transport_id)?.clone();
                let is_serial = self.transport_kinds.get(&transport_id) == Some(&TransportKind::Serial);
                let scan_interval = std::time::Duration::from_millis(if is_serial {
                    self.config.advanced.scan_interval_serial_ms
                } else {
                    self.config.advanced.scan_interval_ms
                });
                let degraded_interval = std::time::Duration::from_millis(self.config.advanced.scan_interval_degraded_ms);
                Some(ScanLoop::new(
                    transport,
                    blocks,
                    cache,
                    self.registry.clone(),
                    queue,
                    self.events.clone(),
                    scan_interval,
                    degraded_interval,
                    status_events.clone(),
                ))
            })
            .collect()
    }
}

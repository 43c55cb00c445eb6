//! Scan Loop (base spec §4.D): one cooperative task per transport that
//! polls its register blocks in a fixed order, diffs the result against
//! the cache, and interleaves queued writes between reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use crate::command_queue::CommandQueue;
use crate::modbus::{RegisterCache, Transport};
use crate::registry::hardware::AccessMode;
use crate::registry::{FeatureRegistry, FeatureValue, WriteKind, WriteValue};

/// How many block reads happen between opportunities to drain a queued
/// write. A queued write whose deadline has already passed preempts this
/// and is drained immediately instead of waiting its turn.
const WRITE_INTERLEAVE_READS: u32 = 4;

#[derive(Debug, Clone)]
pub struct FeatureChanged {
    pub feature_id: String,
    pub value: FeatureValue,
    pub at: Instant,
}

/// Single-consumer event queue with "last value wins" coalescing per
/// feature id. Mirrors the coalescing approach in [`CommandQueue`]; unlike
/// a plain bounded channel, a slow consumer never sees a feature's stale
/// intermediate values, only its latest one once it catches up.
pub struct EventBus {
    capacity: usize,
    inner: Mutex<std::collections::VecDeque<FeatureChanged>>,
    notify: Notify,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(std::collections::VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn publish(&self, event: FeatureChanged) {
        let mut queue = self.inner.lock().await;
        if let Some(existing) = queue.iter_mut().find(|e| e.feature_id == event.feature_id) {
            *existing = event;
        } else {
            if queue.len() >= self.capacity {
                let dropped = queue.pop_front();
                warn!(
                    dropped_feature = dropped.map(|d| d.feature_id).unwrap_or_default(),
                    "event bus at capacity, dropping oldest distinct-feature event"
                );
            }
            queue.push_back(event);
        }
        drop(queue);
        self.notify.notify_one();
    }

    pub async fn recv(&self) -> FeatureChanged {
        loop {
            {
                let mut queue = self.inner.lock().await;
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// A transport's degraded/recovered transition, used to drive the MQTT
/// Plane's retained availability topic (base spec §4.A, §7).
#[derive(Debug, Clone)]
pub struct TransportStatusEvent {
    pub transport_id: String,
    pub degraded: bool,
}

/// One register block to poll on one unit.
#[derive(Debug, Clone)]
pub struct ScanBlock {
    pub unit_id: u8,
    pub start: u16,
    pub count: u16,
    pub access: AccessMode,
}

/// Drives one [`Transport`]'s periodic polling and write interleaving.
pub struct ScanLoop {
    transport: Arc<Transport>,
    blocks: Vec<ScanBlock>,
    cache: Arc<RegisterCache>,
    registry: Arc<FeatureRegistry>,
    command_queue: Arc<CommandQueue>,
    events: Arc<EventBus>,
    scan_interval: Duration,
    scan_interval_degraded: Duration,
    last_values: Mutex<HashMap<String, FeatureValue>>,
    status_events: mpsc::Sender<TransportStatusEvent>,
    was_degraded: AtomicBool,
}

impl ScanLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<Transport>,
        blocks: Vec<ScanBlock>,
        cache: Arc<RegisterCache>,
        registry: Arc<FeatureRegistry>,
        command_queue: Arc<CommandQueue>,
        events: Arc<EventBus>,
        scan_interval: Duration,
        scan_interval_degraded: Duration,
        status_events: mpsc::Sender<TransportStatusEvent>,
    ) -> Self {
        Self {
            transport,
            blocks,
            cache,
            registry,
            command_queue,
            events,
            scan_interval,
            scan_interval_degraded,
            last_values: Mutex::new(HashMap::new()),
            status_events,
            was_degraded: AtomicBool::new(false),
        }
    }

    /// Runs until the transport is dropped or the process shuts down; the
    /// caller spawns this on its own task per transport.
    pub async fn run(&self) {
        let mut reads_since_write_check: u32 = 0;

        loop {
            for block in &self.blocks {
                let read = match block.access {
                    AccessMode::Read => self.transport.read_input(block.unit_id, block.start, block.count).await,
                    AccessMode::ReadWrite => {
                        self.transport.read_holding(block.unit_id, block.start, block.count).await
                    }
                };

                match read {
                    Ok(values) => {
                        self.cache.update_block(block.unit_id, block.start, values).await;
                    }
                    Err(e) => {
                        warn!(
                            transport = %self.transport.id,
                            unit_id = block.unit_id,
                            start = block.start,
                            "block read failed: {e}"
                        );
                    }
                }

                reads_since_write_check += 1;
                let preempt = self.command_queue.front_deadline_passed().await;
                if preempt || reads_since_write_check >= WRITE_INTERLEAVE_READS {
                    reads_since_write_check = 0;
                    self.drain_one_command().await;
                }
            }

            self.diff_and_publish().await;

            let degraded = self.transport.is_degraded().await;
            if degraded != self.was_degraded.swap(degraded, Ordering::Relaxed) {
                let _ = self
                    .status_events
                    .send(TransportStatusEvent {
                        transport_id: self.transport.id.clone(),
                        degraded,
                    })
                    .await;
            }
            let interval = if degraded {
                self.scan_interval_degraded
            } else {
                self.scan_interval
            };
            tokio::time::sleep(interval).await;
        }
    }

    async fn drain_one_command(&self) {
        let Some((command, completion)) = self.command_queue.pop_front().await else {
            return;
        };
        let result = match (command.kind, command.value) {
            (WriteKind::SetCoil, WriteValue::Bool(on)) => {
                self.transport.write_single_coil(command.unit_id, command.address, on).await
            }
            (WriteKind::SetRegister, WriteValue::Register(v)) => {
                self.transport
                    .write_single_register(command.unit_id, command.address, v)
                    .await
            }
            _ => {
                warn!("command kind/value mismatch, dropping");
                return;
            }
        };
        if let Err(e) = &result {
            warn!(transport = %self.transport.id, address = command.address, "queued write failed: {e}");
        }
        let _ = completion.send(result);
    }

    async fn diff_and_publish(&self) {
        let mut last_values = self.last_values.lock().await;
        for feature in self.registry.iter_readable() {
            if feature.transport_id != self.transport.id {
                continue;
            }
            let Some(value) = self.registry.decode(feature, &self.cache).await else {
                continue;
            };
            let changed = match last_values.get(&feature.id) {
                Some(previous) => !values_equal(previous, &value),
                None => true,
            };
            if changed {
                last_values.insert(feature.id.clone(), value);
                debug!(feature = %feature.id, "feature value changed");
                self.events
                    .publish(FeatureChanged {
                        feature_id: feature.id.clone(),
                        value,
                        at: Instant::now(),
                    })
                    .await;
            }
        }
    }
}

fn values_equal(a: &FeatureValue, b: &FeatureValue) -> bool {
    match (a, b) {
        (FeatureValue::Bool(x), FeatureValue::Bool(y)) => x == y,
        (FeatureValue::Float(x), FeatureValue::Float(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_coalesces_same_feature() {
        let bus = EventBus::new(16);
        bus.publish(FeatureChanged {
            feature_id: "f1".into(),
            value: FeatureValue::Bool(true),
            at: Instant::now(),
        })
        .await;
        bus.publish(FeatureChanged {
            feature_id: "f1".into(),
            value: FeatureValue::Bool(false),
            at: Instant::now(),
        })
        .await;

        let event = bus.recv().await;
        assert!(matches!(event.value, FeatureValue::Bool(false)));
    }

    #[tokio::test]
    async fn event_bus_drops_oldest_distinct_feature_over_capacity() {
        let bus = EventBus::new(1);
        bus.publish(FeatureChanged {
            feature_id: "f1".into(),
            value: FeatureValue::Bool(true),
            at: Instant::now(),
        })
        .await;
        bus.publish(FeatureChanged {
            feature_id: "f2".into(),
            value: FeatureValue::Bool(true),
            at: Instant::now(),
        })
        .await;

        let event = bus.recv().await;
        assert_eq!(event.feature_id, "f2");
    }
}

#[cfg(test)]
mod last_value_wins_property {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Publishing an arbitrary sequence of values for one feature,
        /// faster than any consumer drains them, always yields only that
        /// feature's last value once received — never a stale one.
        #[test]
        fn rapid_publishes_yield_only_the_last_value(values in prop::collection::vec(any::<bool>(), 1..32)) {
            tokio_test::block_on(async move {
                let bus = EventBus::new(512);
                for v in &values {
                    bus.publish(FeatureChanged {
                        feature_id: "f1".into(),
                        value: FeatureValue::Bool(*v),
                        at: Instant::now(),
                    })
                    .await;
                }

                let event = bus.recv().await;
                prop_assert!(matches!(event.value, FeatureValue::Bool(v) if v == *values.last().unwrap()));
                Ok(())
            })?;
        }
    }
}

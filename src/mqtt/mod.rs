//! MQTT Plane (base spec §4.G): the single broker connection, topic
//! router, and retained-state publisher.

pub mod discovery;
pub mod topics;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, Publish, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::command_queue::CommandQueue;
use crate::config::{Config, CoverDeviceClass};
use crate::cover::{CoverCommand, CoverEvent, CoverState};
use crate::registry::{FeatureRegistry, FeatureValue};
use crate::scan::{EventBus, FeatureChanged, TransportStatusEvent};

enum TopicHandler {
    FeatureSet(String),
    CoverControl(String),
    CoverPositionSet(String),
    CoverTiltSet(String),
}

struct CoverTopicInfo {
    object_id: String,
    device_class: CoverDeviceClass,
}

/// Owns the broker connection and dispatches both directions: inbound
/// `/set` topics to the Command Queue or a Cover Controller's mailbox,
/// and outbound retained state from [`FeatureChanged`]/[`CoverEvent`].
pub struct MqttPlane {
    client: AsyncClient,
    eventloop: rumqttc::EventLoop,
    device_name: String,
    registry: Arc<FeatureRegistry>,
    command_queues: HashMap<String, Arc<CommandQueue>>,
    cover_senders: HashMap<String, mpsc::Sender<CoverCommand>>,
    cover_topics: HashMap<String, CoverTopicInfo>,
    router: HashMap<String, TopicHandler>,
    retry_limit: u32,
    reconnect_interval: Duration,
    discovery_enabled: bool,
}

impl MqttPlane {
    /// A cloned client handle, usable after `self` has been moved into
    /// its dispatch task — e.g. to publish `offline` during shutdown.
    pub fn client_handle(&self) -> AsyncClient {
        self.client.clone()
    }

    pub fn new(
        config: &Config,
        device_name: String,
        registry: Arc<FeatureRegistry>,
        command_queues: HashMap<String, Arc<CommandQueue>>,
        cover_senders: HashMap<String, mpsc::Sender<CoverCommand>>,
    ) -> Self {
        let client_id = config
            .mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("unipi-control-{device_name}"));
        let mut options = MqttOptions::new(client_id, config.mqtt.host.clone(), config.mqtt.port);
        options.set_keep_alive(Duration::from_secs(config.mqtt.keepalive_secs));
        if let (Some(user), Some(password)) = (&config.mqtt.user, &config.mqtt.password) {
            options.set_credentials(user.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(
            topics::availability_topic(&device_name),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, 256);

        let mut router = HashMap::new();
        for feature in registry.iter_writable() {
            if let Some(topic) = topics::feature_set_topic(&device_name, feature) {
                router.insert(topic, TopicHandler::FeatureSet(feature.id.clone()));
            }
        }

        let mut cover_topics = HashMap::new();
        for cover in &config.covers {
            let object_id = cover.object_id.clone().unwrap_or_else(|| cover.id.clone());
            router.insert(
                topics::cover_set_topic(&device_name, &object_id, cover.device_class),
                TopicHandler::CoverControl(cover.id.clone()),
            );
            router.insert(
                topics::cover_position_set_topic(&device_name, &object_id, cover.device_class),
                TopicHandler::CoverPositionSet(cover.id.clone()),
            );
            router.insert(
                topics::cover_tilt_set_topic(&device_name, &object_id, cover.device_class),
                TopicHandler::CoverTiltSet(cover.id.clone()),
            );
            cover_topics.insert(
                cover.id.clone(),
                CoverTopicInfo { object_id, device_class: cover.device_class },
            );
        }

        Self {
            client,
            eventloop,
            device_name,
            registry,
            command_queues,
            cover_senders,
            cover_topics,
            router,
            retry_limit: config.mqtt.retry_limit,
            reconnect_interval: Duration::from_secs(config.mqtt.reconnect_interval_secs),
            discovery_enabled: config.homeassistant.enabled,
        }
    }

    /// Runs the dispatch loop until the process exits. Exits the process
    /// with code 3 once reconnect attempts are exhausted, per the daemon's
    /// documented exit-code contract.
    pub async fn run(
        mut self,
        events: Arc<EventBus>,
        mut cover_events: mpsc::Receiver<CoverEvent>,
        mut transport_status: mpsc::Receiver<TransportStatusEvent>,
        discovery_documents: Vec<(String, serde_json::Value)>,
    ) {
        let mut reconnect_attempts: u32 = 0;
        let mut degraded_transports: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                poll_result = self.eventloop.poll() => {
                    match poll_result {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            reconnect_attempts = 0;
                            info!("mqtt connected");
                            self.publish_online().await;
                            self.subscribe_all().await;
                            if self.discovery_enabled {
                                self.publish_discovery(&discovery_documents).await;
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.handle_inbound(publish).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            reconnect_attempts += 1;
                            warn!(attempt = reconnect_attempts, "mqtt connection error: {e}");
                            if reconnect_attempts >= self.retry_limit {
                                error!("mqtt reconnect attempts exhausted, exiting");
                                std::process::exit(3);
                            }
                            tokio::time::sleep(self.reconnect_interval).await;
                        }
                    }
                }
                event = events.recv() => {
                    self.publish_feature_changed(event).await;
                }
                Some(cover_event) = cover_events.recv() => {
                    self.publish_cover_event(cover_event).await;
                }
                Some(status) = transport_status.recv() => {
                    self.handle_transport_status(&mut degraded_transports, status).await;
                }
            }
        }
    }

    /// Tracks which transports are currently degraded and republishes the
    /// availability topic on the empty<->non-empty boundary: the daemon
    /// is "online" only while every transport is healthy.
    async fn handle_transport_status(
        &self,
        degraded_transports: &mut HashSet<String>,
        status: TransportStatusEvent,
    ) {
        let was_empty = degraded_transports.is_empty();
        if status.degraded {
            degraded_transports.insert(status.transport_id);
        } else {
            degraded_transports.remove(&status.transport_id);
        }
        let is_empty = degraded_transports.is_empty();
        if was_empty && !is_empty {
            self.publish_offline().await;
        } else if !was_empty && is_empty {
            self.publish_online().await;
        }
    }

    async fn subscribe_all(&self) {
        for topic in self.router.keys() {
            if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
                warn!("failed to subscribe to {topic}: {e}");
            }
        }
    }

    async fn publish_online(&self) {
        let topic = topics::availability_topic(&self.device_name);
        if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, true, "online").await {
            warn!("failed to publish availability: {e}");
        }
    }

    /// Publishes `offline` explicitly; used by graceful shutdown, since
    /// the last-will only fires on an *ungraceful* disconnect.
    pub async fn publish_offline(&self) {
        let topic = topics::availability_topic(&self.device_name);
        if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, true, "offline").await {
            warn!("failed to publish offline availability: {e}");
        }
    }

    async fn publish_discovery(&self, documents: &[(String, serde_json::Value)]) {
        for (topic, payload) in documents {
            let body = match serde_json::to_vec(payload) {
                Ok(b) => b,
                Err(e) => {
                    warn!("failed to serialize discovery document for {topic}: {e}");
                    continue;
                }
            };
            if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, true, body).await {
                warn!("failed to publish discovery document for {topic}: {e}");
            }
        }
    }

    async fn publish_feature_changed(&self, event: FeatureChanged) {
        let Some(feature) = self.registry.get(&event.feature_id) else {
            return;
        };
        let Some(topic) = topics::feature_get_topic(&self.device_name, feature) else {
            return;
        };
        let payload = match event.value {
            FeatureValue::Bool(on) => (if on { "ON" } else { "OFF" }).to_string(),
            FeatureValue::Float(v) => format!("{v:.2}"),
        };
        if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, true, payload).await {
            warn!("failed to publish feature state for {}: {e}", event.feature_id);
        }
    }

    async fn publish_cover_event(&self, event: CoverEvent) {
        let (cover_id, topic, payload) = match event {
            CoverEvent::StateChanged { cover_id, state } => {
                let Some(info) = self.cover_topics.get(&cover_id) else { return };
                (
                    cover_id,
                    topics::cover_state_topic(&self.device_name, &info.object_id, info.device_class),
                    cover_state_payload(state).to_string(),
                )
            }
            CoverEvent::PositionChanged { cover_id, position } => {
                let Some(info) = self.cover_topics.get(&cover_id) else { return };
                (
                    cover_id,
                    topics::cover_position_topic(&self.device_name, &info.object_id, info.device_class),
                    position.to_string(),
                )
            }
            CoverEvent::TiltChanged { cover_id, tilt } => {
                let Some(info) = self.cover_topics.get(&cover_id) else { return };
                (
                    cover_id,
                    topics::cover_tilt_topic(&self.device_name, &info.object_id, info.device_class),
                    tilt.to_string(),
                )
            }
        };
        if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, true, payload).await {
            warn!("failed to publish cover state for {cover_id}: {e}");
        }
    }

    async fn handle_inbound(&self, publish: Publish) {
        let Some(handler) = self.router.get(publish.topic.as_str()) else {
            return;
        };
        let payload = match std::str::from_utf8(&publish.payload) {
            Ok(s) => s.trim(),
            Err(_) => {
                warn!("non-utf8 payload on {}", publish.topic);
                return;
            }
        };

        match handler {
            TopicHandler::FeatureSet(feature_id) => self.dispatch_feature_set(feature_id, payload).await,
            TopicHandler::CoverControl(cover_id) => self.dispatch_cover_control(cover_id, payload).await,
            TopicHandler::CoverPositionSet(cover_id) => self.dispatch_cover_target(cover_id, payload, false).await,
            TopicHandler::CoverTiltSet(cover_id) => self.dispatch_cover_target(cover_id, payload, true).await,
        }
    }

    async fn dispatch_feature_set(&self, feature_id: &str, payload: &str) {
        let Some(feature) = self.registry.get(feature_id) else { return };
        let value = match &feature.kind {
            crate::registry::FeatureKind::RelayOutput { .. } | crate::registry::FeatureKind::DigitalOutput { .. } => {
                match payload {
                    "ON" => FeatureValue::Bool(true),
                    "OFF" => FeatureValue::Bool(false),
                    _ => {
                        warn!("malformed payload '{payload}' for {feature_id}, dropping");
                        return;
                    }
                }
            }
            crate::registry::FeatureKind::AnalogOutput { .. } => match payload.parse::<f32>() {
                Ok(v) => FeatureValue::Float(v),
                Err(_) => {
                    warn!("malformed analog payload '{payload}' for {feature_id}, dropping");
                    return;
                }
            },
            _ => return,
        };

        let command = match self.registry.encode_write(feature, value) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to encode write for {feature_id}: {e}");
                return;
            }
        };
        let Some(queue) = self.command_queues.get(&feature.transport_id) else {
            warn!("no command queue for transport {}", feature.transport_id);
            return;
        };
        let _handle = queue.submit(command).await;
    }

    async fn dispatch_cover_control(&self, cover_id: &str, payload: &str) {
        let command = match payload {
            "OPEN" => CoverCommand::Open,
            "CLOSE" => CoverCommand::Close,
            "STOP" => CoverCommand::Stop,
            _ => {
                warn!("malformed cover command '{payload}' for {cover_id}, dropping");
                return;
            }
        };
        self.send_cover_command(cover_id, command).await;
    }

    async fn dispatch_cover_target(&self, cover_id: &str, payload: &str, is_tilt: bool) {
        let Ok(raw) = payload.parse::<i32>() else {
            warn!("malformed cover target '{payload}' for {cover_id}, dropping");
            return;
        };
        if !(0..=100).contains(&raw) {
            warn!("cover target {raw} out of range for {cover_id}, dropping");
            return;
        }
        let command = if is_tilt {
            CoverCommand::SetTilt(raw as u8)
        } else {
            CoverCommand::SetPosition(raw as u8)
        };
        self.send_cover_command(cover_id, command).await;
    }

    async fn send_cover_command(&self, cover_id: &str, command: CoverCommand) {
        let Some(sender) = self.cover_senders.get(cover_id) else {
            warn!("no controller registered for cover {cover_id}");
            return;
        };
        if sender.send(command).await.is_err() {
            warn!("cover {cover_id} controller task has stopped");
        }
    }
}

fn cover_state_payload(state: CoverState) -> &'static str {
    state.as_str()
}

//! Unipi Control daemon entry point.
//!
//! Loads the YAML configuration and hardware definition, wires up the
//! Modbus transports, Scan Loops, Cover Controllers and MQTT Plane, then
//! waits for SIGTERM/SIGINT to run the graceful-shutdown sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use unipi_control::config::Config;
use unipi_control::context::Context;
use unipi_control::cover::{CoverCommand, CoverController};
use unipi_control::mqtt::discovery::DiscoveryEmitter;
use unipi_control::mqtt::{topics, MqttPlane};
use unipi_control::registry::{WriteKind, WriteValue};

const COVER_TICK_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_FLUSH_BUDGET: Duration = Duration::from_secs(2);
const SHUTDOWN_HARD_ABORT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,unipi_control=debug")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting unipi-control");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "/etc/unipi/control.yaml".to_string());
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("fatal configuration error: {e}");
            std::process::exit(1);
        }
    };

    let ctx = match Context::build(config) {
        Ok(c) => c,
        Err(e) => {
            error!("fatal startup error: {e}");
            std::process::exit(1);
        }
    };
    info!(device_name = %ctx.device_name, units = ctx.hardware.units.len(), "daemon context built");

    let (transport_status_tx, transport_status_rx) = mpsc::channel(16);
    for scan_loop in ctx.build_scan_loops(transport_status_tx) {
        tokio::spawn(async move { scan_loop.run().await });
    }

    let (tick_tx, _) = broadcast::channel::<()>(4);
    let (cover_events_tx, cover_events_rx) = mpsc::channel(256);
    let mut cover_senders = HashMap::new();

    for cover_config in &ctx.config.covers {
        let up = ctx
            .registry
            .by_output_circuit(&cover_config.cover_up_circuit)
            .with_context(|| format!("cover '{}' up circuit did not resolve to a writable feature", cover_config.id))?;
        let cache = ctx
            .caches
            .get(&up.transport_id)
            .cloned()
            .with_context(|| format!("no register cache for transport '{}'", up.transport_id))?;

        let controller = CoverController::new(
            cover_config,
            ctx.registry.clone(),
            cache,
            ctx.command_queues.clone(),
            cover_events_tx.clone(),
            PathBuf::from(ctx.config.persistence_dir()),
            ctx.config.advanced.persistent_tmp_dir,
        )?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        cover_senders.insert(cover_config.id.clone(), cmd_tx);

        let ticks = tick_tx.subscribe();
        tokio::spawn(async move { controller.run(cmd_rx, ticks).await });
    }
    let cover_senders_for_shutdown = cover_senders.clone();

    let discovery_documents = if ctx.config.homeassistant.enabled {
        DiscoveryEmitter::new(&ctx.config, &ctx.registry, ctx.device_name.clone()).documents()
    } else {
        Vec::new()
    };

    let mqtt = MqttPlane::new(
        &ctx.config,
        ctx.device_name.clone(),
        ctx.registry.clone(),
        ctx.command_queues.clone(),
        cover_senders,
    );
    let mqtt_client = mqtt.client_handle();

    let events = ctx.events.clone();
    let mqtt_task = tokio::spawn(async move {
        mqtt.run(events, cover_events_rx, transport_status_rx, discovery_documents).await;
    });

    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(COVER_TICK_INTERVAL);
        loop {
            interval.tick().await;
            let _ = tick_tx.send(());
        }
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    let availability_topic = topics::availability_topic(&ctx.device_name);
    let shutdown = async {
        for sender in cover_senders_for_shutdown.values() {
            let _ = sender.send(CoverCommand::Stop).await;
        }
        // Give the Cover Controller tasks a beat to react to Stop before
        // the flush below races their relay-clear writes into the queue.
        tokio::time::sleep(Duration::from_millis(150)).await;

        if tokio::time::timeout(SHUTDOWN_FLUSH_BUDGET, flush_command_queues(&ctx))
            .await
            .is_err()
        {
            warn!("command queue flush exceeded its budget");
        }

        let _ = mqtt_client
            .publish(availability_topic, rumqttc::QoS::AtLeastOnce, true, "offline")
            .await;
    };

    if tokio::time::timeout(SHUTDOWN_HARD_ABORT, shutdown).await.is_err() {
        warn!("shutdown exceeded hard-abort budget, forcing exit");
    }

    tick_task.abort();
    mqtt_task.abort();
    info!("shutdown complete");
    Ok(())
}

async fn flush_command_queues(ctx: &Context) {
    for (transport_id, queue) in &ctx.command_queues {
        let Some(transport) = ctx.transports.get(transport_id) else { continue };
        for (command, completion) in queue.drain().await {
            let result = match (command.kind, command.value) {
                (WriteKind::SetCoil, WriteValue::Bool(on)) => {
                    transport.write_single_coil(command.unit_id, command.address, on).await
                }
                (WriteKind::SetRegister, WriteValue::Register(v)) => {
                    transport.write_single_register(command.unit_id, command.address, v).await
                }
                _ => Ok(()),
            };
            let _ = completion.send(result);
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

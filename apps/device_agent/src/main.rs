// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device-side process (spec.md §6): wires the TELEMETRY engine (C4) and MGMT engine (C6) for
//! one smart-breaker device over a single broker session.

mod commands;
mod config;
mod sensor;

use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use sparkmesh_description::DeviceDescription;
use sparkmesh_mqtt::connection_settings::BrokerConnectionSettingsBuilder;
use sparkmesh_mqtt::interface::PubReceiver;
use sparkmesh_mqtt::session::{BrokerSession, SessionOptionsBuilder};
use sparkmesh_protocol::mgmt::device::{DeviceMgmt, DeviceMgmtConfigBuilder};
use sparkmesh_protocol::mgmt::{BulkOperation, CommandEnvelope};
use sparkmesh_protocol::telemetry::device::{DeviceTelemetry, DeviceTelemetryConfigBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use commands::{BreakerCommandHandler, BreakerConfigApplier, BreakerState};
use config::AgentConfigBuilder;
use sensor::{BreakerRatings, SmartBreakerSensor};

/// Object id this agent's MGMT resources are published under (a placeholder LwM2M object, for
/// demonstration rather than a registered IPSO identifier).
const BREAKER_OBJECT_ID: u16 = 3032;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::max())
        .format_timestamp_millis()
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupOrRunError::Startup(message)) => {
            log::error!("device agent could not start: {message}");
            ExitCode::from(1)
        }
        Err(StartupOrRunError::BrokerUnreachable(message)) => {
            log::error!("device agent exiting, broker unreachable: {message}");
            ExitCode::from(2)
        }
        Err(StartupOrRunError::Interrupted) => ExitCode::from(130),
    }
}

enum StartupOrRunError {
    Startup(String),
    BrokerUnreachable(String),
    Interrupted,
}

async fn run() -> Result<(), StartupOrRunError> {
    let config = AgentConfigBuilder::from_environment()
        .map_err(StartupOrRunError::Startup)?
        .build()
        .map_err(StartupOrRunError::Startup)?;

    let description = config
        .description_path
        .as_ref()
        .map(|path| load_description(path))
        .transpose()?;

    let connection_settings = BrokerConnectionSettingsBuilder::from_environment()
        .map_err(StartupOrRunError::Startup)?
        .client_id(format!("sparkmesh-agent-{}", config.device_id))
        .build()
        .map_err(StartupOrRunError::Startup)?;
    let session_options = SessionOptionsBuilder::default()
        .connection_settings(connection_settings)
        .build()
        .map_err(|e| StartupOrRunError::Startup(e.to_string()))?;
    let mut session = BrokerSession::new(session_options).map_err(|e| StartupOrRunError::Startup(e.to_string()))?;
    let pub_sub = session.pub_sub();
    let exit_handle = session.get_session_exit_handle();

    let mgmt_cmd_filter = format!("{}/{}/cmd/+", config.mgmt_prefix, config.device_id);
    let mut mgmt_cmd_rx = session
        .filtered_pub_receiver(&mgmt_cmd_filter, true)
        .map_err(|e| StartupOrRunError::Startup(e.to_string()))?;

    let rebirth_filter = format!(
        "{}/{}/DCMD/{}/{}",
        config.namespace, config.group_id, config.device_id, config.device_id
    );
    let mut rebirth_cmd_rx = session
        .filtered_pub_receiver(&rebirth_filter, true)
        .map_err(|e| StartupOrRunError::Startup(e.to_string()))?;

    let state = Arc::new(Mutex::new(BreakerState::default()));

    let telemetry_config = DeviceTelemetryConfigBuilder::default()
        .namespace(config.namespace.clone())
        .group_id(config.group_id.clone())
        .node_id(config.device_id.clone())
        .device_id(Some(config.device_id.clone()))
        .interval(config.telemetry_interval)
        .build()
        .map_err(|e| StartupOrRunError::Startup(e.to_string()))?;

    let mgmt_config = DeviceMgmtConfigBuilder::default()
        .prefix(config.mgmt_prefix.clone())
        .device_id(config.device_id.clone())
        .endpoint(config.device_id.clone())
        .lifetime_s(config.mgmt_lifetime_s)
        .update_interval(config.mgmt_update_interval)
        .bulk_mode(config.mgmt_bulk_mode)
        .bulk_size(config.mgmt_bulk_size)
        .bulk_interval(config.mgmt_bulk_interval)
        .build()
        .map_err(|e| StartupOrRunError::Startup(e.to_string()))?;

    let cancel = CancellationToken::new();
    let (rebirth_tx, rebirth_rx) = mpsc::channel(1);

    let mut telemetry_engine = DeviceTelemetry::new(pub_sub.clone(), telemetry_config);
    let sensor = SmartBreakerSensor::new(BreakerRatings::default());
    let telemetry_cancel = cancel.clone();
    let telemetry_task = tokio::spawn(async move {
        telemetry_engine.run(sensor, rebirth_rx, telemetry_cancel).await
    });

    let rebirth_cancel = cancel.clone();
    let rebirth_watch_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = rebirth_cancel.cancelled() => break,
                publish = rebirth_cmd_rx.recv() => {
                    if publish.is_none() {
                        break;
                    }
                    log::info!("rebirth request observed; requesting fresh birth");
                    let _ = rebirth_tx.send(()).await;
                }
            }
        }
    });

    let mgmt_state = state.clone();
    let mgmt_description = description;
    let mgmt_cancel = cancel.clone();
    let mgmt_update_interval = config.mgmt_update_interval;
    let mgmt_task = tokio::spawn(async move {
        let mut engine = DeviceMgmt::new(pub_sub.clone(), mgmt_config, Default::default());
        if let Err(e) = engine.register().await {
            log::error!("mgmt registration failed: {e}");
        }
        let mut config_applier = BreakerConfigApplier::new(mgmt_description, mgmt_state.clone());
        let mut semantic_handler = BreakerCommandHandler::new(mgmt_state.clone());
        let mut ticker = tokio::time::interval(mgmt_update_interval);

        loop {
            tokio::select! {
                () = mgmt_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let ops = snapshot_ops(&mgmt_state);
                    if let Err(e) = engine.apply_operations(ops).await {
                        log::error!("mgmt periodic update failed: {e}");
                    }
                }
                publish = mgmt_cmd_rx.recv() => {
                    let Some(publish) = publish else { break };
                    handle_mgmt_command(&mut engine, &publish, &mut config_applier, &mut semantic_handler).await;
                }
            }
        }
    });

    let session_run = session.run();
    tokio::pin!(session_run);

    let outcome = tokio::select! {
        result = &mut session_run => match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("reconnection halted") => {
                Err(StartupOrRunError::BrokerUnreachable(e.to_string()))
            }
            Err(e) => Err(StartupOrRunError::Startup(e.to_string())),
        },
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt received, shutting down device agent");
            let _ = exit_handle.exit_session().await;
            let _ = session_run.await;
            Err(StartupOrRunError::Interrupted)
        }
    };

    cancel.cancel();
    let _ = telemetry_task.await;
    let _ = rebirth_watch_task.await;
    let _ = mgmt_task.await;
    outcome
}

fn load_description(path: &str) -> Result<DeviceDescription, StartupOrRunError> {
    let xml = std::fs::read_to_string(path)
        .map_err(|e| StartupOrRunError::Startup(format!("description file {path}: {e}")))?;
    DeviceDescription::parse(&xml).map_err(|e| StartupOrRunError::Startup(format!("description file {path}: {e}")))
}

fn snapshot_ops(state: &Arc<Mutex<BreakerState>>) -> Vec<BulkOperation> {
    let state = state.lock().unwrap();
    vec![
        BulkOperation {
            object_id: BREAKER_OBJECT_ID,
            instance_id: 0,
            resource_id: 0,
            value: serde_json::json!(state.overcurrent_pickup),
        },
        BulkOperation {
            object_id: BREAKER_OBJECT_ID,
            instance_id: 0,
            resource_id: 1,
            value: serde_json::json!(state.tripped),
        },
    ]
}

async fn handle_mgmt_command<P: sparkmesh_mqtt::interface::MqttPubSub + Send + Sync>(
    engine: &mut DeviceMgmt<P>,
    publish: &sparkmesh_mqtt::control_packet::Publish,
    config_applier: &mut BreakerConfigApplier,
    semantic_handler: &mut BreakerCommandHandler,
) {
    let topic = String::from_utf8_lossy(&publish.topic).to_string();
    let parsed = match sparkmesh_protocol::topic::parse(&topic) {
        Ok(sparkmesh_protocol::topic::ParsedTopic::Mgmt(mgmt_topic)) => mgmt_topic,
        _ => {
            log::warn!("could not parse mgmt command topic {topic}");
            return;
        }
    };
    let Some(verb) = parsed.sub else {
        log::warn!("mgmt command topic {topic} is missing its verb sub-level");
        return;
    };
    let cmd: CommandEnvelope = match serde_json::from_slice(&publish.payload) {
        Ok(cmd) => cmd,
        Err(e) => {
            log::warn!("malformed command payload on {topic}: {e}");
            return;
        }
    };
    if let Err(e) = engine
        .dispatch_command(&verb, cmd, Some(config_applier), Some(semantic_handler))
        .await
    {
        log::error!("failed to publish response for {topic}: {e}");
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! INTEGRATION-broker process (spec.md §4.11/§6): exposes `DiscoverDevices`,
//! `GetDeviceParameters`, `SetDeviceParameters`, `SendDeviceCommand`, `GetDeviceConfiguration`,
//! and `ParseDescriptionWritableParameters` as newline-delimited JSON requests read from stdin,
//! with one JSON response written to stdout per request. A production deployment would put a
//! real RPC transport in front of [`sparkmesh_integration::IntegrationBroker`]; this binary is a
//! protocol-agnostic demonstration harness, per spec.md §6 ("the transport for this surface is
//! chosen by the implementer").

mod config;
mod ingest;

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use sparkmesh_description::DeviceDescription;
use sparkmesh_integration::{Adapter, IntegrationBroker, SparkmeshAdapter};
use sparkmesh_mqtt::connection_settings::BrokerConnectionSettingsBuilder;
use sparkmesh_mqtt::interface::PubReceiver;
use sparkmesh_mqtt::session::{BrokerSession, SessionOptionsBuilder};
use sparkmesh_registry::{Registry, RegistryConfig};
use tokio_util::sync::CancellationToken;

use config::GatewayConfigBuilder;
use ingest::GatewayIngest;

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
            log::error!("integration gateway could not start: {message}");
            ExitCode::from(1)
        }
        Err(StartupOrRunError::BrokerUnreachable(message)) => {
            log::error!("integration gateway exiting, broker unreachable: {message}");
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
    let config = GatewayConfigBuilder::from_environment()
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
        .client_id("sparkmesh-integration-gateway".to_string())
        .build()
        .map_err(StartupOrRunError::Startup)?;
    let session_options = SessionOptionsBuilder::default()
        .connection_settings(connection_settings)
        .build()
        .map_err(|e| StartupOrRunError::Startup(e.to_string()))?;
    let mut session = BrokerSession::new(session_options).map_err(|e| StartupOrRunError::Startup(e.to_string()))?;
    let pub_sub = session.pub_sub();
    let exit_handle = session.get_session_exit_handle();

    let mgmt_filter = format!("{}/+/+/#", config.mgmt_prefix);
    let mut mgmt_rx = session
        .filtered_pub_receiver(&mgmt_filter, true)
        .map_err(|e| StartupOrRunError::Startup(e.to_string()))?;

    let (registry, registry_task) = Registry::spawn(RegistryConfig::default());
    let registry_driver = tokio::spawn(registry_task);

    let adapter = Arc::new(SparkmeshAdapter::new(registry.clone(), pub_sub, config.mgmt_prefix.clone()));
    let adapters: Vec<Box<dyn Adapter>> = vec![Box::new(AdapterHandle(adapter.clone()))];
    let mut broker = IntegrationBroker::new(adapters, config.strict_mode);
    if let Some(description) = description {
        broker = broker.with_description(description);
    }

    let ingest_cancel = CancellationToken::new();
    let ingest_task = {
        let cancel = ingest_cancel.clone();
        let mut ingest = GatewayIngest::new(registry, adapter);
        let mut sweep = tokio::time::interval(std::time::Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = sweep.tick() => ingest.sweep().await,
                    publish = mgmt_rx.recv() => {
                        let Some(publish) = publish else { break };
                        ingest.ingest(&publish).await;
                    }
                }
            }
        })
    };

    let repl_cancel = ingest_cancel.clone();
    let repl_task = tokio::task::spawn_blocking(move || run_repl(&broker, &repl_cancel));

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
            log::info!("interrupt received, shutting down integration gateway");
            let _ = exit_handle.exit_session().await;
            let _ = session_run.await;
            Err(StartupOrRunError::Interrupted)
        }
        _ = wait_for_repl(repl_task) => {
            log::info!("stdin closed, shutting down integration gateway");
            let _ = exit_handle.exit_session().await;
            let _ = session_run.await;
            Ok(())
        }
    };

    ingest_cancel.cancel();
    let _ = ingest_task.await;
    drop(registry_driver);
    outcome
}

async fn wait_for_repl(task: tokio::task::JoinHandle<()>) {
    let _ = task.await;
}

fn load_description(path: &str) -> Result<DeviceDescription, StartupOrRunError> {
    let xml = std::fs::read_to_string(path)
        .map_err(|e| StartupOrRunError::Startup(format!("description file {path}: {e}")))?;
    DeviceDescription::parse(&xml).map_err(|e| StartupOrRunError::Startup(format!("description file {path}: {e}")))
}

/// One newline-delimited stdin request (`op` selects the INTEGRATION operation; the remaining
/// fields are operation-specific).
#[derive(Debug, Deserialize)]
struct Request {
    op: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    verb: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, JsonValue>,
}

/// Blocking stdin/stdout request loop. Runs on a `spawn_blocking` thread since `io::Stdin` has
/// no async read primitive; each request is dispatched on a short-lived current-thread runtime
/// borrowed from the caller via `tokio::runtime::Handle`.
fn run_repl(broker: &IntegrationBroker, cancel: &CancellationToken) {
    let handle = tokio::runtime::Handle::current();
    let stdin = io::stdin();
    let stdout = io::stdout();
    for line in stdin.lock().lines() {
        if cancel.is_cancelled() {
            break;
        }
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle.block_on(dispatch(broker, &line));
        let mut out = stdout.lock();
        let _ = writeln!(out, "{response}");
        let _ = out.flush();
    }
}

async fn dispatch(broker: &IntegrationBroker, line: &str) -> JsonValue {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return serde_json::json!({"status": "error", "error": format!("malformed request: {e}")}),
    };

    let result = match request.op.as_str() {
        "DiscoverDevices" => broker.discover_devices().await.map(|d| serde_json::json!(d)),
        "GetDeviceParameters" => match request.device_id {
            Some(id) => broker.get_device_parameters(&id).await,
            None => return serde_json::json!({"status": "error", "error": "device_id is required"}),
        },
        "GetDeviceConfiguration" => match request.device_id {
            Some(id) => broker.get_device_configuration(&id).await,
            None => return serde_json::json!({"status": "error", "error": "device_id is required"}),
        },
        "SetDeviceParameters" => match request.device_id {
            Some(id) => broker.set_device_parameters(&id, request.params).await.map(|o| serde_json::json!(o)),
            None => return serde_json::json!({"status": "error", "error": "device_id is required"}),
        },
        "SendDeviceCommand" => match (request.device_id, request.verb) {
            (Some(id), Some(verb)) => broker.send_device_command(&id, &verb, request.params).await,
            _ => return serde_json::json!({"status": "error", "error": "device_id and verb are required"}),
        },
        "ParseDescriptionWritableParameters" => {
            let device_type = request.device_type.unwrap_or_default();
            broker
                .parse_description_writable_parameters(&device_type)
                .map(|p| serde_json::json!(p))
        }
        other => return serde_json::json!({"status": "error", "error": format!("unknown op {other}")}),
    };

    match result {
        Ok(value) => serde_json::json!({"status": "ok", "result": value}),
        Err(e) => serde_json::json!({"status": "error", "error": e.to_string()}),
    }
}

/// Adapts an `Arc<SparkmeshAdapter<P>>` to the object-safe [`Adapter`] trait so it can sit in
/// [`IntegrationBroker`]'s `Vec<Box<dyn Adapter>>` alongside any future non-MQTT adapter.
struct AdapterHandle<P: sparkmesh_mqtt::interface::MqttPubSub + Send + Sync>(Arc<SparkmeshAdapter<P>>);

#[async_trait::async_trait]
impl<P: sparkmesh_mqtt::interface::MqttPubSub + Send + Sync> Adapter for AdapterHandle<P> {
    async fn start(&self) -> Result<(), sparkmesh_integration::IntegrationError> {
        self.0.start().await
    }

    async fn stop(&self) -> Result<(), sparkmesh_integration::IntegrationError> {
        self.0.stop().await
    }

    async fn discover_devices(&self) -> Result<Vec<sparkmesh_integration::DeviceSummary>, sparkmesh_integration::IntegrationError> {
        self.0.discover_devices().await
    }

    async fn get_device_data(&self, device_id: &str) -> Result<JsonValue, sparkmesh_integration::IntegrationError> {
        self.0.get_device_data(device_id).await
    }

    async fn send_device_command(
        &self,
        device_id: &str,
        verb: &str,
        parameters: BTreeMap<String, JsonValue>,
    ) -> Result<JsonValue, sparkmesh_integration::IntegrationError> {
        self.0.send_device_command(device_id, verb, parameters).await
    }
}

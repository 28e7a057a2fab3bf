// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.
use std::time::Duration;

use env_logger::Builder;

use sparkmesh_mqtt::connection_settings::BrokerConnectionSettingsBuilder;
use sparkmesh_mqtt::control_packet::QoS;
use sparkmesh_mqtt::interface::MqttPubSub;
use sparkmesh_mqtt::session::{BrokerSession, SessionOptionsBuilder};

const CLIENT_ID: &str = "sparkmesh_example_client";
const HOSTNAME: &str = "localhost";
const PORT: u16 = 1883;
const TOPIC: &str = "hello/sparkmesh";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .init();

    let connection_settings = BrokerConnectionSettingsBuilder::default()
        .client_id(CLIENT_ID)
        .hostname(HOSTNAME)
        .tcp_port(PORT)
        .use_tls(false)
        .build()?;
    let session_options = SessionOptionsBuilder::default()
        .connection_settings(connection_settings)
        .build()?;

    let mut session = BrokerSession::new(session_options)?;
    let pub_sub = session.pub_sub();
    let exit_handle = session.get_session_exit_handle();

    let publisher = tokio::spawn(async move {
        for i in 0..10 {
            pub_sub
                .publish(TOPIC, QoS::AtLeastOnce, false, format!("message {i}"))
                .await
                .expect("publish should succeed");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        exit_handle.exit_session().await.ok();
    });

    session.run().await?;
    publisher.await?;
    Ok(())
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.
use env_logger::Builder;

use sparkmesh_mqtt::connection_settings::BrokerConnectionSettingsBuilder;
use sparkmesh_mqtt::session::{BrokerSession, ConnectionState, SessionOptionsBuilder};

const CLIENT_ID: &str = "sparkmesh_example_monitor";
const HOSTNAME: &str = "localhost";
const PORT: u16 = 1883;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .init();

    let connection_settings = BrokerConnectionSettingsBuilder::default()
        .client_id(CLIENT_ID)
        .hostname(HOSTNAME)
        .tcp_port(PORT)
        .use_tls(false)
        .build()?;
    let session_options = SessionOptionsBuilder::default()
        .connection_settings(connection_settings)
        .on_state_change(Box::new(|state: ConnectionState| {
            log::info!("connection state changed: {state:?}");
        }))
        .build()?;

    let mut session = BrokerSession::new(session_options)?;
    session.run().await?;
    Ok(())
}

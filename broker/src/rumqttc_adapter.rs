// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Adapter layer for the rumqttc crate

use std::{
    fmt,
    fs::{self, File},
    io::BufReader,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    self,
    tokio_rustls::rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
        ClientConfig, RootCertStore, SignatureScheme,
    },
    Transport,
};
use thiserror::Error;

use crate::connection_settings::BrokerConnectionSettings;
use crate::control_packet::{Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties};
use crate::error::{AckError, ConnectionError, DisconnectError, PublishError, SubscribeError, UnsubscribeError};
use crate::interface::{CompletionToken, Event, MqttAck, MqttDisconnect, MqttEventLoop, MqttPubSub};

pub type ClientAlias = rumqttc::v5::AsyncClient;
pub type EventLoopAlias = rumqttc::v5::EventLoop;

#[async_trait]
impl MqttPubSub for rumqttc::v5::AsyncClient {
    // NOTE: Ideally we would just directly return the result of the rumqttc notice future in a
    // Box without the intermediate .wait_async() step, but the rumqttc NoticeFuture does not
    // itself implement Future.

    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, PublishError> {
        let nf = self.publish(topic, qos, retain, payload).await?;
        Ok(CompletionToken(Box::new(nf.wait_async())))
    }

    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, PublishError> {
        let nf = self
            .publish_with_properties(topic, qos, retain, payload, properties)
            .await?;
        Ok(CompletionToken(Box::new(nf.wait_async())))
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<CompletionToken, SubscribeError> {
        let nf = self.subscribe(topic, qos).await?;
        Ok(CompletionToken(Box::new(nf.wait_async())))
    }

    async fn subscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        properties: SubscribeProperties,
    ) -> Result<CompletionToken, SubscribeError> {
        let nf = self
            .subscribe_with_properties(topic, qos, properties)
            .await?;
        Ok(CompletionToken(Box::new(nf.wait_async())))
    }

    async fn unsubscribe(
        &self,
        topic: impl Into<String> + Send,
    ) -> Result<CompletionToken, UnsubscribeError> {
        let nf = self.unsubscribe(topic).await?;
        Ok(CompletionToken(Box::new(nf.wait_async())))
    }

    async fn unsubscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, UnsubscribeError> {
        let nf = self.unsubscribe_with_properties(topic, properties).await?;
        Ok(CompletionToken(Box::new(nf.wait_async())))
    }
}

#[async_trait]
impl MqttAck for rumqttc::v5::AsyncClient {
    async fn ack(&self, publish: &Publish) -> Result<(), AckError> {
        Ok(self.ack(publish).await?)
    }
}

#[async_trait]
impl MqttDisconnect for rumqttc::v5::AsyncClient {
    async fn disconnect(&self) -> Result<(), DisconnectError> {
        Ok(self.disconnect().await?)
    }
}

#[async_trait]
impl MqttEventLoop for rumqttc::v5::EventLoop {
    async fn poll(&mut self) -> Result<Event, ConnectionError> {
        self.poll().await
    }

    fn set_clean_start(&mut self, clean_start: bool) {
        self.options.set_clean_start(clean_start);
    }
}

/// Build a rumqttc client/event loop pair from validated connection settings.
pub fn client(
    connection_settings: BrokerConnectionSettings,
    channel_capacity: usize,
) -> Result<(rumqttc::v5::AsyncClient, rumqttc::v5::EventLoop), ConnectionSettingsAdapterError> {
    // NOTE: channel capacity for AsyncClient must be less than usize::MAX - 1.
    let mqtt_options: rumqttc::v5::MqttOptions = connection_settings.try_into()?;
    Ok(rumqttc::v5::AsyncClient::new(mqtt_options, channel_capacity))
}

#[derive(Error, Debug)]
#[error("{msg}: {field}")]
pub struct ConnectionSettingsAdapterError {
    msg: String,
    field: ConnectionSettingsField,
    #[source]
    source: Option<Box<dyn std::error::Error>>,
}

#[derive(Debug)]
pub enum ConnectionSettingsField {
    SessionExpiry(Duration),
    PasswordFile(String),
    UseTls(bool),
}

impl fmt::Display for ConnectionSettingsField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSettingsField::SessionExpiry(v) => write!(f, "session expiry: {v:?}"),
            ConnectionSettingsField::PasswordFile(v) => write!(f, "password file: {v:?}"),
            ConnectionSettingsField::UseTls(v) => write!(f, "use tls: {v:?}"),
        }
    }
}

#[derive(Error, Debug)]
#[error("{msg}")]
pub struct TlsError {
    msg: String,
    source: Option<anyhow::Error>,
}

impl TlsError {
    pub fn new(msg: impl Into<String>) -> Self {
        TlsError {
            msg: msg.into(),
            source: None,
        }
    }
}

impl TryFrom<BrokerConnectionSettings> for rumqttc::v5::MqttOptions {
    type Error = ConnectionSettingsAdapterError;

    fn try_from(value: BrokerConnectionSettings) -> Result<Self, Self::Error> {
        let mut mqtt_options =
            rumqttc::v5::MqttOptions::new(value.client_id.clone(), value.hostname, value.tcp_port);
        mqtt_options.set_keep_alive(value.keep_alive);

        match value.session_expiry.as_secs().try_into() {
            Ok(se) => {
                // rumqttc panics on a session expiry below 5s
                if se < 5 {
                    return Err(ConnectionSettingsAdapterError {
                        msg: "session expiry must be at least 5 seconds".to_string(),
                        field: ConnectionSettingsField::SessionExpiry(value.session_expiry),
                        source: None,
                    });
                }
                mqtt_options.set_session_expiry_interval(Some(se));
            }
            Err(e) => {
                return Err(ConnectionSettingsAdapterError {
                    msg: "cannot convert session expiry to u32".to_string(),
                    field: ConnectionSettingsField::SessionExpiry(value.session_expiry),
                    source: Some(Box::new(e)),
                });
            }
        }

        mqtt_options.set_connection_timeout(value.connection_timeout.as_secs());
        mqtt_options.set_clean_start(value.clean_start);

        if let Some(username) = value.username {
            let password = if let Some(password_file) = value.password_file {
                match fs::read_to_string(&password_file) {
                    Ok(password) => password,
                    Err(e) => {
                        return Err(ConnectionSettingsAdapterError {
                            msg: "cannot read password file".to_string(),
                            field: ConnectionSettingsField::PasswordFile(password_file),
                            source: Some(Box::new(e)),
                        });
                    }
                }
            } else {
                value.password.unwrap_or_default()
            };
            mqtt_options.set_credentials(username, password);
        }

        if value.use_tls {
            let config = tls_config(
                value.insecure_skip_verify,
                value.ca_file,
                value.cert_file,
                value.key_file,
            )
            .map_err(|e| ConnectionSettingsAdapterError {
                msg: "tls config error".to_string(),
                field: ConnectionSettingsField::UseTls(true),
                source: Some(Box::new(TlsError {
                    msg: e.to_string(),
                    source: Some(e),
                })),
            })?;
            mqtt_options.set_transport(Transport::tls_with_config(
                rumqttc::TlsConfiguration::Rustls(Arc::new(config)),
            ));
        }

        Ok(mqtt_options)
    }
}

fn tls_config(
    insecure_skip_verify: bool,
    ca_file: Option<String>,
    cert_file: Option<String>,
    key_file: Option<String>,
) -> Result<ClientConfig, anyhow::Error> {
    let config_builder = if insecure_skip_verify {
        log::warn!("TLS server certificate verification is disabled; this must not be used in production");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification))
    } else if let Some(ca_file) = ca_file {
        let mut root_cert_store = RootCertStore::empty();
        let fh = File::open(ca_file)?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(fh)).collect::<Result<Vec<_>, _>>()?;
        root_cert_store.add_parsable_certificates(certs);
        ClientConfig::builder().with_root_certificates(root_cert_store)
    } else {
        let mut root_cert_store = RootCertStore::empty();
        let native_certs = rustls_native_certs::load_native_certs()?;
        for cert in native_certs {
            root_cert_store.add(cert)?;
        }
        ClientConfig::builder().with_root_certificates(root_cert_store)
    };

    let config = if let (Some(cert_file), Some(key_file)) = (cert_file, key_file) {
        let certs = {
            let fh = File::open(&cert_file)?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(fh)).collect::<Result<Vec<_>, _>>()?;
            if certs.is_empty() {
                return Err(TlsError::new("no valid client cert in cert file chain").into());
            }
            certs
        };
        let key = {
            let fh = File::open(&key_file)?;
            let mut key_reader = BufReader::new(fh);
            match rustls_pemfile::private_key(&mut key_reader) {
                Ok(Some(key)) => key,
                Ok(None) => return Err(TlsError::new("no valid client key in key file").into()),
                Err(e) => return Err(e.into()),
            }
        };
        config_builder.with_client_auth_cert(certs, key)?
    } else {
        config_builder.with_no_client_auth()
    };

    Ok(config)
}

/// A certificate verifier that accepts any server certificate. Used only when
/// `insecure_skip_verify` is set, for connecting to testbed brokers with self-signed or
/// unvalidated certificates.
#[derive(Debug)]
struct NoServerVerification;

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionSettingsAdapterError;
    use crate::BrokerConnectionSettingsBuilder;

    #[test]
    fn connection_settings_without_tls() {
        let connection_settings = BrokerConnectionSettingsBuilder::default()
            .client_id("test_client_id".to_string())
            .hostname("test_host".to_string())
            .use_tls(false)
            .build()
            .unwrap();
        let mqtt_options_result: Result<rumqttc::v5::MqttOptions, ConnectionSettingsAdapterError> =
            connection_settings.try_into();
        assert!(mqtt_options_result.is_ok());
    }

    #[test]
    fn connection_settings_with_insecure_skip_verify() {
        let connection_settings = BrokerConnectionSettingsBuilder::default()
            .client_id("test_client_id".to_string())
            .hostname("test_host".to_string())
            .use_tls(true)
            .insecure_skip_verify(true)
            .build()
            .unwrap();
        let mqtt_options_result: Result<rumqttc::v5::MqttOptions, ConnectionSettingsAdapterError> =
            connection_settings.try_into();
        assert!(mqtt_options_result.is_ok());
    }

    #[test]
    fn session_expiry_below_five_seconds_is_rejected() {
        let connection_settings = BrokerConnectionSettingsBuilder::default()
            .client_id("test_client_id".to_string())
            .hostname("test_host".to_string())
            .use_tls(false)
            .session_expiry(std::time::Duration::from_secs(1))
            .build()
            .unwrap();
        let mqtt_options_result: Result<rumqttc::v5::MqttOptions, ConnectionSettingsAdapterError> =
            connection_settings.try_into();
        assert!(mqtt_options_result.is_err());
    }
}

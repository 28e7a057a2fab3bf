// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generic MQTT connection settings implementations

use std::env::{self, VarError};
use std::time::Duration;

/// All the settings required to establish an MQTT connection to the broker shared by the
/// telemetry, management, and integration paths.
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct BrokerConnectionSettings {
    /// Client identifier
    pub(crate) client_id: String,
    /// FQDN or IP of the broker to connect to
    pub(crate) hostname: String,
    /// TCP port to connect to the broker on
    #[builder(default = "8883")]
    pub(crate) tcp_port: u16,
    /// Max time between communications
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) keep_alive: Duration,
    /// Session Expiry Interval
    #[builder(default = "Duration::from_secs(3600)")]
    pub(crate) session_expiry: Duration,
    /// Connection attempt timeout
    #[builder(default = "Duration::from_secs(30)")]
    pub(crate) connection_timeout: Duration,
    /// Clean start. Every participant in this system is a clean-session client; subscriptions
    /// are re-established by the facade itself after reconnect rather than relying on broker
    /// session state.
    #[builder(default = "true")]
    pub(crate) clean_start: bool,
    /// Username for the broker
    #[builder(default = "None")]
    pub(crate) username: Option<String>,
    /// Password for the broker
    #[builder(default = "None")]
    pub(crate) password: Option<String>,
    /// Path to a file containing the broker password
    #[builder(default = "None")]
    pub(crate) password_file: Option<String>,
    /// TLS negotiation enabled
    #[builder(default = "true")]
    pub(crate) use_tls: bool,
    /// Skip server certificate verification. Intended for testbeds only.
    #[builder(default = "false")]
    pub(crate) insecure_skip_verify: bool,
    /// Path to a PEM file used to validate server identity
    #[builder(default = "None")]
    pub(crate) ca_file: Option<String>,
    /// Path to a PEM file used to establish X509 client authentication
    #[builder(default = "None")]
    pub(crate) cert_file: Option<String>,
    /// Path to a file containing the key used to establish X509 client authentication
    #[builder(default = "None")]
    pub(crate) key_file: Option<String>,
    /// Max number of unacknowledged outbound publishes before `Backpressure` is returned
    #[builder(default = "100")]
    pub(crate) in_flight_max: u32,
    /// Max number of publishes that may be queued locally awaiting an in-flight slot
    #[builder(default = "1000")]
    pub(crate) queued_max: u32,
    /// Ceiling for the exponential reconnect backoff
    #[builder(default = "Duration::from_secs(60)")]
    pub(crate) reconnect_backoff_ceiling: Duration,
}

impl BrokerConnectionSettingsBuilder {
    /// Initialize the builder from environment variables.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of the environment variables are
    /// present but cannot be parsed.
    pub fn from_environment() -> Result<Self, String> {
        let client_id = string_from_environment("IOT_MQTT_CLIENT_ID")?;
        let hostname = string_from_environment("IOT_BROKER_HOSTNAME")?;
        let tcp_port = string_from_environment("IOT_BROKER_TCP_PORT")?
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| format!("IOT_BROKER_TCP_PORT: {e}"))?;
        let keep_alive = string_from_environment("IOT_MQTT_KEEP_ALIVE")?
            .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("IOT_MQTT_KEEP_ALIVE: {e}"))?;
        let session_expiry = string_from_environment("IOT_MQTT_SESSION_EXPIRY")?
            .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("IOT_MQTT_SESSION_EXPIRY: {e}"))?;
        let clean_start = string_from_environment("IOT_MQTT_CLEAN_START")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("IOT_MQTT_CLEAN_START: {e}"))?;
        let username = Some(string_from_environment("IOT_MQTT_USERNAME")?);
        let password_file = Some(string_from_environment("IOT_MQTT_PASSWORD_FILE")?);
        let use_tls = string_from_environment("IOT_MQTT_USE_TLS")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("IOT_MQTT_USE_TLS: {e}"))?;
        let insecure_skip_verify = string_from_environment("IOT_MQTT_INSECURE_SKIP_VERIFY")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("IOT_MQTT_INSECURE_SKIP_VERIFY: {e}"))?;
        let ca_file = Some(string_from_environment("IOT_TLS_CA_FILE")?);
        let cert_file = Some(string_from_environment("IOT_TLS_CERT_FILE")?);
        let key_file = Some(string_from_environment("IOT_TLS_KEY_FILE")?);
        let in_flight_max = string_from_environment("IOT_MQTT_IN_FLIGHT_MAX")?
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| format!("IOT_MQTT_IN_FLIGHT_MAX: {e}"))?;
        let queued_max = string_from_environment("IOT_MQTT_QUEUED_MAX")?
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| format!("IOT_MQTT_QUEUED_MAX: {e}"))?;
        let reconnect_backoff_ceiling =
            string_from_environment("IOT_MQTT_RECONNECT_BACKOFF_CEILING_S")?
                .map(|v| v.parse::<u32>().map(u64::from).map(Duration::from_secs))
                .transpose()
                .map_err(|e| format!("IOT_MQTT_RECONNECT_BACKOFF_CEILING_S: {e}"))?;

        // NOTE: Do not error on missing optional values here. It is valid to have empty values
        // if the caller will be overriding them on the returned builder; the eventual
        // .build() validation produces a clearer error once all overrides are applied.
        if client_id.is_none() {
            log::warn!("IOT_MQTT_CLIENT_ID is not set in environment");
        }
        if hostname.is_none() {
            log::warn!("IOT_BROKER_HOSTNAME is not set in environment");
        }

        Ok(Self {
            client_id,
            hostname,
            tcp_port,
            keep_alive,
            session_expiry,
            connection_timeout: Some(Duration::from_secs(30)),
            clean_start,
            username,
            password: None,
            password_file,
            use_tls,
            insecure_skip_verify,
            ca_file,
            cert_file,
            key_file,
            in_flight_max,
            queued_max,
            reconnect_backoff_ceiling,
        })
    }

    /// Validate the connection settings.
    ///
    /// # Errors
    /// Returns a `String` describing the error if
    /// - `hostname` or `client_id` is empty
    /// - `password` and `password_file` are both set
    /// - `key_file` is set and `cert_file` is not, or vice versa
    fn validate(&self) -> Result<(), String> {
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err("hostname cannot be empty".to_string());
            }
        }
        if let Some(client_id) = &self.client_id {
            if client_id.is_empty() {
                return Err("client_id cannot be empty".to_string());
            }
        }
        if let (Some(Some(_)), Some(Some(_))) = (&self.password, &self.password_file) {
            return Err(
                "password and password_file should not be used at the same time".to_string(),
            );
        }
        match (&self.key_file, &self.cert_file) {
            (Some(Some(key)), Some(Some(cert))) => {
                if key.is_empty() || cert.is_empty() {
                    return Err("key_file and cert_file need to be provided together".to_string());
                }
            }
            (Some(Some(_)), _) | (_, Some(Some(_))) => {
                return Err("key_file and cert_file need to be provided together".to_string());
            }
            _ => {}
        }
        Ok(())
    }
}

/// Helper function to get an environment variable as a string.
fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None), // Handled by the validate function if required
        Err(VarError::NotUnicode(_)) => {
            Err("Could not parse non-unicode environment variable".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn minimum_configuration() {
        let result = BrokerConnectionSettingsBuilder::default()
            .client_id("dev-A".to_string())
            .hostname("broker.local".to_string())
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn hostname_cannot_be_empty() {
        let result = BrokerConnectionSettingsBuilder::default()
            .client_id("dev-A".to_string())
            .hostname(String::new())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn client_id_cannot_be_empty() {
        let result = BrokerConnectionSettingsBuilder::default()
            .client_id(String::new())
            .hostname("broker.local".to_string())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn password_combos() {
        let result = BrokerConnectionSettingsBuilder::default()
            .client_id("dev-A".to_string())
            .hostname("broker.local".to_string())
            .password("hunter2".to_string())
            .password_file("/secrets/password".to_string())
            .build();
        assert!(result.is_err());

        let result = BrokerConnectionSettingsBuilder::default()
            .client_id("dev-A".to_string())
            .hostname("broker.local".to_string())
            .password("hunter2".to_string())
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn cert_file_key_file_combos() {
        let result = BrokerConnectionSettingsBuilder::default()
            .client_id("dev-A".to_string())
            .hostname("broker.local".to_string())
            .cert_file("cert.pem".to_string())
            .build();
        assert!(result.is_err());

        let result = BrokerConnectionSettingsBuilder::default()
            .client_id("dev-A".to_string())
            .hostname("broker.local".to_string())
            .cert_file("cert.pem".to_string())
            .key_file("key.pem".to_string())
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn defaults_are_clean_session_with_backpressure_windows() {
        let settings = BrokerConnectionSettingsBuilder::default()
            .client_id("dev-A".to_string())
            .hostname("broker.local".to_string())
            .build()
            .unwrap();
        assert!(settings.clean_start);
        assert_eq!(settings.in_flight_max, 100);
        assert_eq!(settings.queued_max, 1000);
        assert_eq!(settings.reconnect_backoff_ceiling, Duration::from_secs(60));
    }

    #[test]
    fn from_environment_full_configuration() {
        temp_env::with_vars(
            [
                ("IOT_MQTT_CLIENT_ID", Some("test-client-id")),
                ("IOT_BROKER_HOSTNAME", Some("test.hostname.com")),
                ("IOT_BROKER_TCP_PORT", Some("1883")),
                ("IOT_MQTT_KEEP_ALIVE", Some("60")),
                ("IOT_MQTT_SESSION_EXPIRY", Some("3600")),
                ("IOT_MQTT_CLEAN_START", Some("true")),
                ("IOT_MQTT_USERNAME", Some("test-username")),
                ("IOT_MQTT_PASSWORD_FILE", Some("/path/to/password/file")),
                ("IOT_MQTT_USE_TLS", Some("true")),
                ("IOT_MQTT_INSECURE_SKIP_VERIFY", Some("false")),
                ("IOT_TLS_CA_FILE", Some("/path/to/ca/file")),
            ],
            || {
                let builder = BrokerConnectionSettingsBuilder::from_environment().unwrap();
                assert_eq!(builder.client_id, Some("test-client-id".to_string()));
                assert_eq!(builder.hostname, Some("test.hostname.com".to_string()));
                assert_eq!(builder.tcp_port, Some(1883));
                assert_eq!(builder.keep_alive, Some(Duration::from_secs(60)));
                assert_eq!(builder.clean_start, Some(true));
                assert!(builder.build().is_ok());
            },
        );
    }

    #[test_case(None, None; "all required values missing")]
    #[test_case(Some("test-client-id"), None; "client id missing")]
    #[test_case(None, Some("test.hostname.com"); "hostname missing")]
    fn from_environment_missing_required_values(client_id: Option<&str>, hostname: Option<&str>) {
        temp_env::with_vars(
            [
                ("IOT_MQTT_CLIENT_ID", client_id),
                ("IOT_BROKER_HOSTNAME", hostname),
            ],
            || {
                let builder = BrokerConnectionSettingsBuilder::from_environment().unwrap();
                assert!(builder.build().is_err());
            },
        );
    }

    #[test_case("IOT_BROKER_TCP_PORT", "not numeric"; "tcp_port")]
    #[test_case("IOT_MQTT_KEEP_ALIVE", "not numeric"; "keep_alive")]
    #[test_case("IOT_MQTT_USE_TLS", "not boolean"; "use_tls")]
    fn from_environment_nonstring_value_parsing(env_var: &str, invalid_value: &str) {
        temp_env::with_vars(
            [
                ("IOT_MQTT_CLIENT_ID", Some("test-client-id")),
                ("IOT_BROKER_HOSTNAME", Some("test.hostname.com")),
                (env_var, Some(invalid_value)),
            ],
            || {
                assert!(BrokerConnectionSettingsBuilder::from_environment().is_err());
            },
        );
    }
}

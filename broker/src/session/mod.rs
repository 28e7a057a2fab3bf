// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT client providing a managed connection with automatic reconnection, bounded
//! publish/subscribe backpressure, and connection-state notifications.

mod dispatcher;
pub mod reconnect_policy;

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::connection_settings::BrokerConnectionSettings;
use crate::control_packet::{
    Publish, PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties,
};
use crate::error::{AckError, ConnectionError, PublishError, PublishErrorKind};
use crate::interface::{
    AckToken, CompletionToken, Event, Incoming, ManagedClient, MqttAck, MqttDisconnect,
    MqttEventLoop, MqttPubSub, PubReceiver,
};
use crate::rumqttc_adapter as adapter;
use crate::topic::{TopicFilter, TopicParseError};
use dispatcher::IncomingPublishDispatcher;
use reconnect_policy::{ExponentialBackoffWithJitter, ReconnectPolicy};

/// Error type for [`BrokerSession`]. The kind of error is specified by [`SessionErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct SessionError(#[from] SessionErrorKind);

/// Error kind for [`SessionError`].
#[derive(Error, Debug)]
pub enum SessionErrorKind {
    /// Invalid configuration options provided to the [`BrokerSession`].
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] adapter::ConnectionSettingsAdapterError),
    /// MQTT session was lost: the broker did not report the session as present after a reconnect.
    #[error("session state not present on broker after reconnect")]
    SessionLost,
    /// MQTT session ended due to an unrecoverable connection error.
    #[error(transparent)]
    ConnectionError(#[from] ConnectionError),
    /// Reconnect attempts were halted by the reconnect policy, ending the session.
    #[error("reconnection halted by reconnect policy")]
    ReconnectHalted,
    /// A force exit was requested while reconnect attempts were in progress.
    #[error("session exit forced during reconnect backoff")]
    ForceExit,
    /// The session ended up in an invalid state.
    #[error("{0}")]
    InvalidState(String),
}

/// Observable lifecycle state of a [`BrokerSession`]'s underlying connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Establishing the initial connection.
    Connecting,
    /// Connected and able to send/receive.
    Connected,
    /// Connection was lost and a reconnect attempt is being scheduled or in flight.
    Reconnecting,
    /// The session has ended; carries the broker-reported reason code, if any.
    Disconnected(Option<u8>),
}

/// Callback invoked whenever the session's [`ConnectionState`] changes.
pub type StateChangeCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Options for configuring a new [`BrokerSession`].
#[derive(Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct SessionOptions {
    /// Connection settings for configuring the [`BrokerSession`].
    pub connection_settings: BrokerConnectionSettings,
    #[builder(default = "Box::new(ExponentialBackoffWithJitter::default())")]
    /// Reconnect policy to be used by the session.
    pub reconnect_policy: Box<dyn ReconnectPolicy>,
    #[builder(default, setter(strip_option))]
    /// Callback invoked on every connection state transition.
    pub on_state_change: Option<StateChangeCallback>,
}

/// Client that manages a single MQTT session: connection, reconnection, backpressure, and
/// fan-out of incoming publishes to registered receivers.
pub struct BrokerSession {
    client: adapter::ClientAlias,
    event_loop: adapter::EventLoopAlias,
    client_id: String,
    incoming_pub_dispatcher: IncomingPublishDispatcher,
    unfiltered_rx: Option<Receiver<Publish>>,
    reconnect_policy: Box<dyn ReconnectPolicy>,
    on_state_change: Option<StateChangeCallback>,
    in_flight: Arc<Semaphore>,
    notify_force_exit: Arc<Notify>,
    cancel_token: CancellationToken,
    previously_run: bool,
}

impl BrokerSession {
    /// Create a new [`BrokerSession`] from the provided options.
    ///
    /// # Errors
    /// Returns a [`SessionError`] if the connection settings cannot be translated into a
    /// usable MQTT client configuration.
    pub fn new(options: SessionOptions) -> Result<Self, SessionError> {
        let client_id = options.connection_settings.client_id.clone();
        let queued_max = options.connection_settings.queued_max;
        let in_flight_max = options.connection_settings.in_flight_max;
        let (client, event_loop) =
            adapter::client(options.connection_settings, queued_max).map_err(SessionErrorKind::from)?;
        let (incoming_pub_dispatcher, unfiltered_rx) = IncomingPublishDispatcher::new(queued_max);
        Ok(BrokerSession {
            client,
            event_loop,
            client_id,
            incoming_pub_dispatcher,
            unfiltered_rx: Some(unfiltered_rx),
            reconnect_policy: options.reconnect_policy,
            on_state_change: options.on_state_change,
            in_flight: Arc::new(Semaphore::new(in_flight_max)),
            notify_force_exit: Arc::new(Notify::new()),
            cancel_token: CancellationToken::new(),
            previously_run: false,
        })
    }

    /// Return a handle that can be used to cleanly end the running session.
    pub fn get_session_exit_handle(&self) -> SessionExitHandle {
        SessionExitHandle {
            client: self.client.clone(),
            notify_force_exit: self.notify_force_exit.clone(),
            cancel_token: self.cancel_token.clone(),
        }
    }

    /// Return a [`SessionPubSub`] handle for sending outgoing messages, subject to the
    /// session's configured in-flight backpressure window.
    pub fn pub_sub(&self) -> SessionPubSub {
        SessionPubSub {
            client_id: self.client_id.clone(),
            client: self.client.clone(),
            in_flight: self.in_flight.clone(),
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        if let Some(cb) = &self.on_state_change {
            cb(state);
        }
    }

    /// Run the session. Blocks until either a graceful exit is requested or a fatal
    /// connection error is encountered.
    ///
    /// # Errors
    /// Returns a [`SessionError`] if the session ends due to a fatal connection error, a
    /// lost MQTT session, or exhaustion of the reconnect policy.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        if self.previously_run {
            return Err(SessionErrorKind::InvalidState(
                "session re-use is not supported; construct a new BrokerSession".to_string(),
            )
            .into());
        }
        self.previously_run = true;

        self.notify_state(ConnectionState::Connecting);

        let mut prev_connected = false;
        let mut prev_reconnect_attempts: u32 = 0;
        let mut result = Ok(());

        loop {
            let next = tokio::select! {
                biased;
                () = self.notify_force_exit.notified() => break,
                () = self.cancel_token.cancelled() => break,
                next = self.event_loop.poll() => next,
            };

            match next {
                Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                    prev_reconnect_attempts = 0;
                    log::debug!("incoming CONNACK: {connack:?}");

                    if prev_connected && !connack.session_present {
                        log::error!("session state not present on broker after reconnect");
                        result = Err(SessionErrorKind::SessionLost);
                        break;
                    }

                    prev_connected = true;
                    self.event_loop.set_clean_start(false);
                    self.notify_state(ConnectionState::Connected);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    log::debug!("incoming PUB: topic={:?} pkid={}", publish.topic, publish.pkid);
                    if let Err(e) = self.incoming_pub_dispatcher.dispatch_publish(&publish).await {
                        log::error!(
                            "could not dispatch publish with PKID {}: {e:?}",
                            publish.pkid
                        );
                        if publish.qos != QoS::AtMostOnce {
                            log::warn!(
                                "auto-acking undispatched publish PKID {} out of order",
                                publish.pkid
                            );
                            if let Err(ack_err) = self.client.ack(&publish).await {
                                log::error!("auto-ack failed for PKID {}: {ack_err:?}", publish.pkid);
                            }
                        }
                    }
                }
                Ok(_other) => {}

                // Graceful shutdown: rumqttc reports the disconnect as a state error.
                Err(ConnectionError::MqttState(_)) if self.cancel_token.is_cancelled() => {
                    self.notify_state(ConnectionState::Disconnected(None));
                    break;
                }

                // Broker rejected the connection outright; not recoverable.
                Err(ConnectionError::ConnectionRefused(rc)) => {
                    log::error!("connection refused, rc: {rc:?}");
                    self.notify_state(ConnectionState::Disconnected(Some(rc as u8)));
                    result = Err(SessionErrorKind::ConnectionError(
                        ConnectionError::ConnectionRefused(rc),
                    ));
                    break;
                }

                Err(e) => {
                    self.notify_state(ConnectionState::Disconnected(None));
                    log::error!("connection error: {e:?}");
                    self.notify_state(ConnectionState::Reconnecting);

                    if let Some(delay) = self
                        .reconnect_policy
                        .next_reconnect_delay(prev_reconnect_attempts, &e)
                    {
                        log::info!("attempting reconnect in {delay:?}");
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.notify_force_exit.notified() => {
                                result = Err(SessionErrorKind::ForceExit);
                                break;
                            }
                        }
                    } else {
                        log::info!("reconnect attempts halted by reconnect policy");
                        result = Err(SessionErrorKind::ReconnectHalted);
                        break;
                    }
                    prev_reconnect_attempts += 1;
                }
            }
        }

        self.notify_state(ConnectionState::Disconnected(None));
        result.map_err(SessionError::from)
    }

    /// Register a receiver for publishes matching `topic_filter`. If `auto_ack` is true,
    /// QoS 1 publishes are acknowledged as soon as they are received by the caller; otherwise
    /// the caller must ack manually via the [`AckToken`] yielded alongside each publish.
    ///
    /// # Errors
    /// Returns a [`TopicParseError`] if `topic_filter` is not a valid MQTT topic filter.
    pub fn filtered_pub_receiver(
        &mut self,
        topic_filter: &str,
        auto_ack: bool,
    ) -> Result<SessionPubReceiver, TopicParseError> {
        let topic_filter = TopicFilter::from_str(topic_filter)?;
        let rx = self.incoming_pub_dispatcher.register_filter(&topic_filter);
        Ok(SessionPubReceiver::new(rx, self.client.clone(), auto_ack))
    }

    /// Take the receiver for publishes that matched no registered filter. Returns `None` if
    /// already taken.
    pub fn take_unfiltered_pub_receiver(&mut self, auto_ack: bool) -> Option<SessionPubReceiver> {
        let rx = self.unfiltered_rx.take()?;
        Some(SessionPubReceiver::new(rx, self.client.clone(), auto_ack))
    }
}

/// Handle used to end a running [`BrokerSession`].
#[derive(Clone)]
pub struct SessionExitHandle {
    client: adapter::ClientAlias,
    notify_force_exit: Arc<Notify>,
    cancel_token: CancellationToken,
}

impl SessionExitHandle {
    /// Attempt a graceful disconnect, allowing the session's run loop to exit cleanly.
    ///
    /// # Errors
    /// Returns a [`SessionError`] if the disconnect could not be sent to the event loop.
    pub async fn exit_session(&self) -> Result<(), SessionError> {
        self.cancel_token.cancel();
        self.client
            .disconnect()
            .await
            .map_err(|e| SessionErrorKind::InvalidState(e.to_string()))?;
        Ok(())
    }

    /// Force an immediate exit without waiting for a graceful disconnect to complete.
    pub fn force_exit(&self) {
        self.cancel_token.cancel();
        self.notify_force_exit.notify_waiters();
    }
}

/// Send outgoing MQTT messages for publish, subscribe, and unsubscribe, subject to the
/// session's in-flight backpressure window.
#[derive(Clone)]
pub struct SessionPubSub {
    client_id: String,
    client: adapter::ClientAlias,
    in_flight: Arc<Semaphore>,
}

impl SessionPubSub {
    /// Client ID of the session that produced this handle.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl MqttPubSub for SessionPubSub {
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, PublishError> {
        let _permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PublishError::new(PublishErrorKind::DetachedClient))?;
        self.client.publish(topic, qos, retain, payload).await
    }

    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, PublishError> {
        let _permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PublishError::new(PublishErrorKind::DetachedClient))?;
        self.client
            .publish_with_properties(topic, qos, retain, payload, properties)
            .await
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<CompletionToken, crate::error::SubscribeError> {
        self.client.subscribe(topic, qos).await
    }

    async fn subscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        properties: SubscribeProperties,
    ) -> Result<CompletionToken, crate::error::SubscribeError> {
        self.client.subscribe_with_properties(topic, qos, properties).await
    }

    async fn unsubscribe(
        &self,
        topic: impl Into<String> + Send,
    ) -> Result<CompletionToken, crate::error::UnsubscribeError> {
        self.client.unsubscribe(topic).await
    }

    async fn unsubscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, crate::error::UnsubscribeError> {
        self.client.unsubscribe_with_properties(topic, properties).await
    }
}

/// Receive and (optionally manually) acknowledge incoming MQTT messages for a registered
/// topic filter.
pub struct SessionPubReceiver {
    pub_rx: Receiver<Publish>,
    client: adapter::ClientAlias,
    auto_ack: bool,
    unacked_count: AtomicU32,
}

impl SessionPubReceiver {
    fn new(pub_rx: Receiver<Publish>, client: adapter::ClientAlias, auto_ack: bool) -> Self {
        Self {
            pub_rx,
            client,
            auto_ack,
            unacked_count: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PubReceiver for SessionPubReceiver {
    async fn recv(&mut self) -> Option<Publish> {
        let publish = self.pub_rx.recv().await?;
        if self.auto_ack && publish.qos != QoS::AtMostOnce {
            if let Err(e) = self.client.ack(&publish).await {
                log::error!("auto-ack failed for PKID {}: {e:?}", publish.pkid);
            }
        }
        Some(publish)
    }

    async fn recv_manual_ack(&mut self) -> Option<(Publish, Option<AckToken>)> {
        let publish = self.pub_rx.recv().await?;
        let ack_token = if self.auto_ack || publish.qos == QoS::AtMostOnce {
            None
        } else {
            self.unacked_count.fetch_add(1, Ordering::SeqCst);
            Some(AckToken(publish.clone()))
        };
        Some((publish, ack_token))
    }

    fn close(&mut self) {
        self.pub_rx.close();
    }
}

#[async_trait]
impl MqttAck for SessionPubReceiver {
    async fn ack(&self, publish: &Publish) -> Result<(), AckError> {
        self.client.ack(publish).await?;
        self.unacked_count.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SessionPubReceiver {
    fn drop(&mut self) {
        self.pub_rx.close();
        while let Ok(publish) = self.pub_rx.try_recv() {
            log::warn!(
                "dropping SessionPubReceiver with unacked publish (PKID {}); auto-acking",
                publish.pkid
            );
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(e) = client.ack(&publish).await {
                    log::error!("drop-time auto-ack failed: {e:?}");
                }
            });
        }
    }
}

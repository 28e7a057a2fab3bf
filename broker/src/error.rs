// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types

use std::fmt;

use thiserror::Error;

/// Error type for broker connection issues (transport, protocol negotiation).
pub type ConnectionError = rumqttc::v5::ConnectionError;
/// Error type returned when a client request cannot be sent to the event loop.
pub type ClientError = rumqttc::ClientError;
/// Error type for completion tokens
pub type CompletionError = rumqttc::NoticeError;
/// Error subtype for broker connection error caused by state
pub type StateError = rumqttc::v5::StateError;

// NOTE: While these errors may seem redundant and candidates for consolidation, we need this
// flexibility because the same error types are used in both the low-level and high-level APIs.
// If the Client/ManagedClient/PubReceiver traits were concretized, we could simplify this.

/// Error executing a publish
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct PublishError {
    kind: PublishErrorKind,
}

impl PublishError {
    /// Create a new [`PublishError`]
    #[must_use]
    pub fn new(kind: PublishErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`PublishErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`PublishError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublishErrorKind {
    /// Client is detached from connection/event loop. Cannot send requests.
    DetachedClient,
    /// Invalid topic name provided
    InvalidTopicName,
    /// The configured in-flight or queued window is full
    Backpressure,
}

impl From<ClientError> for PublishError {
    fn from(_: ClientError) -> Self {
        PublishError::new(PublishErrorKind::DetachedClient)
    }
}

impl fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishErrorKind::DetachedClient => {
                write!(f, "client is detached from connection/event loop")
            }
            PublishErrorKind::InvalidTopicName => write!(f, "invalid topic name"),
            PublishErrorKind::Backpressure => write!(f, "publish window is full"),
        }
    }
}

/// Error executing a subscribe
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct SubscribeError {
    kind: SubscribeErrorKind,
}

impl SubscribeError {
    /// Create a new [`SubscribeError`]
    #[must_use]
    pub fn new(kind: SubscribeErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`SubscribeErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &SubscribeErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`SubscribeError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscribeErrorKind {
    /// Client is detached from connection/event loop. Cannot send requests.
    DetachedClient,
    /// Invalid topic filter provided
    InvalidTopicFilter,
}

impl From<ClientError> for SubscribeError {
    fn from(_: ClientError) -> Self {
        SubscribeError::new(SubscribeErrorKind::DetachedClient)
    }
}

impl fmt::Display for SubscribeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeErrorKind::DetachedClient => {
                write!(f, "client is detached from connection/event loop")
            }
            SubscribeErrorKind::InvalidTopicFilter => write!(f, "invalid topic filter"),
        }
    }
}

/// Error executing an unsubscribe
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct UnsubscribeError {
    kind: UnsubscribeErrorKind,
}

impl UnsubscribeError {
    /// Create a new [`UnsubscribeError`]
    #[must_use]
    pub fn new(kind: UnsubscribeErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`UnsubscribeErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &UnsubscribeErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`UnsubscribeError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnsubscribeErrorKind {
    /// Client is detached from connection/event loop. Cannot send requests.
    DetachedClient,
    /// Invalid topic filter provided
    InvalidTopicFilter,
}

impl From<ClientError> for UnsubscribeError {
    fn from(_: ClientError) -> Self {
        UnsubscribeError::new(UnsubscribeErrorKind::DetachedClient)
    }
}

impl fmt::Display for UnsubscribeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsubscribeErrorKind::DetachedClient => {
                write!(f, "client is detached from connection/event loop")
            }
            UnsubscribeErrorKind::InvalidTopicFilter => write!(f, "invalid topic filter"),
        }
    }
}

/// Error executing an ack
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct AckError {
    kind: AckErrorKind,
}

impl AckError {
    /// Create a new [`AckError`]
    #[must_use]
    pub fn new(kind: AckErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`AckErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &AckErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`AckError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckErrorKind {
    /// Client is detached from connection/event loop. Cannot send requests.
    DetachedClient,
    /// The publish has already been sufficiently acknowledged
    AlreadyAcked,
}

impl From<ClientError> for AckError {
    fn from(_: ClientError) -> Self {
        AckError::new(AckErrorKind::DetachedClient)
    }
}

impl fmt::Display for AckErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckErrorKind::DetachedClient => {
                write!(f, "client is detached from connection/event loop")
            }
            AckErrorKind::AlreadyAcked => write!(f, "publish already acknowledged"),
        }
    }
}

/// Error executing a disconnect
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct DisconnectError {
    kind: DisconnectErrorKind,
}

impl DisconnectError {
    /// Create a new [`DisconnectError`]
    #[must_use]
    pub fn new(kind: DisconnectErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`DisconnectErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &DisconnectErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`DisconnectError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectErrorKind {
    /// Client is detached from connection/event loop. Cannot send requests.
    DetachedClient,
}

impl From<ClientError> for DisconnectError {
    fn from(_: ClientError) -> Self {
        DisconnectError::new(DisconnectErrorKind::DetachedClient)
    }
}

impl fmt::Display for DisconnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectErrorKind::DetachedClient => {
                write!(f, "client is detached from connection/event loop")
            }
        }
    }
}

/// Error surfaced by the broker client facade. Mirrors the `TransportError` error kind
/// described for the facade: connect/TLS/auth failures and backpressure.
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct TransportError {
    kind: TransportErrorKind,
}

impl TransportError {
    /// Create a new [`TransportError`]
    #[must_use]
    pub fn new(kind: TransportErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`TransportErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`TransportError`]
#[derive(Clone, Debug)]
pub enum TransportErrorKind {
    /// Authentication with the broker failed; fatal to the connection.
    AuthFailed(String),
    /// TLS negotiation failed; fatal to the connection.
    TlsFailed(String),
    /// The broker could not be reached within the connection timeout.
    Unreachable(String),
    /// The in-flight or queued publish window is full.
    Backpressure,
    /// The broker sent a malformed or unexpected control packet.
    ProtocolError(String),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::AuthFailed(reason) => write!(f, "authentication failed: {reason}"),
            TransportErrorKind::TlsFailed(reason) => write!(f, "TLS negotiation failed: {reason}"),
            TransportErrorKind::Unreachable(reason) => write!(f, "broker unreachable: {reason}"),
            TransportErrorKind::Backpressure => write!(f, "publish window is full"),
            TransportErrorKind::ProtocolError(reason) => write!(f, "protocol error: {reason}"),
        }
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors raised by the durable-stream bridge.

use thiserror::Error;

/// Error raised constructing or driving a [`crate::producer::StreamProducer`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct BridgeError(#[from] BridgeErrorKind);

/// Kinds of [`BridgeError`].
#[derive(Debug, Error)]
pub enum BridgeErrorKind {
    /// The producer's client configuration was invalid.
    #[error("invalid producer configuration: {0}")]
    Config(String),
    /// The producer failed to deliver a record to the stream.
    #[error("failed to publish to stream topic {topic}: {reason}")]
    Publish {
        /// Destination stream topic.
        topic: String,
        /// Producer-reported failure reason.
        reason: String,
    },
}

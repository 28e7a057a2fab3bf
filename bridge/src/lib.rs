// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Durable-stream bridge: drains the broker's unfiltered publish stream, maps each MQTT topic
//! onto a stream topic, and republishes a device-stamped envelope onto a Kafka-compatible log.

pub mod config;
pub mod envelope;
pub mod error;
pub mod producer;
pub mod topic_map;

mod handle;

#[macro_use]
extern crate derive_builder;

pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use envelope::Envelope;
pub use error::BridgeError;
pub use handle::{Bridge, BridgeHandle};
pub use topic_map::TopicMap;

//----------------------------------------------------------------------

/// Include the README doc on a struct when running doctests to validate that the code in the
/// README can compile to verify that it has not rotted.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;

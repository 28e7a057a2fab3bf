// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Protocol-agnostic INTEGRATION broker facade (C11): routes
//! `DiscoverDevices`/`GetDeviceParameters`/`SetDeviceParameters`/`SendDeviceCommand`/
//! `GetDeviceConfiguration`/`ParseDescriptionWritableParameters` to whichever registered
//! [`adapter::Adapter`] owns the target device.

pub mod adapter;
pub mod broker;
pub mod error;
pub mod model;

pub use adapter::{Adapter, SparkmeshAdapter};
pub use broker::{IntegrationBroker, StrictMode};
pub use error::IntegrationError;
pub use model::{DeviceSummary, RejectedParam, SetParametersOutcome, WritableParameters};

//----------------------------------------------------------------------

/// Include the README doc on a struct when running doctests to validate that the code in the
/// README can compile to verify that it has not rotted.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

//! Message-level substrate for the sparkmesh dual-path telemetry fabric: the
//! binary metric codec and topic grammar, and the device-side/host-side
//! TELEMETRY and MGMT protocol engines built on top of them.

pub mod mgmt;
pub mod metric;
pub mod telemetry;
pub mod topic;

#[macro_use]
extern crate derive_builder;

#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The smart-breaker's `configure` validation and semantic command handling (spec.md §4.6:
//! "`configure(template|settings)` → apply via C10 validation"; "semantic operation commands
//! (`trip`, `close`, `reset`, etc.) are domain-specific and dispatched to a registered handler").

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use sparkmesh_description::DeviceDescription;
use sparkmesh_protocol::mgmt::device::{ConfigApplier, SemanticCommandHandler};

/// Shared breaker state the sensor reads and the command handlers mutate.
#[derive(Debug, Default)]
pub struct BreakerState {
    /// Current overcurrent pickup setting, amperes.
    pub overcurrent_pickup: f64,
    /// Whether the breaker is presently tripped.
    pub tripped: bool,
}

/// Validates `configure` settings against a loaded device-description and applies accepted
/// ones to the shared [`BreakerState`].
pub struct BreakerConfigApplier {
    description: Option<DeviceDescription>,
    state: Arc<Mutex<BreakerState>>,
}

impl BreakerConfigApplier {
    /// Build an applier, optionally validating against a loaded description.
    #[must_use]
    pub fn new(description: Option<DeviceDescription>, state: Arc<Mutex<BreakerState>>) -> Self {
        Self { description, state }
    }
}

impl ConfigApplier for BreakerConfigApplier {
    fn apply(&mut self, settings: &BTreeMap<String, JsonValue>) -> Result<JsonValue, String> {
        for name in settings.keys() {
            if let Some(description) = &self.description {
                if !description.is_writable(name) {
                    return Err(format!("{name} is not declared writable by any command or function"));
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        if let Some(value) = settings.get("overcurrent_pickup").and_then(JsonValue::as_f64) {
            state.overcurrent_pickup = value;
        }
        Ok(self.effective_configuration())
    }

    fn effective_configuration(&self) -> JsonValue {
        let state = self.state.lock().unwrap();
        serde_json::json!({ "overcurrent_pickup": state.overcurrent_pickup })
    }
}

/// Executes the breaker's domain-specific semantic commands against the shared
/// [`BreakerState`].
pub struct BreakerCommandHandler {
    state: Arc<Mutex<BreakerState>>,
}

impl BreakerCommandHandler {
    /// Build a handler over the given shared state.
    #[must_use]
    pub fn new(state: Arc<Mutex<BreakerState>>) -> Self {
        Self { state }
    }
}

impl SemanticCommandHandler for BreakerCommandHandler {
    fn handle(&mut self, verb: &str, _parameters: &BTreeMap<String, JsonValue>) -> Result<JsonValue, String> {
        let mut state = self.state.lock().unwrap();
        match verb {
            "trip" => {
                state.tripped = true;
                Ok(serde_json::json!({ "tripped": true }))
            }
            "close" | "reset" => {
                state.tripped = false;
                Ok(serde_json::json!({ "tripped": false }))
            }
            other => Err(format!("unrecognized semantic command: {other}")),
        }
    }
}

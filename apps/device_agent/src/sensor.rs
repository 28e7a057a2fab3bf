// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A synthetic smart-breaker sensor source, standing in for the physical/simulated sensor
//! hardware TELEMETRY engine (C4) is deliberately agnostic to.
//!
//! Grounded in `original_source/device-simulator/smart_breaker_simulator.py`'s
//! `_update_electrical_measurements`: rated load plus a slow sinusoidal daily cycle and small
//! per-sample jitter, rather than the original's full protection/harmonics model.

use std::f64::consts::PI;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use sparkmesh_protocol::metric::{Metric, Value};
use sparkmesh_protocol::telemetry::device::SensorSource;

/// Breaker electrical ratings, normally sourced from the device-description's declared
/// parameters.
#[derive(Debug, Clone, Copy)]
pub struct BreakerRatings {
    /// Rated current, amperes.
    pub rated_current: f64,
    /// Rated voltage, volts.
    pub rated_voltage: f64,
}

impl Default for BreakerRatings {
    fn default() -> Self {
        Self {
            rated_current: 100.0,
            rated_voltage: 480.0,
        }
    }
}

/// Samples a smart breaker's electrical measurements: load current, line voltage, and
/// enclosure temperature, each riding a slow sinusoidal cycle with independent jitter.
pub struct SmartBreakerSensor {
    ratings: BreakerRatings,
    started: SystemTime,
    /// Set by [`crate::commands::BreakerState`] when a trip has occurred; a tripped breaker
    /// reports near-zero current regardless of the load cycle.
    pub tripped: bool,
}

impl SmartBreakerSensor {
    /// Construct a sensor over the given ratings.
    #[must_use]
    pub fn new(ratings: BreakerRatings) -> Self {
        Self {
            ratings,
            started: SystemTime::now(),
            tripped: false,
        }
    }

    fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().map(|d| d.as_secs_f64()).unwrap_or(0.0)
    }
}

impl SensorSource for SmartBreakerSensor {
    fn sample(&mut self) -> Vec<Metric> {
        let now = now_ms();
        let mut rng = rand::thread_rng();

        let cycle = (2.0 * PI * self.elapsed_secs() / 86_400.0).sin();
        let current = if self.tripped {
            0.0
        } else {
            (self.ratings.rated_current * (0.6 + 0.2 * cycle) + rng.gen_range(-1.0..1.0)).max(0.0)
        };
        let voltage = self.ratings.rated_voltage * (1.0 + rng.gen_range(-0.02..0.02));
        let temperature = 35.0 + 10.0 * cycle.abs() + rng.gen_range(-0.5..0.5);

        vec![
            Metric::new("Current_A", now, Value::Double(current)),
            Metric::new("Voltage_V", now, Value::Double(voltage)),
            Metric::new("Temperature_C", now, Value::Double(temperature)),
            Metric::new("Tripped", now, Value::Boolean(self.tripped)),
        ]
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tripped_breaker_reports_zero_current() {
        let mut sensor = SmartBreakerSensor::new(BreakerRatings::default());
        sensor.tripped = true;
        let metrics = sensor.sample();
        let current = metrics.iter().find(|m| m.name == "Current_A").unwrap();
        assert_eq!(current.value, Value::Double(0.0));
    }

    #[test]
    fn untripped_breaker_reports_nonzero_current() {
        let mut sensor = SmartBreakerSensor::new(BreakerRatings::default());
        let metrics = sensor.sample();
        let current = metrics.iter().find(|m| m.name == "Current_A").unwrap();
        assert!(matches!(current.value, Value::Double(v) if v > 0.0));
    }

    #[test]
    fn birth_metrics_defaults_to_one_sample() {
        let mut sensor = SmartBreakerSensor::new(BreakerRatings::default());
        assert_eq!(sensor.birth_metrics().len(), 4);
    }
}

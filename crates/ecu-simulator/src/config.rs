//! Simulator tuning.

use std::time::Duration;

use ecu_core::Protocol;
use ecu_settings::SimulatorSettings;

/// Behaviour of every device in a simulated fleet.
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// Base period between heartbeat notifications.
    pub message_interval: Duration,
    /// Upper bound of the random delay added to each period.
    pub jitter: Duration,
    /// Probability that a command is answered with an error object.
    pub failure_rate: f64,
    /// Probability that a command is silently ignored.
    pub drop_rate: f64,
    /// Delay before a command is answered.
    pub response_delay: Duration,
    /// RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Methods answered with `MethodNotFound`.
    pub unsupported: Vec<String>,
    /// Protocol tag reported on connect.
    pub protocol: Protocol,
}

impl SimulatorConfig {
    /// Build from the `simulator` settings section.
    pub fn from_settings(settings: &SimulatorSettings) -> Self {
        Self {
            message_interval: Duration::from_millis(settings.message_interval_ms),
            jitter: Duration::from_millis(settings.jitter_ms),
            failure_rate: settings.failure_rate.clamp(0.0, 1.0),
            drop_rate: settings.drop_rate.clamp(0.0, 1.0),
            response_delay: Duration::from_millis(settings.response_delay_ms),
            seed: settings.seed,
            unsupported: Vec::new(),
            protocol: Protocol::Simulator,
        }
    }

    /// Mark `method` as unsupported.
    #[must_use]
    pub fn with_unsupported(mut self, method: impl Into<String>) -> Self {
        self.unsupported.push(method.into());
        self
    }

    pub(crate) fn is_unsupported(&self, method: &str) -> bool {
        self.unsupported.iter().any(|m| m == method)
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self::from_settings(&SimulatorSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_are_clamped() {
        let settings = SimulatorSettings {
            failure_rate: 1.5,
            drop_rate: -0.2,
            ..SimulatorSettings::default()
        };
        let config = SimulatorConfig::from_settings(&settings);
        assert!((config.failure_rate - 1.0).abs() < f64::EPSILON);
        assert!(config.drop_rate.abs() < f64::EPSILON);
        assert_eq!(config.message_interval, Duration::from_secs(30));
    }

    #[test]
    fn unsupported_methods() {
        let config = SimulatorConfig::default().with_unsupported("firmware_update");
        assert!(config.is_unsupported("firmware_update"));
        assert!(!config.is_unsupported("ping"));
    }
}

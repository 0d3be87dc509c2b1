use serde::Deserialize;
use std::time::Duration;

/// Defines a collection of fine-tune parameters for an
/// [exponential backoff](backoff::ExponentialBackoff) mechanism.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub(crate) initial_interval: Duration,
    pub(crate) max_interval: Duration,
    pub(crate) randomization_factor: f64,
    pub(crate) multiplier: f64,
    pub(crate) max_elapsed_time: Option<Duration>,
}

impl BackoffConfig {
    /// Exposes the
    /// [initial interval](backoff::ExponentialBackoffBuilder::with_initial_interval)
    /// of this exponential backoff definition.
    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    /// Exposes the
    /// [max interval](backoff::ExponentialBackoffBuilder::with_max_interval)
    /// of this exponential backoff definition.
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Exposes the
    /// [randomization factor](backoff::ExponentialBackoffBuilder::with_randomization_factor)
    /// of this exponential backoff definition.
    pub fn randomization_factor(&self) -> f64 {
        self.randomization_factor
    }

    /// Exposes the
    /// [multiplier](backoff::ExponentialBackoffBuilder::with_multiplier)
    /// of this exponential backoff definition.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Exposes the
    /// [max elapsed time](backoff::ExponentialBackoffBuilder::with_max_elapsed_time)
    /// of this exponential backoff definition.
    pub fn max_elapsed_time(&self) -> Option<Duration> {
        self.max_elapsed_time
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
            randomization_factor: 0.5,
            multiplier: 2.0,
            max_elapsed_time: None,
        }
    }
}

impl AsRef<BackoffConfig> for BackoffConfig {
    fn as_ref(&self) -> &BackoffConfig {
        self
    }
}

//! Exponential backoff for reconnecting sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;

/// Configuration for reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt
    pub multiplier: f64,
    /// Cap on any single delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Retries after the first attempt before giving up
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

/// Tracks retry count and computes the next delay
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    retries: u32,
    current_delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            retries: 0,
            current_delay: initial,
        }
    }

    /// Delay before the next retry, or `None` once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }
        self.retries += 1;

        let delay = self.current_delay.min(self.config.max_delay);
        self.current_delay = self
            .current_delay
            .mul_f64(self.config.multiplier)
            .min(self.config.max_delay);
        Some(delay)
    }

    /// Retries used so far
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

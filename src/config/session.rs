//! `[session]` section.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SessionConfig {
    /// Run the `get_controller` handshake before the first mutating command.
    pub auto_controller: bool,

    /// Pause after a successful handshake before the next command, in ms.
    #[validate(range(max = 10_000, message = "Settle delay must not exceed 10s"))]
    pub settle_delay_ms: u64,

    /// A heartbeat older than this (seconds) marks the link unhealthy.
    #[validate(range(min = 1, message = "Heartbeat max age must be at least 1s"))]
    pub heartbeat_max_age: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_controller: true,
            settle_delay_ms: 500,
            heartbeat_max_age: 30,
        }
    }
}

impl SessionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn heartbeat_max_age(&self) -> Duration {
        Duration::from_secs(self.heartbeat_max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.settle_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_heartbeat_age_rejected() {
        let config = SessionConfig {
            heartbeat_max_age: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

//! `[discovery]` section.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Addresses probed in every scan mode.
pub const DEFAULT_KNOWN_HOSTS: [&str; 5] = [
    "192.168.1.24",
    "192.168.1.55",
    "192.168.8.8",
    "192.168.1.1",
    "192.168.0.1",
];

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// `auto`, a single address, or an IPv4 CIDR such as `192.168.1.0/24`.
    #[validate(length(min = 1, message = "Discovery target cannot be empty"))]
    pub target: String,

    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Per-candidate heartbeat wait, in ms.
    #[validate(range(min = 100, max = 60_000))]
    pub probe_timeout_ms: u64,

    /// Probes in flight at once.
    #[validate(range(min = 1, max = 1024))]
    pub concurrency: usize,

    /// Interface subnets broader than this prefix are skipped.
    #[validate(range(min = 8, max = 32))]
    pub min_prefix: u8,

    #[validate(range(min = 1))]
    pub max_hosts_per_subnet: usize,

    #[validate(custom(function = "validate_known_hosts"))]
    pub known_hosts: Vec<String>,

    /// Hostname fragments identifying the robot's secondary radio.
    pub vendor_markers: Vec<String>,
}

fn validate_known_hosts(hosts: &[String]) -> Result<(), ValidationError> {
    match hosts.iter().find(|h| h.parse::<std::net::IpAddr>().is_err()) {
        Some(bad) => Err(ValidationError::new("invalid_known_host")
            .with_message(format!("Known host '{bad}' is not an IP address").into())),
        None => Ok(()),
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target: "auto".to_string(),
            port: 1883,
            probe_timeout_ms: 3000,
            concurrency: 50,
            min_prefix: 22,
            max_hosts_per_subnet: 1024,
            known_hosts: DEFAULT_KNOWN_HOSTS.iter().map(|h| h.to_string()).collect(),
            vendor_markers: vec!["yarbo".to_string(), "snowbot".to_string()],
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.known_hosts.len(), 5);
        assert_eq!(config.min_prefix, 22);
    }

    #[test]
    fn test_bad_known_host_rejected() {
        let config = DiscoveryConfig {
            known_hosts: vec!["192.168.1.24".into(), "robot.local".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = DiscoveryConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

//! Transport configuration.
//!
//! All fields carry `serde` defaults, so an empty `[transport]` table yields a
//! client for the factory default broker at `192.168.1.24:1883`. The serial
//! number is the only thing most deployments need to set.
//!
//! # Example
//!
//! ```toml
//! [transport]
//! host = "192.168.1.24"
//! port = 1883
//! sn = "24400102L8HO5227"
//! command_timeout_ms = 5000
//!
//! [transport.tls]
//! ca_cert_path = "/etc/yardlink/ca.crt"
//! ```

use std::{
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::{
    backoff::Backoff,
    router::DEFAULT_MAILBOX_CAPACITY,
    topic::{self, DEFAULT_NAMESPACE},
};

pub const DEFAULT_HOST: &str = "192.168.1.24";
pub const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// First topic segment. Current firmware uses `snowbot`.
    #[validate(
        length(min = 1, max = 64, message = "Namespace must be 1-64 characters"),
        custom(function = "validate_topic_segment")
    )]
    pub namespace: String,

    /// Broker hostname or IP address.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Device serial number. Required to address commands; may be left empty
    /// when the configuration is only used for discovery.
    #[validate(
        length(max = 64, message = "Serial must not exceed 64 characters"),
        custom(function = "validate_topic_segment")
    )]
    pub sn: String,

    /// Client id prefix. The id sent to the broker is `{prefix}-{sn}-{unix_ts}`.
    #[validate(length(min = 1, max = 32, message = "Client prefix must be 1-32 characters"))]
    pub client_prefix: String,

    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Seconds `connect()` waits for the first CONNACK.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connect timeout must be between 1 and 300 seconds"
    ))]
    pub connect_timeout: u64,

    /// Default wait for a command acknowledgement, in milliseconds.
    #[validate(range(
        min = 100,
        max = 300_000,
        message = "Command timeout must be between 100ms and 300s"
    ))]
    pub command_timeout_ms: u64,

    pub clean_session: bool,

    #[validate(range(
        min = 1024,
        max = 16_777_216,
        message = "Max packet size must be between 1KB and 16MB"
    ))]
    pub max_packet_size: Option<u32>,

    /// Capacity of the rumqttc request channel.
    #[validate(range(
        min = 1,
        max = 4096,
        message = "Request channel capacity must be between 1 and 4096"
    ))]
    pub request_channel_capacity: usize,

    /// Envelopes buffered per waiter before the oldest is evicted.
    #[validate(range(
        min = 1,
        max = 100_000,
        message = "Mailbox capacity must be between 1 and 100000"
    ))]
    pub mailbox_capacity: usize,

    /// Device-direction leaves subscribed on every (re)connect.
    #[validate(length(min = 1, message = "At least one feedback leaf is required"))]
    pub feedback_leaves: Vec<String>,

    /// First delay between reconnect polls, in seconds.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    #[validate(range(
        min = 1,
        max = 600,
        message = "Reconnect max delay must be between 1 and 600 seconds"
    ))]
    pub reconnect_max_delay: u64,

    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Reconnect multiplier must be between 1.0 and 10.0"
    ))]
    pub reconnect_multiplier: f64,

    /// Consecutive failed polls before the kernel gives up. Unlimited if unset.
    pub max_reconnect_attempts: Option<u32>,

    pub username: Option<String>,

    pub password: Option<String>,

    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: DEFAULT_NAMESPACE.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            sn: String::new(),
            client_prefix: "yardlink".to_string(),
            keep_alive: 60,
            connect_timeout: 10,
            command_timeout_ms: 5000,
            clean_session: true,
            max_packet_size: Some(1_048_576),
            request_channel_capacity: 64,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            feedback_leaves: topic::feedback::ALL.iter().map(|s| s.to_string()).collect(),
            reconnect_delay: 1,
            reconnect_max_delay: 30,
            reconnect_multiplier: 1.5,
            max_reconnect_attempts: None,
            username: None,
            password: None,
            tls: None,
        }
    }
}

impl Config {
    /// Defaults pointed at a specific broker and device.
    pub fn for_device(host: impl Into<String>, port: u16, sn: impl Into<String>) -> Self {
        Config {
            host: host.into(),
            port,
            sn: sn.into(),
            ..Default::default()
        }
    }

    /// A fresh client id, `{prefix}-{sn}-{unix_ts}`.
    ///
    /// Falls back to a UUID in place of the serial when none is configured.
    pub fn client_id(&self) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        if self.sn.is_empty() {
            format!("{}-{}", self.client_prefix, Uuid::new_v4().simple())
        } else {
            format!("{}-{}-{}", self.client_prefix, self.sn, ts)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.reconnect_delay),
            Duration::from_secs(self.reconnect_max_delay),
            self.reconnect_multiplier,
        )
        .with_attempt_limit(self.max_reconnect_attempts)
    }

    /// Full device-direction topics for every configured feedback leaf.
    pub fn feedback_topics(&self) -> Vec<String> {
        self.feedback_leaves
            .iter()
            .map(|leaf| topic::build(&self.namespace, &self.sn, leaf, topic::Direction::Device))
            .collect()
    }
}

/// TLS material for brokers that require it (cloud relay, hardened setups).
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct TlsConfig {
    #[validate(custom(function = "validate_file_path"))]
    pub ca_cert_path: Option<String>,

    #[validate(custom(function = "validate_file_path"))]
    pub client_cert_path: Option<String>,

    #[validate(custom(function = "validate_file_path"))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    pub fn with_client_auth(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Both halves of a client identity, if configured.
    pub fn client_auth(&self) -> Option<(&str, &str)> {
        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }

    /// Checks the combination of paths, beyond per-field existence.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = &self.ca_cert_path else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new("incomplete_client_auth").with_message(
                    "Both client certificate and key must be provided or neither".into(),
                ));
            }
        }
        Ok(())
    }
}

fn validate_topic_segment(segment: &str) -> Result<(), ValidationError> {
    if segment.contains(['/', '+', '#']) {
        return Err(ValidationError::new("invalid_topic_segment")
            .with_message(format!("'{segment}' must not contain '/', '+' or '#'").into()));
    }
    Ok(())
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }
    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }
    Ok(())
}

//! Connection state published by the connection kernel.
//!
//! The kernel owns a `tokio::sync::watch` sender of [`ConnectionState`];
//! the transport and anyone else interested hold receivers.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ConnAck──▶ Connected
//!      ▲                                                 │
//!      │                                          link lost
//!      │                                                 ▼
//!  shutdown ◀── Reconnecting(delay) ◀────────────── Disconnected(reason)
//!                      │
//!                      └──ConnAck──▶ Connected
//! ```

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Sending CONNECT and waiting for CONNACK.
    Connecting,

    /// Session established and feedback subscriptions issued.
    Connected,

    /// No session. The string carries the reason; empty before the first
    /// connect and after an explicit shutdown.
    Disconnected(String),

    /// Waiting `f64` seconds before polling the event loop again.
    Reconnecting(f64),
}

impl ConnectionState {
    /// Short name without the attached reason or delay.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnected(_) => "Disconnected",
            Self::Reconnecting(_) => "Reconnecting",
        }
    }

    fn reason(&self) -> Option<String> {
        match self {
            Self::Disconnected(why) if !why.is_empty() => Some(why.clone()),
            Self::Reconnecting(delay) => Some(format!("retry in {delay}s")),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == Self::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected(String::new())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{} ({reason})", self.label()),
            None => f.write_str(self.label()),
        }
    }
}

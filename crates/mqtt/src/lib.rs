//! # yardlink-mqtt: transport layer for yard robot brokers
//!
//! Talks to the MQTT broker that runs on the robot's data-center board.
//! Built on `rumqttc`, this crate adds:
//!
//! - **Topic addressing** for the `{ns}/{sn}/{app|device}/{leaf}` scheme
//! - **Payload codec**: zlib-compressed JSON with plain-JSON and raw fallbacks
//! - **Mailbox routing**: every subscriber gets its own bounded queue, so a
//!   command reply that arrives before anyone waits is never lost
//! - **Automatic reconnection** with exponential backoff and resubscription
//! - **Heartbeat sniffing** for LAN discovery
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     Session layer (yardlink crate)   │
//! │   written against `Transport`        │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │     MqttTransport                    │
//! │ publish, wait_for_message, streams   │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │  dispatcher task                     │
//! │  codec::decode once → Router         │
//! └────────────┬─────────────────────────┘
//!              │ KernelEvent
//! ┌────────────▼─────────────────────────┐
//! │  ConnectionKernel                    │
//! │  polls rumqttc EventLoop, backoff    │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Correlating a command with its reply
//!
//! ```ignore
//! use yardlink_mqtt::{topic, MqttTransport, Transport, Config};
//!
//! let transport = MqttTransport::new(Config::for_device("192.168.1.24", 1883, "SN1"))?;
//! transport.connect().await?;
//!
//! // Register first, then publish: the reply is buffered even if it beats us.
//! let queue = transport.create_wait_queue();
//! transport.publish(topic::command::GET_CONTROLLER, &serde_json::json!({})).await?;
//! let reply = transport
//!     .wait_for_message(
//!         std::time::Duration::from_secs(5),
//!         topic::feedback::DATA_FEEDBACK,
//!         Some(topic::command::GET_CONTROLLER),
//!         Some(queue),
//!     )
//!     .await?;
//! ```
//!
//! # Connection lifecycle
//!
//! ```text
//! Connecting ──(CONNACK)──> Connected ──(network error)──> Disconnected
//!     ▲                                                        │
//!     └──────(delay elapsed)── Reconnecting(secs) <──(backoff)─┘
//! ```
//!
//! A failure before the first CONNACK is not retried: `connect` reports it.

// Module declarations
pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod probe;
pub mod router;
pub mod state;
pub mod topic;
pub mod transport;

// Re-exports: Configuration
pub use config::{Config, TlsConfig};
// Re-exports: Messages
//
// Every inbound payload reaches callers as an Envelope
pub use envelope::Envelope;
// Re-exports: Error handling
pub use error::TransferError;
// Re-exports: Routing
pub use router::{Router, WaitQueue};
// Re-exports: State monitoring
pub use state::ConnectionState;
// Re-exports: Transport seam
//
// The session layer depends on the trait, not on MqttTransport
pub use transport::{EnvelopeStream, MqttTransport, ReconnectCallback, Transport};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransferError>;

//! yardlink: local-network client for robotic yard machines
//!
//! Controls a robot mower / snow blower through the MQTT broker running on
//! the machine itself, with no cloud account involved.
//!
//! ## Modules
//!
//! * `config`: TOML configuration with `validator` rules: logger, transport,
//!   session and discovery sections.
//!
//! * `session`: [`session::LocalClient`]: controller handshake, correlated
//!   and fire-and-forget commands, typed telemetry, heartbeat health.
//!
//! * `discovery`: finds robot brokers on the LAN, classifies their link
//!   role and ranks them.
//!
//! * `orchestrator`: failover across discovered endpoints and the lazily
//!   built cloud collaborator.
//!
//! * `model`: typed views over device payloads.
//!
//! * `logger`: `tracing` subscriber setup (console, optional journald).
//!
//! The MQTT plumbing (codec, topics, mailboxes, reconnection) lives in the
//! `yardlink-mqtt` workspace crate.
//!
//! ## Features
//!
//! * `journald`: adds a systemd journal output to the logger.

pub mod cloud;
pub mod config;
pub mod discovery;
pub mod logger;
pub mod model;
pub mod orchestrator;
pub mod session;

pub use session::LocalClient;
pub use yardlink_mqtt as mqtt;

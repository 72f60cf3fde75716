//! Topic addressing for the device protocol.
//!
//! Every topic has exactly four segments:
//!
//! ```text
//! {namespace}/{serial}/{app|device}/{leaf}
//!    snowbot / 24400102L8HO5227 / app / light_ctrl      (commands, client -> device)
//!    snowbot / 24400102L8HO5227 / device / DeviceMSG    (feedback, device -> client)
//! ```
//!
//! Functions here are pure and never fail: malformed input parses to
//! `("", "")` so that the dispatcher and discovery can treat "unknown" as an
//! ordinary value.

use std::fmt;

/// Default first topic segment used by current firmware.
pub const DEFAULT_NAMESPACE: &str = "snowbot";

/// Leaf names published by the client (app direction).
pub mod command {
    pub const GET_CONTROLLER: &str = "get_controller";
    pub const LIGHT_CTRL: &str = "light_ctrl";
    pub const CMD_BUZZER: &str = "cmd_buzzer";
    pub const CMD_CHUTE: &str = "cmd_chute";
    pub const START_PLAN: &str = "start_plan";
    pub const STOP_PLAN: &str = "stop_plan";
    pub const PAUSE_PLAN: &str = "pause_plan";
    pub const RESUME_PLAN: &str = "resume_plan";
    pub const CMD_RECHARGE: &str = "cmd_recharge";
}

/// Leaf names published by the device (device direction).
pub mod feedback {
    /// Full telemetry snapshot, roughly 1-2 Hz.
    pub const DEVICE_MSG: &str = "DeviceMSG";
    /// Plain (uncompressed) JSON liveness beacon.
    pub const HEART_BEAT: &str = "heart_beat";
    /// Command acknowledgements: `{"topic": cmd, "state": code, "data": {...}}`.
    pub const DATA_FEEDBACK: &str = "data_feedback";
    /// Job progress merged into telemetry.
    pub const PLAN_FEEDBACK: &str = "plan_feedback";
    pub const RECHARGE_FEEDBACK: &str = "recharge_feedback";
    pub const OTA_FEEDBACK: &str = "ota_feedback";
    pub const PATROL_FEEDBACK: &str = "patrol_feedback";
    pub const CLOUD_POINTS_FEEDBACK: &str = "cloud_points_feedback";
    pub const DEVICEINFO_FEEDBACK: &str = "deviceinfo_feedback";
    pub const LOG_FEEDBACK: &str = "log_feedback";
    pub const A_PROPERTY_1_FEEDBACK: &str = "a_property_1_feedback";

    /// Subscribed on every (re)connect.
    pub const ALL: [&str; 11] = [
        DEVICE_MSG,
        HEART_BEAT,
        DATA_FEEDBACK,
        PLAN_FEEDBACK,
        RECHARGE_FEEDBACK,
        OTA_FEEDBACK,
        PATROL_FEEDBACK,
        CLOUD_POINTS_FEEDBACK,
        DEVICEINFO_FEEDBACK,
        LOG_FEEDBACK,
        A_PROPERTY_1_FEEDBACK,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to device.
    App,
    /// Device to client.
    Device,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::App => "app",
            Direction::Device => "device",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn build(namespace: &str, serial: &str, leaf: &str, direction: Direction) -> String {
    format!("{namespace}/{serial}/{direction}/{leaf}")
}

/// Device-direction filter for `leaf` across every serial, e.g.
/// `snowbot/+/device/heart_beat`.
pub fn wildcard(namespace: &str, leaf: &str) -> String {
    build(namespace, "+", leaf, Direction::Device)
}

/// Splits a topic into `(serial, leaf)`.
///
/// Returns `("", "")` unless the topic has exactly four non-empty segments
/// with a known direction in third position.
pub fn parse(topic: &str) -> (String, String) {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [ns, serial, dir, leaf]
            if !ns.is_empty()
                && !serial.is_empty()
                && !leaf.is_empty()
                && (*dir == "app" || *dir == "device") =>
        {
            (serial.to_string(), leaf.to_string())
        }
        _ => (String::new(), String::new()),
    }
}

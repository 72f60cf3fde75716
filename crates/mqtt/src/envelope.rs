//! Decoded inbound message.

use std::{fmt, sync::Arc};

use serde_json::Value;

use super::topic;

/// An inbound message paired with its topic, after decoding.
///
/// Cloning is cheap: the dispatcher hands the same envelope to every
/// registered mailbox.
#[derive(Clone)]
pub struct Envelope {
    inner: Arc<Inner>,
}

struct Inner {
    topic: String,
    serial: String,
    kind: String,
    payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        let topic = topic.into();
        let (serial, kind) = topic::parse(&topic);
        Self {
            inner: Arc::new(Inner {
                topic,
                serial,
                kind,
                payload,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Device serial from the topic, `""` if the topic is malformed.
    pub fn serial(&self) -> &str {
        &self.inner.serial
    }

    /// The topic leaf, e.g. `DeviceMSG` or `data_feedback`.
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// The command name echoed in an acknowledgement payload (`"topic"` key).
    pub fn echoed_command(&self) -> Option<&str> {
        self.inner.payload.get("topic").and_then(Value::as_str)
    }

    /// `true` if this envelope arrived on `leaf` and, when `command` is
    /// given, echoes that command name.
    pub fn matches(&self, leaf: &str, command: Option<&str>) -> bool {
        if self.kind() != leaf {
            return false;
        }
        match command {
            Some(cmd) => self.echoed_command() == Some(cmd),
            None => true,
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("topic", &self.inner.topic)
            .field("payload", &self.inner.payload)
            .finish()
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.topic() == other.topic() && self.payload() == other.payload()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_parses_topic() {
        let env = Envelope::new("snowbot/SN1/device/DeviceMSG", json!({"battery": 90}));
        assert_eq!(env.serial(), "SN1");
        assert_eq!(env.kind(), "DeviceMSG");
        assert_eq!(env.payload()["battery"], 90);
    }

    #[test]
    fn test_matches_leaf_and_command() {
        let ack = Envelope::new(
            "snowbot/SN1/device/data_feedback",
            json!({"topic": "get_controller", "state": 0, "data": {}}),
        );
        assert!(ack.matches("data_feedback", None));
        assert!(ack.matches("data_feedback", Some("get_controller")));
        assert!(!ack.matches("data_feedback", Some("start_plan")));
        assert!(!ack.matches("DeviceMSG", None));
    }

    #[test]
    fn test_command_filter_on_payload_without_topic() {
        let env = Envelope::new("snowbot/SN1/device/data_feedback", json!({"state": 0}));
        assert!(!env.matches("data_feedback", Some("get_controller")));
    }
}

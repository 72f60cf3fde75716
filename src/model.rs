//! Typed views over device payloads.
//!
//! Only the fields the client itself acts on are typed. Everything else stays
//! reachable through the `raw` document carried by each record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Acknowledgement published on `data_feedback`.
///
/// ```json
/// {"topic": "start_plan", "state": 0, "data": {}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(default)]
    pub topic: String,
    /// `-1` when the device left it out.
    #[serde(default = "unknown_state")]
    pub state: i64,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn unknown_state() -> i64 {
    -1
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for CommandResult {
    fn default() -> Self {
        Self {
            topic: String::new(),
            state: unknown_state(),
            data: empty_object(),
        }
    }
}

impl CommandResult {
    /// A document that does not fit the shape at all (wrong field types)
    /// reads as a failed result with the raw document in `data`.
    pub fn from_value(doc: &Value) -> Self {
        serde_json::from_value(doc.clone()).unwrap_or_else(|_| Self {
            data: doc.clone(),
            ..Self::default()
        })
    }

    pub fn success(&self) -> bool {
        self.state == 0
    }
}

/// Brightness of the seven LED channels, 0 (off) to 255.
///
/// The firmware rejects booleans, so every channel is serialized as an
/// integer even when only on/off is meant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightState {
    pub led_head: u8,
    pub led_left_w: u8,
    pub led_right_w: u8,
    pub body_left_r: u8,
    pub body_right_r: u8,
    pub tail_left_r: u8,
    pub tail_right_r: u8,
}

impl LightState {
    pub fn all_on() -> Self {
        Self {
            led_head: 255,
            led_left_w: 255,
            led_right_w: 255,
            body_left_r: 255,
            body_right_r: 255,
            tail_left_r: 255,
            tail_right_r: 255,
        }
    }

    pub fn all_off() -> Self {
        Self::default()
    }

    /// Red body accents only.
    pub fn body_only() -> Self {
        Self {
            body_left_r: 255,
            body_right_r: 255,
            ..Self::default()
        }
    }

    /// `light_ctrl` payload.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| empty_object())
    }
}

/// Snapshot projected from a `DeviceMSG` document.
///
/// Firmware revisions disagree on key names (`battery`/`bat`, `posX`/`x`...),
/// so each field tries the current name first. Absent fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub sn: String,
    pub battery: Option<i64>,
    pub state: Option<Value>,
    pub error_code: Option<Value>,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    /// Hardware LED status register, not the controllable channel state.
    pub led: Option<i64>,

    // Merged in from the latest plan_feedback.
    pub plan_id: Option<Value>,
    pub plan_state: Option<Value>,
    pub area_covered: Option<f64>,
    pub duration: Option<f64>,

    pub raw: Value,
}

fn field<'a>(doc: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| doc.get(key))
        .find(|value| !value.is_null())
}

impl Telemetry {
    pub fn from_value(doc: &Value) -> Self {
        Self {
            sn: field(doc, &["sn"])
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            battery: field(doc, &["battery", "bat"]).and_then(Value::as_i64),
            state: field(doc, &["state", "workState"]).cloned(),
            error_code: field(doc, &["errorCode", "err"]).cloned(),
            position_x: field(doc, &["posX", "x"]).and_then(Value::as_f64),
            position_y: field(doc, &["posY", "y"]).and_then(Value::as_f64),
            heading: field(doc, &["heading", "yaw"]).and_then(Value::as_f64),
            speed: field(doc, &["speed"]).and_then(Value::as_f64),
            led: field(doc, &["led"]).and_then(Value::as_i64),
            raw: doc.clone(),
            ..Self::default()
        }
    }

    /// Copies plan progress from a `plan_feedback` document.
    pub fn merge_plan(&mut self, plan: &Map<String, Value>) {
        self.plan_id = plan.get("planId").cloned();
        self.plan_state = plan.get("state").cloned();
        self.area_covered = plan.get("areaCovered").and_then(Value::as_f64);
        self.duration = plan.get("duration").and_then(Value::as_f64);
    }
}

/// Plain-JSON liveness beacon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    pub working_state: Option<i64>,
}

impl Heartbeat {
    /// `None` unless `doc` is a JSON object shaped like a heartbeat.
    pub fn from_value(doc: &Value) -> Option<Self> {
        if !doc.is_object() {
            return None;
        }
        serde_json::from_value(doc.clone()).ok()
    }
}

/// Robot bound to a cloud account.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Robot {
    pub sn: String,
    pub name: String,
    pub model: String,
    pub firmware: String,
    pub is_online: bool,
    pub raw: Value,
}

impl Robot {
    pub fn from_value(doc: &Value) -> Self {
        let text = |keys: &[&str]| {
            field(doc, keys)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            sn: text(&["sn", "serialNum"]),
            name: text(&["name", "robotName", "snowbotName"]),
            model: text(&["model", "robotModel"]),
            firmware: text(&["firmware", "firmwareVersion"]),
            is_online: field(doc, &["isOnline", "online"])
                .and_then(Value::as_bool)
                .unwrap_or(false),
            raw: doc.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_command_result_success() {
        let ok = CommandResult::from_value(&json!({"topic": "get_controller", "state": 0, "data": {"a": 1}}));
        assert!(ok.success());
        assert_eq!(ok.topic, "get_controller");
        assert_eq!(ok.data["a"], 1);

        let rejected = CommandResult::from_value(&json!({"topic": "get_controller", "state": 3}));
        assert!(!rejected.success());
        assert_eq!(rejected.data, json!({}));
    }

    #[test]
    fn test_command_result_missing_state_is_failure() {
        let result = CommandResult::from_value(&json!({"topic": "stop_plan"}));
        assert_eq!(result.state, -1);
        assert!(!result.success());
    }

    #[test]
    fn test_light_presets() {
        let payload = LightState::all_on().to_payload();
        assert_eq!(payload.as_object().unwrap().len(), 7);
        assert!(payload.as_object().unwrap().values().all(|v| v == 255));

        assert!(LightState::all_off()
            .to_payload()
            .as_object()
            .unwrap()
            .values()
            .all(|v| v == 0));

        let body = LightState::body_only().to_payload();
        assert_eq!(body["body_left_r"], 255);
        assert_eq!(body["body_right_r"], 255);
        assert_eq!(body["led_head"], 0);
        assert_eq!(body["tail_left_r"], 0);
    }

    #[test]
    fn test_telemetry_alternate_keys() {
        let t = Telemetry::from_value(&json!({"sn": "SN1", "bat": 42, "x": 1.5, "yaw": 90.0}));
        assert_eq!(t.battery, Some(42));
        assert_eq!(t.position_x, Some(1.5));
        assert_eq!(t.heading, Some(90.0));
        assert_eq!(t.speed, None);
        assert_eq!(t.raw["sn"], "SN1");
    }

    #[test]
    fn test_telemetry_merge_plan() {
        let mut t = Telemetry::from_value(&json!({"battery": 80}));
        let plan = json!({"planId": "p-1", "state": 2, "areaCovered": 12.5, "duration": 300});
        t.merge_plan(plan.as_object().unwrap());
        assert_eq!(t.plan_id, Some(json!("p-1")));
        assert_eq!(t.plan_state, Some(json!(2)));
        assert_eq!(t.area_covered, Some(12.5));
        assert_eq!(t.duration, Some(300.0));
    }

    #[test]
    fn test_heartbeat() {
        let beat = Heartbeat::from_value(&json!({"working_state": 1})).unwrap();
        assert_eq!(beat.working_state, Some(1));
        assert_eq!(Heartbeat::from_value(&json!({})), Some(Heartbeat::default()));
        assert_eq!(Heartbeat::from_value(&json!([1, 2])), None);
        assert_eq!(Heartbeat::from_value(&json!({"working_state": "busy"})), None);
    }

    #[test]
    fn test_command_result_wrong_types_is_failure() {
        let result = CommandResult::from_value(&json!({"topic": 5, "state": "ok"}));
        assert_eq!(result.state, -1);
        assert!(result.topic.is_empty());
        assert_eq!(result.data["state"], "ok");
    }

    #[test]
    fn test_light_state_round_trips_through_serde() {
        let payload = LightState::body_only().to_payload();
        let parsed: LightState = serde_json::from_value(payload).unwrap();
        assert_eq!(parsed, LightState::body_only());

        let partial: LightState = serde_json::from_value(json!({"led_head": 10})).unwrap();
        assert_eq!(partial.led_head, 10);
        assert_eq!(partial.tail_right_r, 0);
    }

    #[test]
    fn test_robot_from_cloud_record() {
        let robot = Robot::from_value(&json!({"serialNum": "SN9", "snowbotName": "Yard", "online": true}));
        assert_eq!(robot.sn, "SN9");
        assert_eq!(robot.name, "Yard");
        assert!(robot.is_online);
        assert!(robot.model.is_empty());
    }
}

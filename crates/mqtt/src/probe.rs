//! Heartbeat sniffing for discovery.
//!
//! A short-lived anonymous session subscribes to `{ns}/+/device/heart_beat`
//! and reports the first valid beacon. The serial number of the robot behind
//! the broker is read from that topic.

use std::time::Duration;

use rumqttc::{Event, Packet, QoS};
use tracing::{debug, trace};

use super::{
    client::ClientBuilder,
    codec,
    connection::get_error_message,
    envelope::Envelope,
    error::TransferError,
    topic::{self, feedback},
};

const PROBE_KEEP_ALIVE_SECS: u64 = 10;
const PROBE_CHANNEL_CAPACITY: usize = 10;

/// A heartbeat is usable when it came from a well-formed device topic and
/// decoded to a JSON object.
pub fn is_valid_heartbeat(envelope: &Envelope) -> bool {
    !envelope.serial().is_empty()
        && envelope.kind() == feedback::HEART_BEAT
        && envelope.payload().is_object()
        && !codec::is_raw_fallback(envelope.payload())
}

/// Connects anonymously to `host:port` and waits up to `timeout` for a
/// heartbeat.
///
/// `Ok(None)` means the broker accepted us but nothing valid arrived in time.
/// Connection failures are reported as errors so callers can tell a silent
/// broker from an unreachable one.
pub async fn sniff_heartbeat(
    host: &str,
    port: u16,
    namespace: &str,
    timeout: Duration,
) -> Result<Option<Envelope>, TransferError> {
    let client_id = format!("yardlink-probe-{}", uuid::Uuid::new_v4().simple());
    let (client, mut event_loop) = ClientBuilder::new(client_id, host, port, PROBE_CHANNEL_CAPACITY)
        .keep_alive(PROBE_KEEP_ALIVE_SECS)
        .build()?;
    let filter = topic::wildcard(namespace, feedback::HEART_BEAT);

    let sniff = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    trace!(host, port, "Probe connected, subscribing {filter}");
                    client.try_subscribe(filter.as_str(), QoS::AtMostOnce)?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let doc = codec::decode(&publish.payload).await;
                    let envelope = Envelope::new(publish.topic, doc);
                    if is_valid_heartbeat(&envelope) {
                        return Ok(envelope);
                    }
                    trace!(topic = %envelope.topic(), "Ignoring invalid heartbeat");
                }
                Ok(_) => {}
                Err(e) => return Err(TransferError::Connection(get_error_message(&e))),
            }
        }
    };

    let outcome = tokio::time::timeout(timeout, sniff).await;
    if let Err(e) = client.try_disconnect() {
        trace!("Probe disconnect not queued: {e}");
    }

    match outcome {
        Ok(Ok(envelope)) => {
            debug!(host, port, sn = %envelope.serial(), "Heartbeat sniffed");
            Ok(Some(envelope))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            debug!(host, port, "No heartbeat within {:?}", timeout);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_valid_heartbeat() {
        let envelope = Envelope::new("snowbot/SN77/device/heart_beat", json!({"working_state": 1}));
        assert!(is_valid_heartbeat(&envelope));
        assert_eq!(envelope.serial(), "SN77");
    }

    #[test]
    fn test_rejects_non_object_or_raw() {
        let scalar = Envelope::new("snowbot/SN77/device/heart_beat", json!(1));
        assert!(!is_valid_heartbeat(&scalar));

        let raw = Envelope::new("snowbot/SN77/device/heart_beat", json!({"_raw": "00ff"}));
        assert!(!is_valid_heartbeat(&raw));
    }

    #[test]
    fn test_rejects_malformed_topic() {
        let envelope = Envelope::new("snowbot/heart_beat", json!({"working_state": 1}));
        assert!(!is_valid_heartbeat(&envelope));

        let wrong_leaf = Envelope::new("snowbot/SN77/device/DeviceMSG", json!({}));
        assert!(!is_valid_heartbeat(&wrong_leaf));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = sniff_heartbeat("127.0.0.1", port, "snowbot", Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransferError::Connection(_))));
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out() {
        // Accepts TCP but never answers CONNECT.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = sniff_heartbeat("127.0.0.1", port, "snowbot", Duration::from_millis(300)).await;
        assert!(matches!(result, Ok(None)));
        hold.abort();
    }
}

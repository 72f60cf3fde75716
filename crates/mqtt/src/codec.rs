//! Wire codec for device payloads.
//!
//! Every payload on the wire is minified JSON compressed with zlib, except
//! `heart_beat`, which the firmware sends as plain JSON. [`decode`] accepts
//! both without being told which one it got.
//!
//! ```text
//! encode:  Value ──serde_json::to_vec──▶ bytes ──ZlibEncoder──▶ wire
//! decode:  wire ──ZlibDecoder──▶ JSON ──▶ Value
//!               └─(not zlib)──▶ JSON ──▶ Value
//!                    └─(not JSON)──▶ {"_raw": "<hex of first 512 bytes>"}
//! ```

use async_compression::tokio::write::{ZlibDecoder, ZlibEncoder};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use super::error::TransferError;

/// Key of the sentinel document returned for undecodable payloads.
pub const RAW_KEY: &str = "_raw";

/// Bytes of an undecodable payload preserved (hex encoded) in the sentinel.
pub const RAW_PREVIEW_LEN: usize = 512;

/// Serializes `doc` to minified JSON and compresses it with zlib.
pub async fn encode(doc: &Value) -> Result<Bytes, TransferError> {
    let json = serde_json::to_vec(doc).map_err(|e| TransferError::Serialization(e.to_string()))?;

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2 + 16));
    encoder.write_all(&json).await?;
    encoder.shutdown().await?;
    Ok(Bytes::from(encoder.into_inner()))
}

/// Decodes a payload. Never fails.
///
/// Tries zlib then JSON, then JSON directly, and finally returns
/// `{"_raw": hex}` over the first [`RAW_PREVIEW_LEN`] bytes.
pub async fn decode(data: &[u8]) -> Value {
    if let Some(inflated) = inflate(data).await {
        if let Ok(doc) = serde_json::from_slice::<Value>(&inflated) {
            return doc;
        }
    }

    match serde_json::from_slice::<Value>(data) {
        Ok(doc) => doc,
        Err(_) => raw_fallback(data),
    }
}

/// `true` if `doc` is the sentinel produced for an undecodable payload.
pub fn is_raw_fallback(doc: &Value) -> bool {
    doc.as_object()
        .is_some_and(|map| map.len() == 1 && map.get(RAW_KEY).is_some_and(Value::is_string))
}

async fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(data).await.ok()?;
    decoder.shutdown().await.ok()?;
    Some(decoder.into_inner())
}

fn raw_fallback(data: &[u8]) -> Value {
    let preview = &data[..data.len().min(RAW_PREVIEW_LEN)];
    json!({ RAW_KEY: hex::encode(preview) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let large: Vec<Value> = (0..200)
            .map(|i| json!({"id": i, "label": format!("waypoint-{i}")}))
            .collect();
        let cases = [
            json!({}),
            json!({"led_head": 255, "led_left_w": 0}),
            json!({"nested": {"deeper": {"list": [1, 2.5, "three", null, true]}}}),
            json!([[], [1], {"a": []}]),
            json!({"unicode": "déneigeuse ❄ 雪", "escape": "line\nbreak \"quoted\""}),
            json!({"int": -42, "big": 9_007_199_254_740_993_u64, "float": 0.125, "exp": 1e-7}),
            json!({"path": large}),
        ];

        for doc in cases {
            let wire = encode(&doc).await.unwrap();
            assert_eq!(decode(&wire).await, doc, "round trip of {doc}");
        }
    }

    #[tokio::test]
    async fn test_round_trip_payload_larger_than_preview() {
        let doc = json!({"blob": "x".repeat(RAW_PREVIEW_LEN * 4)});
        let wire = encode(&doc).await.unwrap();
        assert_eq!(decode(&wire).await, doc);
    }

    #[tokio::test]
    async fn test_encode_is_zlib() {
        let wire = encode(&json!({})).await.unwrap();
        // zlib header: CM=8, and (CMF*256 + FLG) % 31 == 0
        assert_eq!(wire[0] & 0x0f, 8);
        assert_eq!((u16::from(wire[0]) * 256 + u16::from(wire[1])) % 31, 0);
    }

    #[tokio::test]
    async fn test_encode_is_minified() {
        let wire = encode(&json!({"a": 1, "b": [1, 2]})).await.unwrap();
        let inflated = inflate(&wire).await.unwrap();
        assert_eq!(inflated, br#"{"a":1,"b":[1,2]}"#);
    }

    #[tokio::test]
    async fn test_decode_plain_heartbeat() {
        let doc = decode(br#"{"working_state":1}"#).await;
        assert_eq!(doc, json!({"working_state": 1}));
        assert!(!is_raw_fallback(&doc));
    }

    #[tokio::test]
    async fn test_decode_garbage_returns_sentinel() {
        let garbage = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        let doc = decode(&garbage).await;
        assert_eq!(doc, json!({"_raw": "deadbeef0001"}));
        assert!(is_raw_fallback(&doc));
    }

    #[tokio::test]
    async fn test_decode_sentinel_is_truncated() {
        let garbage = vec![0xffu8; 2048];
        let doc = decode(&garbage).await;
        assert_eq!(doc[RAW_KEY].as_str().unwrap().len(), RAW_PREVIEW_LEN * 2);
    }

    #[tokio::test]
    async fn test_decode_sentinel_length_at_boundary() {
        for (len, hex_len) in [(511, 1022), (512, 1024), (513, 1024)] {
            let garbage: Vec<u8> = (0..len).map(|i| 0x80 | (i % 0x7f) as u8).collect();
            let doc = decode(&garbage).await;

            assert!(is_raw_fallback(&doc), "{len} bytes");
            let preview = doc[RAW_KEY].as_str().unwrap();
            assert_eq!(preview.len(), hex_len, "{len} bytes");
            assert_eq!(preview, hex::encode(&garbage[..len.min(RAW_PREVIEW_LEN)]));
        }
    }

    #[tokio::test]
    async fn test_decode_truncated_zlib_falls_back() {
        let wire = encode(&json!({"battery": 88})).await.unwrap();
        let doc = decode(&wire[..wire.len() / 2]).await;
        assert!(is_raw_fallback(&doc));
    }

    #[tokio::test]
    async fn test_decode_empty_payload() {
        assert!(is_raw_fallback(&decode(&[]).await));
    }

    #[test]
    fn test_is_raw_fallback_requires_exact_shape() {
        assert!(!is_raw_fallback(&json!({"_raw": "00", "x": 1})));
        assert!(!is_raw_fallback(&json!({"_raw": 5})));
        assert!(!is_raw_fallback(&json!([1, 2])));
    }
}

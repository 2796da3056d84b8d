//! Envelope tests

use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use super::*;

#[test]
fn test_create_sets_core_attributes() {
    let event = Envelope::create("com.example.ping", "https://example.com", Some("ping".into()))
        .unwrap();

    assert_eq!(event.spec_version(), "1.0");
    assert_eq!(event.event_type(), "com.example.ping");
    assert_eq!(event.source(), "https://example.com");
    assert_eq!(event.data_content_type(), Some("text/plain"));
    assert_eq!(event.data(), Some(&EventData::Json(json!("ping"))));
    assert!(Uuid::parse_str(event.id()).is_ok());
    assert!(event.time().is_some());
}

#[test]
fn test_create_generates_unique_ids() {
    let a = Envelope::create("t", "s", None).unwrap();
    let b = Envelope::create("t", "s", None).unwrap();
    assert_ne!(a.id(), b.id());
}

#[test]
fn test_create_rejects_empty_attributes() {
    assert_eq!(
        Envelope::create("", "s", None),
        Err(CreationError::EmptyAttribute("type"))
    );
    assert_eq!(
        Envelope::create("t", "", None),
        Err(CreationError::EmptyAttribute("source"))
    );
}

#[test]
fn test_created_event_survives_encode_decode() {
    let text = Envelope::create("com.example.ping", "urn:test", Some("ping".into())).unwrap();
    let binary = Envelope::create(
        "com.example.blob",
        "urn:test",
        Some(Bytes::from_static(&[0, 159, 146, 150]).into()),
    )
    .unwrap();
    let empty = Envelope::create("com.example.empty", "urn:test", None).unwrap();

    for event in [text, binary, empty] {
        let decoded = Envelope::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}

#[test]
fn test_encode_wire_shape() {
    let event = Envelope::create("com.example.ping", "urn:test", Some("ping".into())).unwrap();
    let wire: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();

    assert_eq!(wire["specversion"], "1.0");
    assert_eq!(wire["id"], event.id());
    assert_eq!(wire["type"], "com.example.ping");
    assert_eq!(wire["data"], "ping");
    assert!(wire.get("data_base64").is_none());
}

#[test]
fn test_binary_data_uses_base64() {
    let event = Envelope::create("t", "s", Some(Bytes::from_static(b"\x01\x02").into())).unwrap();
    let wire: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();

    assert_eq!(wire["data_base64"], "AQI=");
    assert!(wire.get("data").is_none());
}

#[test]
fn test_decode_minimal_event() {
    let event = Envelope::decode(br#"{"id":"a1","type":"demo.reply"}"#).unwrap();

    assert_eq!(event.id(), "a1");
    assert_eq!(event.event_type(), "demo.reply");
    assert_eq!(event.source(), "");
    assert_eq!(event.spec_version(), "1.0");
    assert_eq!(event.data(), None);
}

#[test]
fn test_decode_preserves_extensions() {
    let payload = json!({
        "specversion": "1.0",
        "id": "x",
        "type": "demo.event",
        "source": "s",
        "traceparent": "00-abc-def-01",
        "sequence": 7,
        "data": {"speed": 3}
    });
    let event = Envelope::decode(payload.to_string().as_bytes()).unwrap();

    assert_eq!(event.extensions()["traceparent"], "00-abc-def-01");
    assert_eq!(event.extensions()["sequence"], 7);
    assert_eq!(event.data(), Some(&EventData::Json(json!({"speed": 3}))));

    let reencoded: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
    assert_eq!(reencoded, payload);
}

#[test]
fn test_decode_missing_id() {
    let err = Envelope::decode(br#"{"type":"demo.event"}"#).unwrap_err();
    assert!(matches!(err, DecodeError::MissingAttribute("id")));

    let err = Envelope::decode(br#"{"id":"","type":"demo.event"}"#).unwrap_err();
    assert!(matches!(err, DecodeError::MissingAttribute("id")));
}

#[test]
fn test_decode_missing_type() {
    let err = Envelope::decode(br#"{"id":"a1","source":"s"}"#).unwrap_err();
    assert!(matches!(err, DecodeError::MissingAttribute("type")));
}

#[test]
fn test_decode_malformed_payloads() {
    for payload in [&b"not json"[..], b"[1,2,3]", b"\"a string\"", b"", br#"{"id":5,"type":"t"}"#]
    {
        assert!(matches!(
            Envelope::decode(payload),
            Err(DecodeError::Json(_))
        ));
    }
}

#[test]
fn test_decode_conflicting_data() {
    let err = Envelope::decode(br#"{"id":"a","type":"t","data":"x","data_base64":"eA=="}"#)
        .unwrap_err();
    assert!(matches!(err, DecodeError::ConflictingData));
}

#[test]
fn test_decode_invalid_base64() {
    let err = Envelope::decode(br#"{"id":"a","type":"t","data_base64":"***"}"#).unwrap_err();
    assert!(matches!(err, DecodeError::Base64(_)));
}

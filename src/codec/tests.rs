//! MQTT Codec Tests

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, PubAck, Publish, QoS,
    SubAck, SubAckCode, Subscribe, Subscription,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

// ============================================================================
// Variable byte integers
// ============================================================================

#[test]
fn test_variable_int_boundaries() {
    for value in [0u32, 127, 128, 16_383, 16_384, 2_097_151, 268_435_455] {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        assert_eq!(read_variable_int(&buf).unwrap(), (value, buf.len()));
    }
}

#[test]
fn test_variable_int_too_long() {
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF]),
        Err(DecodeError::InsufficientData)
    );
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

#[test]
fn test_connect_wire_format() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "dev".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[
            0x10, 0x0F, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
            0x04, // level
            0x02, // clean session
            0x00, 0x3C, // keep alive
            0x00, 0x03, b'd', b'e', b'v', // client id
        ][..]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_with_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "bridge".to_string(),
        clean_session: false,
        keep_alive: 30,
        username: Some("user".to_string()),
        password: Some(Bytes::from_static(b"secret")),
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[9], 0xC0);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_rejects_other_protocol_level() {
    let mut encoded = encode_packet(&Packet::Connect(Box::default()));
    encoded[8] = 5;
    assert_eq!(
        decode_packet(&encoded),
        Err(DecodeError::InvalidProtocolVersion(5))
    );
}

#[test]
fn test_connack_return_codes() {
    let accepted = Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    });
    assert_eq!(&encode_packet(&accepted)[..], &[0x20, 0x02, 0x01, 0x00]);
    assert_eq!(decode_packet(&[0x20, 0x02, 0x01, 0x00]).unwrap(), accepted);

    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x05]).unwrap(),
        Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        })
    );
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x09]),
        Err(DecodeError::InvalidReturnCode(9))
    );
}

// ============================================================================
// PUBLISH / PUBACK
// ============================================================================

#[test]
fn test_publish_qos0() {
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "a/b".to_string(),
        packet_id: None,
        payload: Bytes::from_static(b"hi"),
    });

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i'][..]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_qos1_carries_packet_id() {
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "events".to_string(),
        packet_id: Some(42),
        payload: Bytes::from_static(b"{}"),
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x33);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_qos1_without_packet_id_fails() {
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "events".to_string(),
        packet_id: None,
        payload: Bytes::new(),
    });
    let mut buf = BytesMut::new();
    assert_eq!(
        Encoder::new().encode(&packet, &mut buf),
        Err(EncodeError::MissingPacketId)
    );
}

#[test]
fn test_publish_rejects_wildcard_topic() {
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "sensors/#".to_string(),
        packet_id: None,
        payload: Bytes::new(),
    });
    let mut buf = BytesMut::new();
    assert_eq!(
        Encoder::new().encode(&packet, &mut buf),
        Err(EncodeError::InvalidTopicName)
    );

    let raw = [0x30, 0x05, 0x00, 0x03, b'a', b'/', b'+'];
    assert!(matches!(
        decode_packet(&raw),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_puback() {
    let packet = Packet::PubAck(PubAck { packet_id: 0x0102 });
    assert_eq!(&encode_packet(&packet)[..], &[0x40, 0x02, 0x01, 0x02]);
    assert_eq!(decode_packet(&[0x40, 0x02, 0x01, 0x02]).unwrap(), packet);
}

// ============================================================================
// SUBSCRIBE / SUBACK
// ============================================================================

#[test]
fn test_subscribe() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: "in".to_string(),
            qos: QoS::AtLeastOnce,
        }],
    });

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[0x82, 0x07, 0x00, 0x01, 0x00, 0x02, b'i', b'n', 0x01][..]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_subscribe_requires_reserved_flags() {
    assert_eq!(
        decode_packet(&[0x80, 0x07, 0x00, 0x01, 0x00, 0x02, b'i', b'n', 0x01]),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn test_suback_with_failure() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 7,
        return_codes: vec![SubAckCode::Granted(QoS::AtMostOnce), SubAckCode::Failure],
    });
    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[..], &[0x90, 0x04, 0x00, 0x07, 0x00, 0x80][..]);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

// ============================================================================
// Zero-length packets and framing
// ============================================================================

#[test]
fn test_zero_length_packets() {
    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(decode_packet(&[0xD0, 0x00]).unwrap(), Packet::PingResp);
    assert_eq!(decode_packet(&[0xE0, 0x00]).unwrap(), Packet::Disconnect);
    assert_eq!(
        decode_packet(&[0xC1, 0x00]),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn test_partial_packet_waits_for_more_data() {
    let encoded = encode_packet(&Packet::PubAck(PubAck { packet_id: 3 }));
    let decoder = Decoder::new();
    assert_eq!(decoder.decode(&encoded[..1]).unwrap(), None);
    assert_eq!(decoder.decode(&encoded[..3]).unwrap(), None);
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn test_back_to_back_packets() {
    let mut buf = encode_packet(&Packet::PingResp);
    buf.extend_from_slice(&encode_packet(&Packet::PubAck(PubAck { packet_id: 9 })));

    let decoder = Decoder::new();
    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    let (second, _) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck { packet_id: 9 }));
}

#[test]
fn test_packet_size_limit() {
    let decoder = Decoder::new().with_max_packet_size(4);
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "t".to_string(),
        packet_id: None,
        payload: Bytes::from_static(b"too large"),
    });
    assert_eq!(
        decoder.decode(&encode_packet(&packet)),
        Err(DecodeError::PacketTooLarge)
    );
}

#[test]
fn test_oversized_publish_headers() {
    let decoder = Decoder::new().with_max_packet_size(4);
    let packet = Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "devices/in".to_string(),
        packet_id: Some(42),
        payload: Bytes::from_static(b"far too large for the limit"),
    });
    let buf = encode_packet(&packet);

    // Fixed header, topic and packet id are enough
    let headers_only = &buf[..2 + 2 + "devices/in".len() + 2];
    let oversized = decoder.oversized_publish(headers_only).unwrap().unwrap();
    assert_eq!(oversized.topic, "devices/in");
    assert_eq!(oversized.qos, QoS::AtLeastOnce);
    assert_eq!(oversized.packet_id, Some(42));
    assert_eq!(oversized.total_len, buf.len());

    // Packet id not yet received
    assert_eq!(
        decoder.oversized_publish(&headers_only[..headers_only.len() - 1]),
        Ok(None)
    );
}

#[test]
fn test_oversized_non_publish_stays_an_error() {
    let suback = encode_packet(&Packet::SubAck(SubAck {
        packet_id: 1,
        return_codes: vec![SubAckCode::Granted(QoS::AtMostOnce); 8],
    }));

    assert_eq!(
        Decoder::new()
            .with_max_packet_size(4)
            .oversized_publish(&suback),
        Err(DecodeError::PacketTooLarge)
    );
}

#[test]
fn test_unsupported_packet_type() {
    // UNSUBSCRIBE is not part of the bridge's packet set
    assert_eq!(
        decode_packet(&[0xA2, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidPacketType(10))
    );
}

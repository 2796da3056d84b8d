//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, Publish, QoS,
    SubAck, SubAckCode, Subscribe, Subscription, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT Packet Decoder
#[derive(Debug)]
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer
    ///
    /// Returns `Ok(None)` while the buffer holds less than one full packet,
    /// otherwise the packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some((first_byte, remaining_length, len_bytes)) = fixed_header(buf)? else {
            return Ok(None);
        };
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        if remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => decode_connect(flags, body)?,
            2 => decode_connack(flags, body)?,
            3 => decode_publish(flags, body)?,
            4 => decode_puback(flags, body)?,
            8 => decode_subscribe(flags, body)?,
            9 => decode_suback(flags, body)?,
            12 | 13 | 14 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if !body.is_empty() {
                    return Err(DecodeError::MalformedPacket("unexpected payload"));
                }
                match packet_type {
                    12 => Packet::PingReq,
                    13 => Packet::PingResp,
                    _ => Packet::Disconnect,
                }
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }
}

impl Decoder {
    /// Read the topic and packet id of a PUBLISH over the size limit
    ///
    /// Only the fixed and variable headers have to be in `buf`, so the
    /// payload can be skipped without buffering it. Returns `Ok(None)` until
    /// they are. Oversized packets of any other type stay `PacketTooLarge`.
    pub fn oversized_publish(&self, buf: &[u8]) -> Result<Option<OversizedPublish>, DecodeError> {
        let Some((first_byte, remaining_length, len_bytes)) = fixed_header(buf)? else {
            return Ok(None);
        };
        if first_byte >> 4 != PacketType::Publish as u8 {
            return Err(DecodeError::PacketTooLarge);
        }

        let qos_bits = (first_byte >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        let header_len = 1 + len_bytes;
        let body = &buf[header_len..];
        let (topic, pos) = match read_string(body) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let packet_id = if qos != QoS::AtMostOnce {
            match read_u16(&body[pos..]) {
                Ok(id) => Some(id),
                Err(DecodeError::InsufficientData) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(Some(OversizedPublish {
            topic: topic.to_string(),
            qos,
            packet_id,
            total_len: header_len + remaining_length,
        }))
    }
}

/// Headers of a PUBLISH too large to decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OversizedPublish {
    pub topic: String,
    pub qos: QoS,
    pub packet_id: Option<u16>,
    /// Bytes the whole packet occupies on the wire
    pub total_len: usize,
}

/// First byte, remaining length and size of the length field
fn fixed_header(buf: &[u8]) -> Result<Option<(u8, usize, usize)>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    match read_variable_int(&buf[1..]) {
        Ok((remaining_length, len_bytes)) => {
            Ok(Some((buf[0], remaining_length as usize, len_bytes)))
        }
        Err(DecodeError::InsufficientData) => Ok(None),
        Err(e) => Err(e),
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let mut pos = 0;

    let (protocol_name, len) = read_string(body)?;
    pos += len;
    if protocol_name != PROTOCOL_NAME {
        return Err(DecodeError::InvalidProtocolName);
    }

    let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
    pos += 1;
    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::InvalidProtocolVersion(level));
    }

    let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
    pos += 1;

    // Reserved bit; will messages are not part of this codec
    if (connect_flags & 0x01) != 0 || (connect_flags & 0x3C) != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let clean_session = (connect_flags & 0x02) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    let keep_alive = read_u16(&body[pos..])?;
    pos += 2;

    let (client_id, len) = read_string(&body[pos..])?;
    pos += len;

    let username = if username_flag {
        let (s, len) = read_string(&body[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, _) = read_binary(&body[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
    })))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK length must be 2"));
    }

    // Only bit 0 (session present) may be set
    if (body[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code =
        ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (body[0] & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let (topic, mut pos) = read_string(body)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
    }))
}

fn decode_puback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("PUBACK length must be 2"));
    }
    Ok(Packet::PubAck(PubAck {
        packet_id: read_u16(body)?,
    }))
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // [MQTT-3.8.1-1] fixed header flags must be 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    let mut pos = 2;
    let mut subscriptions = Vec::new();

    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;

        let qos_byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;

        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    let return_codes = body[2..]
        .iter()
        .map(|&b| SubAckCode::from_u8(b).ok_or(DecodeError::InvalidReturnCode(b)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

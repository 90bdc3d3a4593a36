//! Codec for encoding and decoding MQTT packets.
//!
//! Every packet starts with a fixed header: one byte of packet type and
//! flags followed by the remaining length as a variable byte integer
//! (one to four bytes, seven bits each, high bit means "more follows").

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::packets::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe, Will,
};

/// Largest remaining length the variable byte integer can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default maximum packet size accepted by [`PacketCodec`] (256 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet exceeds maximum size.
    #[error("Packet size {0} exceeds maximum {1}")]
    PacketTooLarge(usize, usize),

    /// Not enough data to decode a packet.
    #[error("Incomplete packet: need {0} more bytes")]
    Incomplete(usize),

    /// Remaining length uses more than four bytes.
    #[error("Malformed remaining length")]
    MalformedLength,

    /// Unknown packet type nibble.
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    /// Recognized but not supported by an at-most-once broker.
    #[error("Unsupported packet: {0}")]
    Unsupported(PacketType),

    /// String field is not valid UTF-8.
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Invalid packet data.
    #[error("Invalid packet: {0}")]
    Invalid(&'static str),
}

/// Encode a packet to bytes.
///
/// # Errors
///
/// Returns an error if the packet is too large to frame.
pub fn encode(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a packet into an existing buffer.
///
/// # Errors
///
/// Returns an error if the packet is too large to frame.
pub fn encode_into(packet: &Packet, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut body = BytesMut::new();
    let flags = match packet {
        Packet::Connect(connect) => {
            write_connect(connect, &mut body)?;
            0
        }
        Packet::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code as u8);
            0
        }
        Packet::Publish(publish) => {
            write_string(&publish.topic, &mut body)?;
            if publish.qos != QoS::AtMostOnce {
                let id = publish
                    .packet_id
                    .ok_or(ProtocolError::Invalid("QoS > 0 publish without packet id"))?;
                body.put_u16(id);
            }
            body.extend_from_slice(&publish.payload);
            (u8::from(publish.dup) << 3) | ((publish.qos as u8) << 1) | u8::from(publish.retain)
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            for (filter, qos) in &subscribe.filters {
                write_string(filter, &mut body)?;
                body.put_u8(*qos as u8);
            }
            0b0010
        }
        Packet::SubAck(ack) => {
            body.put_u16(ack.packet_id);
            for code in &ack.return_codes {
                body.put_u8(code.as_u8());
            }
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            for filter in &unsubscribe.filters {
                write_string(filter, &mut body)?;
            }
            0b0010
        }
        Packet::UnsubAck { packet_id } => {
            body.put_u16(*packet_id);
            0
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };

    if body.len() > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge(
            body.len(),
            MAX_REMAINING_LENGTH,
        ));
    }

    buf.reserve(1 + 4 + body.len());
    buf.put_u8((u8::from(packet.packet_type()) << 4) | flags);
    write_remaining_length(body.len(), buf);
    buf.extend_from_slice(&body);
    Ok(())
}

/// Decode a single complete packet from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
    let mut buf = BytesMut::from(data);
    match decode_from_with_limit(&mut buf, MAX_REMAINING_LENGTH)? {
        Some(packet) => Ok(packet),
        None => Err(ProtocolError::Incomplete(missing_bytes(data))),
    }
}

/// Try to decode a packet from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(packet))` if a complete packet was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the packet is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
    decode_from_with_limit(buf, DEFAULT_MAX_PACKET_SIZE)
}

fn decode_from_with_limit(
    buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<Packet>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let Some((remaining, length_bytes)) = read_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    if remaining > max_packet_size {
        return Err(ProtocolError::PacketTooLarge(remaining, max_packet_size));
    }

    let total_size = 1 + length_bytes + remaining;
    if buf.len() < total_size {
        return Ok(None);
    }

    let header = buf[0];
    buf.advance(1 + length_bytes);
    let body = buf.split_to(remaining).freeze();
    parse_packet(header, body).map(Some)
}

fn missing_bytes(data: &[u8]) -> usize {
    if data.len() < 2 {
        return 2 - data.len();
    }
    match read_remaining_length(&data[1..]) {
        Ok(Some((remaining, length_bytes))) => (1 + length_bytes + remaining) - data.len(),
        _ => 1,
    }
}

/// Streaming codec with a configurable maximum packet size.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl PacketCodec {
    /// Create a new codec instance with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec that rejects packets larger than `max_packet_size`.
    #[must_use]
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }

    /// Get the configured size limit.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Encode a packet to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        encode(packet)
    }

    /// Try to decode a packet from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet is invalid or exceeds the size limit.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        decode_from_with_limit(buf, self.max_packet_size)
    }
}

fn write_remaining_length(mut value: usize, buf: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Returns `(value, bytes_used)`, or `None` if the length is still incomplete.
fn read_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    for (i, byte) in bytes.iter().take(4).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= 4 {
        Err(ProtocolError::MalformedLength)
    } else {
        Ok(None)
    }
}

fn write_string(s: &str, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    write_binary(s.as_bytes(), buf)
}

fn write_binary(data: &[u8], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::Invalid("field too long"))?;
    buf.put_u16(len);
    buf.extend_from_slice(data);
    Ok(())
}

fn write_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), ProtocolError> {
    write_string(&connect.protocol_name, body)?;
    body.put_u8(connect.protocol_level);

    let mut flags = u8::from(connect.clean_session) << 1;
    if let Some(will) = &connect.will {
        flags |= 0b0000_0100 | ((will.qos as u8) << 3) | (u8::from(will.retain) << 5);
    }
    if connect.password.is_some() {
        flags |= 0b0100_0000;
    }
    if connect.username.is_some() {
        flags |= 0b1000_0000;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    write_string(&connect.client_id, body)?;
    if let Some(will) = &connect.will {
        write_string(&will.topic, body)?;
        write_binary(&will.message, body)?;
    }
    if let Some(username) = &connect.username {
        write_string(username, body)?;
    }
    if let Some(password) = &connect.password {
        write_binary(password, body)?;
    }
    Ok(())
}

fn read_u8(body: &mut Bytes) -> Result<u8, ProtocolError> {
    if body.remaining() < 1 {
        return Err(ProtocolError::Invalid("unexpected end of packet"));
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> Result<u16, ProtocolError> {
    if body.remaining() < 2 {
        return Err(ProtocolError::Invalid("unexpected end of packet"));
    }
    Ok(body.get_u16())
}

fn read_binary(body: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = usize::from(read_u16(body)?);
    if body.remaining() < len {
        return Err(ProtocolError::Invalid("field length exceeds packet"));
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = read_binary(body)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn expect_flags(header: u8, expected: u8) -> Result<(), ProtocolError> {
    if header & 0x0F == expected {
        Ok(())
    } else {
        Err(ProtocolError::Invalid("reserved fixed header flags"))
    }
}

fn expect_empty(body: &Bytes) -> Result<(), ProtocolError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::Invalid("unexpected trailing bytes"))
    }
}

fn parse_packet(header: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    let packet_type =
        PacketType::try_from(header >> 4).map_err(|_| ProtocolError::InvalidPacketType(header >> 4))?;

    match packet_type {
        PacketType::Connect => {
            expect_flags(header, 0)?;
            parse_connect(&mut body).map(Packet::Connect)
        }
        PacketType::ConnAck => {
            expect_flags(header, 0)?;
            let ack_flags = read_u8(&mut body)?;
            let code = ConnectReturnCode::try_from(read_u8(&mut body)?)
                .map_err(ProtocolError::Invalid)?;
            expect_empty(&body)?;
            Ok(Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code,
            }))
        }
        PacketType::Publish => parse_publish(header, body).map(Packet::Publish),
        PacketType::Subscribe => {
            expect_flags(header, 0b0010)?;
            let packet_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(&mut body)?;
                let qos = QoS::try_from(read_u8(&mut body)?).map_err(ProtocolError::Invalid)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(ProtocolError::Invalid("subscribe without topic filters"));
            }
            Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
        }
        PacketType::SubAck => {
            expect_flags(header, 0)?;
            let packet_id = read_u16(&mut body)?;
            let return_codes = body
                .iter()
                .map(|b| SubscribeReturnCode::try_from(*b).map_err(ProtocolError::Invalid))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            }))
        }
        PacketType::Unsubscribe => {
            expect_flags(header, 0b0010)?;
            let packet_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(read_string(&mut body)?);
            }
            if filters.is_empty() {
                return Err(ProtocolError::Invalid("unsubscribe without topic filters"));
            }
            Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
        }
        PacketType::UnsubAck => {
            expect_flags(header, 0)?;
            let packet_id = read_u16(&mut body)?;
            expect_empty(&body)?;
            Ok(Packet::UnsubAck { packet_id })
        }
        PacketType::PingReq | PacketType::PingResp | PacketType::Disconnect => {
            expect_flags(header, 0)?;
            expect_empty(&body)?;
            Ok(match packet_type {
                PacketType::PingReq => Packet::PingReq,
                PacketType::PingResp => Packet::PingResp,
                _ => Packet::Disconnect,
            })
        }
        PacketType::PubAck | PacketType::PubRec | PacketType::PubRel | PacketType::PubComp => {
            Err(ProtocolError::Unsupported(packet_type))
        }
    }
}

fn parse_connect(body: &mut Bytes) -> Result<Connect, ProtocolError> {
    let protocol_name = read_string(body)?;
    let protocol_level = read_u8(body)?;
    let flags = read_u8(body)?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::Invalid("connect reserved flag set"));
    }
    let keep_alive = read_u16(body)?;
    let client_id = read_string(body)?;

    let will = if flags & 0b0000_0100 != 0 {
        let qos = QoS::try_from((flags >> 3) & 0x03).map_err(ProtocolError::Invalid)?;
        let topic = read_string(body)?;
        let message = read_binary(body)?;
        Some(Will {
            topic,
            message,
            qos,
            retain: flags & 0b0010_0000 != 0,
        })
    } else {
        None
    };

    let username = if flags & 0b1000_0000 != 0 {
        Some(read_string(body)?)
    } else {
        None
    };
    let password = if flags & 0b0100_0000 != 0 {
        Some(read_binary(body)?)
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags & 0b0000_0010 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn parse_publish(header: u8, mut body: Bytes) -> Result<Publish, ProtocolError> {
    let qos = QoS::try_from((header >> 1) & 0x03).map_err(ProtocolError::Invalid)?;
    let topic = read_string(&mut body)?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(read_u16(&mut body)?)
    };
    Ok(Publish {
        dup: header & 0b1000 != 0,
        qos,
        retain: header & 0b0001 != 0,
        topic,
        packet_id,
        payload: body,
    })
}

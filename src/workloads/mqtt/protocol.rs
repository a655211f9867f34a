use crate::messaging::topics::validate_topic_name;
use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// MQTT 3.1.1 protocol level carried in CONNECT.
pub const PROTOCOL_LEVEL: u8 = 4;
/// MQTT 3.1 (`MQIsdp`) protocol level.
pub const LEGACY_PROTOCOL_LEVEL: u8 = 3;
/// Largest value the four-byte remaining length can encode.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(anyhow!("unsupported QoS {other}")),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    /// Highest level this broker delivers at.
    pub fn capped(self) -> Self {
        self.min(Qos::AtLeastOnce)
    }
}

/// Failures the session maps to a specific response instead of a bare close.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol level {0}")]
    UnsupportedLevel(u8),
    #[error("packet of {size} bytes exceeds limit of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("QoS 2 publish is not supported")]
    ExactlyOnceUnsupported,
}

#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub message_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub topic_filter: String,
    pub qos: Qos,
}

#[derive(Debug, Clone)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<SubscriptionRequest>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ControlPacket {
    Publish(PublishPacket),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),
    PingReq,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn code(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0x00,
            ConnectReturnCode::UnacceptableProtocolVersion => 0x01,
            ConnectReturnCode::IdentifierRejected => 0x02,
            ConnectReturnCode::ServerUnavailable => 0x03,
            ConnectReturnCode::BadUsernameOrPassword => 0x04,
            ConnectReturnCode::NotAuthorized => 0x05,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectReturnCode::Accepted => "accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable_protocol_version",
            ConnectReturnCode::IdentifierRejected => "identifier_rejected",
            ConnectReturnCode::ServerUnavailable => "server_unavailable",
            ConnectReturnCode::BadUsernameOrPassword => "bad_username_or_password",
            ConnectReturnCode::NotAuthorized => "not_authorized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckResult {
    Granted(Qos),
    Failure,
}

/// Parse an MQTT CONNECT packet from the stream.
///
/// Any protocol level other than 3.1.1 yields [`ProtocolError::UnsupportedLevel`]
/// so the caller can answer with return code 0x01 before closing.
pub async fn read_connect<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    max_packet_size: usize,
) -> Result<ConnectPacket> {
    let mut header = [0u8; 1];
    stream.read_exact(&mut header).await?;
    let packet_type = header[0] >> 4;
    if packet_type != 1 {
        return Err(anyhow!("expected CONNECT (type 1), got {packet_type}"));
    }
    let payload = read_body(stream, max_packet_size).await?;
    parse_connect(&payload)
}

/// Read a control packet after CONNECT.
pub async fn read_packet<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    max_packet_size: usize,
) -> Result<ControlPacket> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    let packet_type = first[0] >> 4;
    let flags = first[0] & 0x0F;
    let buf = read_body(stream, max_packet_size).await?;
    let expected_flags = match packet_type {
        6 | 8 | 10 => Some(0b0010),
        3 => None,
        _ => Some(0),
    };
    if let Some(expected) = expected_flags {
        if flags != expected {
            anyhow::bail!("invalid fixed header flags {flags:#06b} for packet type {packet_type}");
        }
    }
    match packet_type {
        3 => Ok(ControlPacket::Publish(parse_publish(flags, &buf)?)),
        4 => Ok(ControlPacket::PubAck(parse_packet_id(&buf)?)),
        5 => Ok(ControlPacket::PubRec(parse_packet_id(&buf)?)),
        6 => Ok(ControlPacket::PubRel(parse_packet_id(&buf)?)),
        7 => Ok(ControlPacket::PubComp(parse_packet_id(&buf)?)),
        8 => Ok(ControlPacket::Subscribe(parse_subscribe(&buf)?)),
        10 => Ok(ControlPacket::Unsubscribe(parse_unsubscribe(&buf)?)),
        12 => Ok(ControlPacket::PingReq),
        14 => Ok(ControlPacket::Disconnect),
        _ => Err(anyhow!("unsupported packet type {packet_type}")),
    }
}

async fn read_body<S: AsyncReadExt + Unpin>(stream: &mut S, max_packet_size: usize) -> Result<Vec<u8>> {
    let remaining_len = decode_remaining_length_stream(stream).await? as usize;
    if remaining_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: remaining_len,
            max: max_packet_size,
        }
        .into());
    }
    let mut buf = vec![0u8; remaining_len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_connack<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    session_present: bool,
    code: ConnectReturnCode,
) -> Result<()> {
    let flags = if session_present && code == ConnectReturnCode::Accepted {
        0x01
    } else {
        0x00
    };
    stream.write_all(&[0x20, 0x02, flags, code.code()]).await?;
    Ok(())
}

pub async fn write_suback<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    packet_id: u16,
    grants: &[SubAckResult],
) -> Result<()> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&packet_id.to_be_bytes());
    for grant in grants {
        let code = match grant {
            SubAckResult::Granted(qos) => qos.bits(),
            SubAckResult::Failure => 0x80,
        };
        payload.push(code);
    }
    let mut header = vec![0x90];
    header.extend(encode_remaining_length(payload.len()));
    header.extend(payload);
    stream.write_all(&header).await?;
    Ok(())
}

pub async fn write_unsuback<S: AsyncWriteExt + Unpin>(stream: &mut S, packet_id: u16) -> Result<()> {
    write_ack_variant(stream, 0xB0, packet_id).await
}

pub async fn write_puback<S: AsyncWriteExt + Unpin>(stream: &mut S, mid: u16) -> Result<()> {
    write_ack_variant(stream, 0x40, mid).await
}

pub async fn write_pingresp<S: AsyncWriteExt + Unpin>(stream: &mut S) -> Result<()> {
    stream.write_all(&[0xD0, 0x00]).await?;
    Ok(())
}

/// Send a PUBLISH packet. `message_id` is required above QoS 0.
pub async fn write_publish<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    topic: &str,
    payload: &[u8],
    qos: Qos,
    retain: bool,
    dup: bool,
    message_id: Option<u16>,
) -> Result<()> {
    let frame = encode_publish(topic, payload, qos, retain, dup, message_id)?;
    stream.write_all(&frame).await?;
    Ok(())
}

pub fn encode_publish(
    topic: &str,
    payload: &[u8],
    qos: Qos,
    retain: bool,
    dup: bool,
    message_id: Option<u16>,
) -> Result<Vec<u8>> {
    let qos_bits = qos.bits() << 1;
    let retain_bit = if retain { 0x01 } else { 0x00 };
    let dup_bit = if dup && qos != Qos::AtMostOnce {
        0b0000_1000
    } else {
        0
    };
    let header = 0b0011_0000 | dup_bit | qos_bits | retain_bit;
    let topic_len = u16::try_from(topic.len()).context("topic longer than 65535 bytes")?;
    let mut body = Vec::with_capacity(topic.len() + payload.len() + 4);
    body.extend_from_slice(&topic_len.to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    if qos != Qos::AtMostOnce {
        let mid = message_id.ok_or_else(|| anyhow!("message id required"))?;
        body.extend_from_slice(&mid.to_be_bytes());
    }
    body.extend_from_slice(payload);
    if body.len() > MAX_REMAINING_LENGTH {
        anyhow::bail!("publish of {} bytes exceeds the protocol limit", body.len());
    }
    let mut frame = vec![header];
    frame.extend(encode_remaining_length(body.len()));
    frame.extend(body);
    Ok(frame)
}

fn parse_connect(buf: &[u8]) -> Result<ConnectPacket> {
    let mut cursor = 0usize;
    let proto_name = read_string(buf, &mut cursor)?;
    let proto_level = read_u8(buf, &mut cursor)?;
    if proto_level != PROTOCOL_LEVEL {
        return Err(ProtocolError::UnsupportedLevel(proto_level).into());
    }
    if proto_name != "MQTT" {
        anyhow::bail!("unexpected protocol name {proto_name:?}");
    }
    let connect_flags = read_u8(buf, &mut cursor)?;
    if connect_flags & 0x01 != 0 {
        anyhow::bail!("reserved connect flag set");
    }
    let keep_alive = read_u16(buf, &mut cursor)?;

    let client_id = read_string(buf, &mut cursor)?;
    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos_bits = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let mut will = None;
    if will_flag {
        let qos = Qos::from_bits(will_qos_bits)?;
        let topic = read_string(buf, &mut cursor)?;
        validate_topic_name(&topic).context("invalid will topic")?;
        let payload = read_binary(buf, &mut cursor)?;
        will = Some(Will {
            topic,
            payload,
            qos,
            retain: will_retain,
        });
    } else if will_qos_bits != 0 || will_retain {
        anyhow::bail!("will QoS/retain set without will flag");
    }
    let username_flag = (connect_flags & 0x80) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    if password_flag && !username_flag {
        anyhow::bail!("password flag set without username");
    }
    let username = if username_flag {
        Some(read_string(buf, &mut cursor)?)
    } else {
        None
    };
    let password = if password_flag {
        Some(read_binary(buf, &mut cursor)?)
    } else {
        None
    };

    Ok(ConnectPacket {
        client_id,
        keep_alive,
        clean_session,
        will,
        username,
        password,
    })
}

fn parse_publish(flags: u8, buf: &[u8]) -> Result<PublishPacket> {
    let dup = (flags & 0b0000_1000) != 0;
    let retain = (flags & 0b0000_0001) != 0;
    let qos_bits = (flags & 0b0000_0110) >> 1;
    let qos = Qos::from_bits(qos_bits)?;
    if qos == Qos::ExactlyOnce {
        return Err(ProtocolError::ExactlyOnceUnsupported.into());
    }
    if matches!(qos, Qos::AtMostOnce) && dup {
        anyhow::bail!("dup flag set for qos0 publish");
    }
    let mut cursor = 0usize;
    let topic = read_string(buf, &mut cursor)?;
    validate_topic_name(&topic).context("invalid publish topic")?;
    let message_id = match qos {
        Qos::AtMostOnce => None,
        _ => {
            let mid = read_u16(buf, &mut cursor)?;
            if mid == 0 {
                anyhow::bail!("packet identifier 0 is reserved");
            }
            Some(mid)
        }
    };
    let payload = buf[cursor..].to_vec();
    Ok(PublishPacket {
        topic,
        payload,
        qos,
        message_id,
        dup,
        retain,
    })
}

pub fn parse_subscribe(buf: &[u8]) -> Result<SubscribePacket> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut filters = Vec::new();
    while cursor < buf.len() {
        let topic_filter = read_string(buf, &mut cursor)?;
        let opts = read_u8(buf, &mut cursor)?;
        if opts & 0b1111_1100 != 0 {
            anyhow::bail!("reserved subscription flags set");
        }
        let qos = Qos::from_bits(opts & 0x03)?;
        filters.push(SubscriptionRequest { topic_filter, qos });
    }
    if filters.is_empty() {
        anyhow::bail!("SUBSCRIBE without topic filters");
    }
    Ok(SubscribePacket { packet_id, filters })
}

fn parse_unsubscribe(buf: &[u8]) -> Result<UnsubscribePacket> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut topics = Vec::new();
    while cursor < buf.len() {
        topics.push(read_string(buf, &mut cursor)?);
    }
    if topics.is_empty() {
        anyhow::bail!("UNSUBSCRIBE without topic filters");
    }
    Ok(UnsubscribePacket { packet_id, topics })
}

fn parse_packet_id(buf: &[u8]) -> Result<u16> {
    let mut cursor = 0usize;
    read_u16(buf, &mut cursor)
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8> {
    if *cursor >= buf.len() {
        anyhow::bail!("unexpected end of buffer");
    }
    let v = buf[*cursor];
    *cursor += 1;
    Ok(v)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16> {
    if *cursor + 1 >= buf.len() {
        anyhow::bail!("unexpected end of buffer");
    }
    let v = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String> {
    let bytes = read_binary(buf, cursor)?;
    String::from_utf8(bytes).context("invalid utf8 in mqtt string")
}

fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        anyhow::bail!("unexpected end of buffer");
    }
    let bytes = buf[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(bytes)
}

async fn decode_remaining_length_stream<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<u32> {
    let mut multiplier = 1u32;
    let mut value = 0u32;
    for _ in 0..4 {
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;
        let byte = buf[0];
        value += ((byte & 0x7F) as u32) * multiplier;
        if (byte & 0x80) == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(anyhow!("remaining length overflow"))
}

fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out
}

async fn write_ack_variant<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    packet_type: u8,
    mid: u16,
) -> Result<()> {
    let [hi, lo] = mid.to_be_bytes();
    stream.write_all(&[packet_type, 0x02, hi, lo]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_frame(name: &str, level: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(level);
        body.push(flags);
        body.extend_from_slice(&30u16.to_be_bytes());
        body.extend_from_slice(payload);
        let mut frame = vec![0x10];
        frame.extend(encode_remaining_length(body.len()));
        frame.extend(body);
        frame
    }

    fn string(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[tokio::test]
    async fn connect_with_will_and_credentials() {
        let mut payload = string("phone");
        payload.extend(string("owntracks/alice/phone"));
        payload.extend(string("{\"_type\":\"lwt\"}"));
        payload.extend(string("alice"));
        payload.extend(string("pw"));
        // username, password, will retain, will qos 1, will, clean session
        let frame = connect_frame("MQTT", 4, 0b1110_1110, &payload);
        let connect = read_connect(&mut frame.as_slice(), 1024).await.unwrap();
        assert_eq!(connect.client_id, "phone");
        assert_eq!(connect.keep_alive, 30);
        assert!(connect.clean_session);
        let will = connect.will.unwrap();
        assert_eq!(will.topic, "owntracks/alice/phone");
        assert_eq!(will.qos, Qos::AtLeastOnce);
        assert!(will.retain);
        assert_eq!(connect.username.as_deref(), Some("alice"));
        assert_eq!(connect.password.as_deref(), Some(b"pw".as_slice()));
    }

    #[tokio::test]
    async fn legacy_and_v5_levels_are_typed_errors() {
        for (name, level) in [("MQIsdp", 3u8), ("MQTT", 5u8)] {
            let frame = connect_frame(name, level, 0x02, &string("c"));
            let err = read_connect(&mut frame.as_slice(), 1024).await.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ProtocolError>(),
                Some(ProtocolError::UnsupportedLevel(l)) if *l == level
            ));
        }
    }

    #[tokio::test]
    async fn oversized_packets_are_rejected() {
        let frame = connect_frame("MQTT", 4, 0x02, &string("client"));
        let err = read_connect(&mut frame.as_slice(), 4).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::PacketTooLarge { max: 4, .. })
        ));
    }

    #[tokio::test]
    async fn publish_qos2_and_wildcards_are_protocol_errors() {
        let mut body = string("owntracks/alice/phone");
        body.extend_from_slice(&7u16.to_be_bytes());
        let mut frame = vec![0x34];
        frame.extend(encode_remaining_length(body.len()));
        frame.extend(body);
        let err = read_packet(&mut frame.as_slice(), 1024).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::ExactlyOnceUnsupported)
        ));

        let body = string("owntracks/+/phone");
        let mut frame = vec![0x30];
        frame.extend(encode_remaining_length(body.len()));
        frame.extend(body);
        assert!(read_packet(&mut frame.as_slice(), 1024).await.is_err());
    }

    #[tokio::test]
    async fn publish_frame_parses_back() {
        let frame = encode_publish(
            "owntracks/alice/phone",
            b"{}",
            Qos::AtLeastOnce,
            false,
            true,
            Some(9),
        )
        .unwrap();
        assert_eq!(frame[0], 0x3A);
        match read_packet(&mut frame.as_slice(), 1024).await.unwrap() {
            ControlPacket::Publish(p) => {
                assert_eq!(p.topic, "owntracks/alice/phone");
                assert_eq!(p.message_id, Some(9));
                assert!(p.dup);
                assert_eq!(p.payload, b"{}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_requires_reserved_flags() {
        let mut body = 5u16.to_be_bytes().to_vec();
        body.extend(string("owntracks/alice/#"));
        body.push(2);
        let mut good = vec![0x82];
        good.extend(encode_remaining_length(body.len()));
        good.extend(body.clone());
        match read_packet(&mut good.as_slice(), 1024).await.unwrap() {
            ControlPacket::Subscribe(s) => {
                assert_eq!(s.packet_id, 5);
                assert_eq!(s.filters[0].qos, Qos::ExactlyOnce);
                assert_eq!(s.filters[0].qos.capped(), Qos::AtLeastOnce);
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut bad = vec![0x80];
        bad.extend(encode_remaining_length(body.len()));
        bad.extend(body);
        assert!(read_packet(&mut bad.as_slice(), 1024).await.is_err());
    }

    #[test]
    fn remaining_length_encoding() {
        assert_eq!(encode_remaining_length(0), vec![0x00]);
        assert_eq!(encode_remaining_length(127), vec![0x7F]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(
            encode_remaining_length(MAX_REMAINING_LENGTH),
            vec![0xFF, 0xFF, 0xFF, 0x7F]
        );
    }

    #[tokio::test]
    async fn acks_are_four_bytes() {
        let mut out = Vec::new();
        write_puback(&mut out, 0x0102).await.unwrap();
        write_unsuback(&mut out, 3).await.unwrap();
        write_connack(&mut out, false, ConnectReturnCode::NotAuthorized)
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![0x40, 0x02, 0x01, 0x02, 0xB0, 0x02, 0x00, 0x03, 0x20, 0x02, 0x00, 0x05]
        );
    }
}

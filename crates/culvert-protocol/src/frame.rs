use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::CodecError;

/// First byte of every frame, used to detect stream desynchronization.
pub const MAGIC_BYTE: u8 = 0xC7;

/// Current and only wire protocol version.
pub const PROTOCOL_VERSION: u8 = 0x1;

/// Fixed header length: magic(1) + version(1) + type(1) + exchange_id(8) + length(4).
pub const HEADER_LEN: usize = 15;

/// Exchange id carried by control frames. Real exchange ids start at 1.
pub const CONTROL_EXCHANGE_ID: u64 = 0;

/// Type of a tunnel frame, determining how its payload is interpreted.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Client requests a tunnel (payload: routing key + auth token).
    Init = 0x01,
    /// Server accepts a tunnel (payload: session token + assigned key).
    InitAck = 0x02,
    /// Liveness probe (payload: 8-byte sequence).
    Health = 0x03,
    /// Probe acknowledgment, echoing the sequence.
    HealthAck = 0x04,
    /// One payload chunk of an exchange.
    ExchangeData = 0x05,
    /// Terminates one direction of an exchange (payload: status + detail).
    ExchangeEnd = 0x06,
    /// Client parks the session; exchange traffic queues until resume.
    Suspend = 0x07,
    /// Client unparks the session.
    Resume = 0x08,
    /// Connection teardown (payload: reason + detail).
    Close = 0x09,
}

impl FrameType {
    /// Exchange frames are subject to suspend queueing; control frames are not.
    pub fn is_exchange(self) -> bool {
        matches!(self, FrameType::ExchangeData | FrameType::ExchangeEnd)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Init),
            0x02 => Ok(FrameType::InitAck),
            0x03 => Ok(FrameType::Health),
            0x04 => Ok(FrameType::HealthAck),
            0x05 => Ok(FrameType::ExchangeData),
            0x06 => Ok(FrameType::ExchangeEnd),
            0x07 => Ok(FrameType::Suspend),
            0x08 => Ok(FrameType::Resume),
            0x09 => Ok(FrameType::Close),
            other => Err(CodecError::UnknownFrameType(other)),
        }
    }
}

/// Why a connection is being closed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal = 0x00,
    RoutingKeyTaken = 0x01,
    AuthFailed = 0x02,
    /// A newer session registered the same routing key.
    Superseded = 0x03,
    /// Health probes went unacknowledged past the grace period.
    HealthExpired = 0x04,
    /// Pushed out of the registry by capacity pressure.
    Evicted = 0x05,
    Protocol = 0x06,
    Shutdown = 0x07,
}

impl TryFrom<u8> for CloseReason {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CloseReason::Normal),
            0x01 => Ok(CloseReason::RoutingKeyTaken),
            0x02 => Ok(CloseReason::AuthFailed),
            0x03 => Ok(CloseReason::Superseded),
            0x04 => Ok(CloseReason::HealthExpired),
            0x05 => Ok(CloseReason::Evicted),
            0x06 => Ok(CloseReason::Protocol),
            0x07 => Ok(CloseReason::Shutdown),
            _ => Err(CodecError::MalformedPayload("close")),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Normal => "normal",
            CloseReason::RoutingKeyTaken => "routing key taken",
            CloseReason::AuthFailed => "authentication failed",
            CloseReason::Superseded => "superseded",
            CloseReason::HealthExpired => "health expired",
            CloseReason::Evicted => "evicted",
            CloseReason::Protocol => "protocol violation",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Outcome carried by an `ExchangeEnd` frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Ok = 0x00,
    /// The peer could not reach its local service.
    LocalUnreachable = 0x01,
    /// The exchange was cut off after it had started producing data.
    Aborted = 0x02,
}

impl TryFrom<u8> for ExchangeStatus {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ExchangeStatus::Ok),
            0x01 => Ok(ExchangeStatus::LocalUnreachable),
            0x02 => Ok(ExchangeStatus::Aborted),
            _ => Err(CodecError::MalformedPayload("exchange end")),
        }
    }
}

/// The atomic wire unit of the tunnel protocol.
///
/// Payload bytes are opaque at this layer; `FrameType` decides which of the
/// typed payload accessors below applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub exchange_id: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Tunnel request. An empty routing key asks the server to assign one.
    pub fn init(routing_key: &str, auth_token: Option<&str>) -> Self {
        let key = routing_key.as_bytes();
        let token = auth_token.unwrap_or("").as_bytes();
        let mut payload = BytesMut::with_capacity(2 + key.len() + token.len());
        payload.put_u16(key.len() as u16);
        payload.put_slice(key);
        payload.put_slice(token);
        Self {
            frame_type: FrameType::Init,
            exchange_id: CONTROL_EXCHANGE_ID,
            payload: payload.freeze(),
        }
    }

    /// Tunnel grant: session token plus the routing key the server settled on.
    pub fn init_ack(session_token: Uuid, routing_key: &str) -> Self {
        let key = routing_key.as_bytes();
        let mut payload = BytesMut::with_capacity(16 + key.len());
        payload.put_slice(session_token.as_bytes());
        payload.put_slice(key);
        Self {
            frame_type: FrameType::InitAck,
            exchange_id: CONTROL_EXCHANGE_ID,
            payload: payload.freeze(),
        }
    }

    pub fn health(sequence: u64) -> Self {
        Self {
            frame_type: FrameType::Health,
            exchange_id: CONTROL_EXCHANGE_ID,
            payload: Bytes::copy_from_slice(&sequence.to_be_bytes()),
        }
    }

    pub fn health_ack(sequence: u64) -> Self {
        Self {
            frame_type: FrameType::HealthAck,
            exchange_id: CONTROL_EXCHANGE_ID,
            payload: Bytes::copy_from_slice(&sequence.to_be_bytes()),
        }
    }

    pub fn data(exchange_id: u64, chunk: Bytes) -> Self {
        Self {
            frame_type: FrameType::ExchangeData,
            exchange_id,
            payload: chunk,
        }
    }

    pub fn end(exchange_id: u64, status: ExchangeStatus, detail: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + detail.len());
        payload.put_u8(status as u8);
        payload.put_slice(detail.as_bytes());
        Self {
            frame_type: FrameType::ExchangeEnd,
            exchange_id,
            payload: payload.freeze(),
        }
    }

    pub fn suspend() -> Self {
        Self {
            frame_type: FrameType::Suspend,
            exchange_id: CONTROL_EXCHANGE_ID,
            payload: Bytes::new(),
        }
    }

    pub fn resume() -> Self {
        Self {
            frame_type: FrameType::Resume,
            exchange_id: CONTROL_EXCHANGE_ID,
            payload: Bytes::new(),
        }
    }

    pub fn close(reason: CloseReason, detail: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + detail.len());
        payload.put_u8(reason as u8);
        payload.put_slice(detail.as_bytes());
        Self {
            frame_type: FrameType::Close,
            exchange_id: CONTROL_EXCHANGE_ID,
            payload: payload.freeze(),
        }
    }

    /// Parse an `Init` payload into `(routing_key, auth_token)`.
    pub fn decode_init(&self) -> Result<(String, Option<String>), CodecError> {
        let p = &self.payload;
        if p.len() < 2 {
            return Err(CodecError::MalformedPayload("init"));
        }
        let key_len = u16::from_be_bytes([p[0], p[1]]) as usize;
        if p.len() < 2 + key_len {
            return Err(CodecError::MalformedPayload("init"));
        }
        let key = std::str::from_utf8(&p[2..2 + key_len])
            .map_err(|_| CodecError::MalformedPayload("init"))?
            .to_string();
        let token = std::str::from_utf8(&p[2 + key_len..])
            .map_err(|_| CodecError::MalformedPayload("init"))?;
        let token = (!token.is_empty()).then(|| token.to_string());
        Ok((key, token))
    }

    /// Parse an `InitAck` payload into `(session_token, routing_key)`.
    pub fn decode_init_ack(&self) -> Result<(Uuid, String), CodecError> {
        let p = &self.payload;
        if p.len() < 16 {
            return Err(CodecError::MalformedPayload("init ack"));
        }
        let token = Uuid::from_slice(&p[..16])
            .map_err(|_| CodecError::MalformedPayload("init ack"))?;
        let key = std::str::from_utf8(&p[16..])
            .map_err(|_| CodecError::MalformedPayload("init ack"))?
            .to_string();
        Ok((token, key))
    }

    /// Parse a `Health`/`HealthAck` payload into its sequence number.
    pub fn decode_health(&self) -> Result<u64, CodecError> {
        let p: [u8; 8] = self.payload[..]
            .try_into()
            .map_err(|_| CodecError::MalformedPayload("health"))?;
        Ok(u64::from_be_bytes(p))
    }

    /// Parse an `ExchangeEnd` payload into `(status, detail)`.
    /// An empty payload decodes as a clean `Ok` end.
    pub fn decode_end(&self) -> Result<(ExchangeStatus, String), CodecError> {
        let p = &self.payload;
        if p.is_empty() {
            return Ok((ExchangeStatus::Ok, String::new()));
        }
        let status = ExchangeStatus::try_from(p[0])?;
        let detail = String::from_utf8_lossy(&p[1..]).into_owned();
        Ok((status, detail))
    }

    /// Parse a `Close` payload into `(reason, detail)`.
    pub fn decode_close(&self) -> Result<(CloseReason, String), CodecError> {
        let p = &self.payload;
        if p.is_empty() {
            return Ok((CloseReason::Normal, String::new()));
        }
        let reason = CloseReason::try_from(p[0])?;
        let detail = String::from_utf8_lossy(&p[1..]).into_owned();
        Ok((reason, detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_payload_roundtrip() {
        let frame = Frame::init("myapp", Some("s3cret"));
        let (key, token) = frame.decode_init().unwrap();
        assert_eq!(key, "myapp");
        assert_eq!(token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn init_payload_empty_key_and_token() {
        let frame = Frame::init("", None);
        let (key, token) = frame.decode_init().unwrap();
        assert_eq!(key, "");
        assert_eq!(token, None);
    }

    #[test]
    fn init_ack_payload_roundtrip() {
        let token = Uuid::new_v4();
        let frame = Frame::init_ack(token, "assigned-key");
        let (parsed_token, key) = frame.decode_init_ack().unwrap();
        assert_eq!(parsed_token, token);
        assert_eq!(key, "assigned-key");
    }

    #[test]
    fn health_payload_roundtrip() {
        let frame = Frame::health(42);
        assert_eq!(frame.decode_health().unwrap(), 42);

        let ack = Frame::health_ack(42);
        assert_eq!(ack.decode_health().unwrap(), 42);
    }

    #[test]
    fn end_payload_roundtrip() {
        let frame = Frame::end(7, ExchangeStatus::LocalUnreachable, "connection refused");
        let (status, detail) = frame.decode_end().unwrap();
        assert_eq!(status, ExchangeStatus::LocalUnreachable);
        assert_eq!(detail, "connection refused");
    }

    #[test]
    fn empty_end_payload_is_ok() {
        let frame = Frame {
            frame_type: FrameType::ExchangeEnd,
            exchange_id: 7,
            payload: Bytes::new(),
        };
        let (status, detail) = frame.decode_end().unwrap();
        assert_eq!(status, ExchangeStatus::Ok);
        assert!(detail.is_empty());
    }

    #[test]
    fn close_payload_roundtrip() {
        let frame = Frame::close(CloseReason::RoutingKeyTaken, "myapp");
        let (reason, detail) = frame.decode_close().unwrap();
        assert_eq!(reason, CloseReason::RoutingKeyTaken);
        assert_eq!(detail, "myapp");
    }

    #[test]
    fn truncated_init_payload_rejected() {
        let frame = Frame {
            frame_type: FrameType::Init,
            exchange_id: CONTROL_EXCHANGE_ID,
            payload: Bytes::from_static(&[0x00, 0x09, b'x']),
        };
        assert!(frame.decode_init().is_err());
    }

    #[test]
    fn control_frames_use_reserved_exchange_id() {
        for frame in [
            Frame::init("k", None),
            Frame::init_ack(Uuid::new_v4(), "k"),
            Frame::health(1),
            Frame::health_ack(1),
            Frame::suspend(),
            Frame::resume(),
            Frame::close(CloseReason::Normal, ""),
        ] {
            assert_eq!(frame.exchange_id, CONTROL_EXCHANGE_ID);
            assert!(!frame.frame_type.is_exchange());
        }
    }
}

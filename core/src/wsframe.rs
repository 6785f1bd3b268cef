//! WebSocket v3 Transport framing (§4.6): encodes and decodes the binary frame format
//! shared by every `/ws` connection. This module owns only the wire shape; routing a
//! decoded frame into the Hub or PTY Host is the server crate's job.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::VtError;

pub const MAGIC: u16 = 0x5654; // 'V','T' big-endian
pub const VERSION: u8 = 3;
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Interest bitset carried in a SUBSCRIBE frame's payload.
pub mod flags {
    pub const STDOUT: u8 = 0x01;
    pub const SNAPSHOTS: u8 = 0x02;
    pub const EVENTS: u8 = 0x04;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Welcome,
    Subscribe,
    Unsubscribe,
    InputText,
    Resize,
    Stdout,
    SnapshotVt,
    Event,
    Ping,
    Pong,
}

impl FrameType {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Welcome,
            0x10 => Self::Subscribe,
            0x11 => Self::Unsubscribe,
            0x20 => Self::InputText,
            0x21 => Self::Resize,
            0x30 => Self::Stdout,
            0x31 => Self::SnapshotVt,
            0x32 => Self::Event,
            0x40 => Self::Ping,
            0x41 => Self::Pong,
            _ => return None,
        })
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::Welcome => 0x01,
            Self::Subscribe => 0x10,
            Self::Unsubscribe => 0x11,
            Self::InputText => 0x20,
            Self::Resize => 0x21,
            Self::Stdout => 0x30,
            Self::SnapshotVt => 0x31,
            Self::Event => 0x32,
            Self::Ping => 0x40,
            Self::Pong => 0x41,
        }
    }
}

/// A decoded SUBSCRIBE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribePayload {
    pub interest: u8,
    pub snapshot_min_ms: u32,
    pub snapshot_max_ms: u32,
}

/// A decoded RESIZE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

/// A fully decoded frame, borrowing nothing: `session_id` is empty for connection-scoped
/// frames (WELCOME, PING/PONG, global-events SUBSCRIBE).
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub session_id: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn welcome(payload: serde_json::Value) -> Self {
        Self {
            frame_type: FrameType::Welcome,
            session_id: String::new(),
            payload: Bytes::from(payload.to_string().into_bytes()),
        }
    }

    pub fn stdout(session_id: &str, bytes: Bytes) -> Self {
        Self { frame_type: FrameType::Stdout, session_id: session_id.to_string(), payload: bytes }
    }

    pub fn snapshot(session_id: &str, bytes: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::SnapshotVt,
            session_id: session_id.to_string(),
            payload: Bytes::from(bytes),
        }
    }

    pub fn event(session_id: &str, payload: serde_json::Value) -> Self {
        Self {
            frame_type: FrameType::Event,
            session_id: session_id.to_string(),
            payload: Bytes::from(payload.to_string().into_bytes()),
        }
    }

    pub fn global_event(payload: serde_json::Value) -> Self {
        Self::event("", payload)
    }

    pub fn pong() -> Self {
        Self { frame_type: FrameType::Pong, session_id: String::new(), payload: Bytes::new() }
    }

    pub fn ping() -> Self {
        Self { frame_type: FrameType::Ping, session_id: String::new(), payload: Bytes::new() }
    }

    pub fn subscribe(&self) -> Result<SubscribePayload, VtError> {
        if self.payload.len() < 9 {
            return Err(VtError::ProtocolError("truncated SUBSCRIBE payload".into()));
        }
        let mut p = self.payload.clone();
        let interest = p.get_u8();
        let snapshot_min_ms = p.get_u32();
        let snapshot_max_ms = p.get_u32();
        Ok(SubscribePayload { interest, snapshot_min_ms, snapshot_max_ms })
    }

    pub fn resize(&self) -> Result<ResizePayload, VtError> {
        if self.payload.len() < 4 {
            return Err(VtError::ProtocolError("truncated RESIZE payload".into()));
        }
        let mut p = self.payload.clone();
        let cols = p.get_u16();
        let rows = p.get_u16();
        Ok(ResizePayload { cols, rows })
    }

    /// Encodes this frame to its wire representation.
    pub fn encode(&self) -> Bytes {
        let session_bytes = self.session_id.as_bytes();
        let mut buf = BytesMut::with_capacity(6 + session_bytes.len() + self.payload.len());
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.frame_type.as_byte());
        buf.put_u16(session_bytes.len() as u16);
        buf.put_slice(session_bytes);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes one frame from a complete buffer (a single WS binary message). Returns
    /// `ProtocolError` for unknown magic/version, truncated frames, or oversize payloads.
    pub fn decode(mut buf: Bytes) -> Result<Self, VtError> {
        if buf.len() < 6 {
            return Err(VtError::ProtocolError("frame shorter than header".into()));
        }
        let magic = buf.get_u16();
        if magic != MAGIC {
            return Err(VtError::ProtocolError(format!("bad magic {:#06x}", magic)));
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(VtError::ProtocolError(format!("unsupported version {}", version)));
        }
        let type_byte = buf.get_u8();
        let frame_type = FrameType::from_byte(type_byte)
            .ok_or_else(|| VtError::ProtocolError(format!("unknown frame type {:#04x}", type_byte)))?;
        let session_len = buf.get_u16() as usize;
        if buf.len() < session_len {
            return Err(VtError::ProtocolError("truncated session id".into()));
        }
        let session_bytes = buf.split_to(session_len);
        let session_id = String::from_utf8(session_bytes.to_vec())
            .map_err(|_| VtError::ProtocolError("session id is not utf-8".into()))?;
        if buf.len() > MAX_PAYLOAD_BYTES {
            return Err(VtError::ProtocolError("payload exceeds 16 MiB".into()));
        }
        Ok(Self { frame_type, session_id, payload: buf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_stdout() {
        let f = Frame::stdout("abc-123", Bytes::from_static(b"hello\n"));
        let decoded = Frame::decode(f.encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Stdout);
        assert_eq!(decoded.session_id, "abc-123");
        assert_eq!(&decoded.payload[..], b"hello\n");
    }

    #[test]
    fn encode_decode_round_trip_subscribe() {
        let mut payload = BytesMut::new();
        payload.put_u8(flags::STDOUT | flags::SNAPSHOTS);
        payload.put_u32(150);
        payload.put_u32(800);
        let f = Frame {
            frame_type: FrameType::Subscribe,
            session_id: "s1".into(),
            payload: payload.freeze(),
        };
        let decoded = Frame::decode(f.encode()).unwrap();
        let sub = decoded.subscribe().unwrap();
        assert_eq!(sub.interest, flags::STDOUT | flags::SNAPSHOTS);
        assert_eq!(sub.snapshot_min_ms, 150);
        assert_eq!(sub.snapshot_max_ms, 800);
    }

    #[test]
    fn empty_session_id_is_allowed() {
        let f = Frame::ping();
        let decoded = Frame::decode(f.encode()).unwrap();
        assert!(decoded.session_id.is_empty());
        assert_eq!(decoded.frame_type, FrameType::Ping);
    }

    #[test]
    fn bad_magic_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x1234);
        buf.put_u8(VERSION);
        buf.put_u8(0x40);
        buf.put_u16(0);
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, VtError::ProtocolError(_)));
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(0xFF);
        buf.put_u16(0);
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, VtError::ProtocolError(_)));
    }

    #[test]
    fn truncated_frame_is_protocol_error() {
        let err = Frame::decode(Bytes::from_static(b"VT")).unwrap_err();
        assert!(matches!(err, VtError::ProtocolError(_)));
    }
}

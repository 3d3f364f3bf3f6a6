//! WebSocket frame codec (RFC 6455).

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close codes that must never appear on the wire.
pub const NO_STATUS: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const NORMAL_CLOSURE: u16 = 1000;
pub const PROTOCOL_ERROR: u16 = 1002;
pub const INVALID_PAYLOAD: u16 = 1007;
pub const MESSAGE_TOO_BIG: u16 = 1009;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xa => Opcode::Pong,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xa,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One frame, payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// Set on the first frame of a compressed message.
    pub rsv1: bool,
    pub opcode: Opcode,
    /// Whether the frame arrived masked.
    pub masked: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, fin: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode,
            masked: false,
            payload: payload.into(),
        }
    }

    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(Opcode::Close, true, close_payload(code, reason))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("reserved bits set")]
    ReservedBits,

    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("fragmented control frame")]
    FragmentedControl,

    #[error("control frame payload too long")]
    ControlTooLong,

    #[error("frame payload of {0} bytes exceeds limit")]
    TooLarge(u64),
}

impl FrameError {
    /// Close code to answer the violation with.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::TooLarge(_) => MESSAGE_TOO_BIG,
            _ => PROTOCOL_ERROR,
        }
    }
}

pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Takes one frame off the front of `buf`. `Ok(None)` means more bytes are
/// needed; nothing is consumed in that case.
pub fn decode(buf: &mut BytesMut, max_payload: u64) -> Result<Option<Frame>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    if b0 & 0x30 != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = Opcode::from_u8(b0 & 0x0f).ok_or(FrameError::UnknownOpcode(b0 & 0x0f))?;
    let masked = b1 & 0x80 != 0;

    let (len, mut offset) = match b1 & 0x7f {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw) & 0x7fff_ffff_ffff_ffff, 10)
        }
        n => (u64::from(n), 2),
    };
    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlTooLong);
        }
    }
    if len > max_payload {
        return Err(FrameError::TooLarge(len));
    }
    let key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };
    let len = len as usize;
    if buf.len() < offset + len {
        return Ok(None);
    }
    buf.advance(offset);
    let mut payload = buf.split_to(len);
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }
    Ok(Some(Frame {
        fin,
        rsv1,
        opcode,
        masked,
        payload: payload.freeze(),
    }))
}

/// Serializes a frame, masking the payload when `mask` is given.
pub fn encode(frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(len + 14);
    let mut b0 = frame.opcode.as_u8();
    if frame.fin {
        b0 |= 0x80;
    }
    if frame.rsv1 {
        b0 |= 0x40;
    }
    out.push(b0);
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(&frame.payload),
    }
    out
}

/// Close frame payload. Codes reserved for local use are sent as a plain
/// normal closure.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let code = match code {
        NO_STATUS | ABNORMAL_CLOSURE | 1015 => NORMAL_CLOSURE,
        code => code,
    };
    let mut payload = code.to_be_bytes().to_vec();
    let mut reason = reason.as_bytes();
    if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
        reason = &reason[..MAX_CONTROL_PAYLOAD - 2];
    }
    payload.extend_from_slice(reason);
    payload
}

/// Code and reason of a close frame; an empty payload means no status.
pub fn parse_close(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (NO_STATUS, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    (code, String::from_utf8_lossy(&payload[2..]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_masked_text_frame() {
        // RFC 6455 section 5.7.
        let mut buf = BytesMut::from(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..]);
        let frame = decode(&mut buf, u64::MAX).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.fin && frame.masked);
        assert_eq!(&frame.payload[..], b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let full = encode(&Frame::new(Opcode::Binary, true, vec![7u8; 300]), Some([1, 2, 3, 4]));
        for cut in [1, 3, 7, full.len() - 1] {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(decode(&mut buf, u64::MAX).unwrap(), None);
            assert_eq!(buf.len(), cut);
        }
        let mut buf = BytesMut::from(&full[..]);
        let frame = decode(&mut buf, u64::MAX).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
        assert!(frame.payload.iter().all(|b| *b == 7));
    }

    #[test]
    fn length_encodings() {
        assert_eq!(encode(&Frame::new(Opcode::Text, true, "hi"), None), b"\x81\x02hi");
        let medium = encode(&Frame::new(Opcode::Binary, true, vec![0u8; 256]), None);
        assert_eq!(&medium[..4], &[0x82, 126, 0x01, 0x00]);
        let large = encode(&Frame::new(Opcode::Binary, false, vec![0u8; 70_000]), None);
        assert_eq!(&large[..2], &[0x02, 127]);
        assert_eq!(&large[2..10], &70_000u64.to_be_bytes());
    }

    #[test]
    fn control_frame_rules() {
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert_eq!(decode(&mut buf, u64::MAX), Err(FrameError::FragmentedControl));
        let mut buf = BytesMut::from(&[0x89, 126, 0x00, 0x80][..]);
        assert_eq!(decode(&mut buf, u64::MAX), Err(FrameError::ControlTooLong));
        let mut buf = BytesMut::from(&[0xa1, 0x00][..]);
        assert_eq!(decode(&mut buf, u64::MAX), Err(FrameError::ReservedBits));
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        assert_eq!(decode(&mut buf, u64::MAX), Err(FrameError::UnknownOpcode(3)));
    }

    #[test]
    fn size_limit_maps_to_1009() {
        let mut buf = BytesMut::from(&[0x82, 126, 0x10, 0x00][..]);
        let err = decode(&mut buf, 1024).unwrap_err();
        assert_eq!(err.close_code(), MESSAGE_TOO_BIG);
    }

    #[test]
    fn close_payloads() {
        assert_eq!(parse_close(&close_payload(1001, "going away")), (1001, "going away".to_string()));
        assert_eq!(parse_close(&[]), (NO_STATUS, String::new()));
        assert_eq!(parse_close(&close_payload(ABNORMAL_CLOSURE, "")).0, NORMAL_CLOSURE);
        assert_eq!(close_payload(1000, &"x".repeat(200)).len(), MAX_CONTROL_PAYLOAD);
    }
}

//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the atomic wire unit: a 2-byte base header, an optional
//! extended length (16 or 64 bits), an optional 4-byte mask key, and the
//! payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data frames** ([`OpCode::Text`], [`OpCode::Binary`], and
//!   [`OpCode::Continuation`] for fragmented messages).
//! - **Control frames** ([`OpCode::Close`], [`OpCode::Ping`],
//!   [`OpCode::Pong`]) which manage the connection, must carry at most 125
//!   payload bytes, and must not be fragmented.
//!
//! Every frame this runtime puts on the wire is masked, as required of
//! clients by RFC 6455; the mask key comes from the per-session PRNG so keys
//! do not repeat across frames.

use bytes::BytesMut;
use rand::RngCore;

use crate::{close::CloseCode, mask::apply_mask, WsError};

/// Upper bound for a serialized frame header: 2 base bytes, an 8-byte
/// extended length, and a 4-byte mask key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code, identifying how a frame is to be interpreted.
///
/// The numeric values are defined in
/// [RFC 6455 Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// Continuation = 0x0, Text = 0x1, Binary = 0x2, Close = 0x8, Ping = 0x9,
/// Pong = 0xA. The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected
/// during decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the opcode denotes a control frame (`Close`, `Ping`
    /// or `Pong`).
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WsError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A single WebSocket frame.
///
/// Inbound frames produced by the decoder arrive with their payload already
/// unmasked. Outbound frames are masked with a key from the per-session PRNG
/// right before encoding.
pub struct Frame {
    /// Final fragment flag. `true` means this frame completes a message.
    pub fin: bool,
    /// The frame type.
    pub opcode: OpCode,
    /// Mask key, present once the frame has been masked for transmission.
    pub(crate) mask: Option<[u8; 4]>,
    /// Payload bytes.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a frame from raw parts.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, payload.as_ref())
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, payload.as_ref())
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, payload.as_ref())
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, payload.as_ref())
    }

    /// Creates a close frame carrying a status code and an optional reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self {
            fin: true,
            opcode: OpCode::Close,
            mask: None,
            payload,
        }
    }

    /// Extracts the status code from a Close frame payload.
    ///
    /// Returns `None` when the payload is shorter than the 2-byte code, which
    /// the session maps to [`CloseCode::NoStatusReceived`].
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Extracts the UTF-8 reason from a Close frame payload, if present.
    pub fn close_reason(&self) -> Option<&str> {
        if self.payload.len() <= 2 {
            return None;
        }
        std::str::from_utf8(&self.payload[2..]).ok()
    }

    /// Returns whether the frame currently carries a mask key.
    #[inline(always)]
    pub(crate) fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Masks the payload with a fresh key drawn from `rng`.
    ///
    /// Calling this on an already-masked frame is a no-op; the original key
    /// stays in effect.
    pub(crate) fn mask_with(&mut self, rng: &mut impl RngCore) {
        if self.mask.is_none() {
            let mut key = [0u8; 4];
            rng.fill_bytes(&mut key);
            apply_mask(&mut self.payload, key);
            self.mask = Some(key);
        }
    }

    /// Reverses masking using the stored key and clears it.
    pub(crate) fn unmask(&mut self) {
        if let Some(key) = self.mask.take() {
            apply_mask(&mut self.payload, key);
        }
    }

    /// Serializes the frame header into `head`, returning the header size.
    ///
    /// `head` must hold at least [`MAX_HEAD_SIZE`] bytes.
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

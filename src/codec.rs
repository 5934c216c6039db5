//! Incremental frame encoding and decoding.
//!
//! [`Decoder`] parses frames out of a growing byte buffer fed by the I/O
//! loop. Parsing is staged so a frame split across any number of socket reads
//! is handled without copying: the base header is parsed first, then the
//! extended length and mask key, then the payload is split off the buffer
//! once it is complete.
//!
//! [`encode`] serializes an outbound frame (header plus already-masked
//! payload) into a destination buffer for a single vectored write.
//!
//! Protocol violations surface as [`WsError`] values: reserved opcodes,
//! fragmented or oversized control frames, and payloads above the configured
//! message limit. Inbound masked frames are abnormal for a client (servers
//! must not mask) but are tolerated and unmasked.

use bytes::{Buf, BytesMut};

use crate::{
    frame::{Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    OpCode, WsError,
};

/// Decoding state carried between reads.
enum ReadState {
    /// Base header parsed; waiting for the extended length and mask key.
    Header(Header),
    /// Full header parsed; waiting for the payload.
    Payload(HeaderAndMask),
}

/// Fields recovered from the 2-byte base header.
struct Header {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// Length of the extended-length field (0, 2 or 8 bytes).
    extra: usize,
    /// 7-bit length code from the base header.
    length_code: u8,
    /// Remaining header bytes: extended length plus mask key.
    header_size: usize,
}

/// Fully parsed header, ready for payload extraction.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Stateful frame parser over an incrementally filled buffer.
pub struct Decoder {
    state: Option<ReadState>,
    /// Maximum accepted payload length for a single frame.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a decoder that rejects frames whose payload exceeds
    /// `max_payload_size` bytes.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
        }
    }

    /// Extracts the next complete frame from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `src` as each stage completes, so the caller just keeps
    /// appending socket reads and calling `decode` until it returns `None`.
    ///
    /// Inbound frames that carry a mask key (abnormal for a server, see RFC
    /// 6455 Section 5.1) are unmasked before being returned.
    pub fn decode(&mut self, src: &mut BytesMut) -> crate::Result<Option<Frame>> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => match usize::try_from(src.get_u64()) {
                            Ok(length) => length,
                            Err(_) => {
                                return Err(WsError::MessageTooLarge {
                                    size: u64::MAX,
                                    limit: self.max_payload_size,
                                })
                            }
                        },
                        _ => unreachable!(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WsError::InvalidFrame("fragmented control frame"));
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WsError::InvalidFrame("control frame payload over 125 bytes"));
                        }
                    }
                    if payload_len > self.max_payload_size {
                        return Err(WsError::MessageTooLarge {
                            size: payload_len as u64,
                            limit: self.max_payload_size,
                        });
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(staged)) => {
                    if src.remaining() < staged.payload_len {
                        self.state = Some(ReadState::Payload(staged));
                        return Ok(None);
                    }

                    let payload = src.split_to(staged.payload_len);
                    let mut frame =
                        Frame::new(staged.header.fin, staged.header.opcode, staged.mask, payload);
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Serializes `frame` into `dst`.
///
/// The payload is written as stored; callers mask outbound frames before
/// encoding.
pub fn encode(frame: &Frame, dst: &mut BytesMut) {
    let mut head = [0u8; MAX_HEAD_SIZE];
    let size = frame.fmt_head(&mut head);

    dst.reserve(size + frame.payload.len());
    dst.extend_from_slice(&head[..size]);
    dst.extend_from_slice(&frame.payload);
}

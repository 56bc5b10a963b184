//! WebSocket frame codec
//!
//! [[RFC6455, Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2)]
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use crate::{
    errors::{CloseCode, WsError},
    wire::*,
};

/// A single WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    /// Masking key as received. Payloads are stored unmasked.
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Unmasked frame with all RSV bits clear.
    #[inline]
    pub fn new(opcode: OpCode, payload: Vec<u8>, fin: bool) -> Self {
        Self {
            opcode,
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            mask: None,
            payload,
        }
    }

    /// Close frame. Codes that may not be sent are replaced by an empty body.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = Vec::new();

        if code.is_sendable() {
            payload.extend_from_slice(&code.0.to_be_bytes());

            // Control payloads are capped at 125 bytes
            let mut end = reason.len().min(MAX_SHORT_LEN - 2);
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            payload.extend_from_slice(&reason.as_bytes()[..end]);
        }

        Self::new(OpCode::Close, payload, true)
    }

    /// Code and reason of a close frame. An empty body reports
    /// [`CloseCode::NO_STATUS`].
    pub(crate) fn parse_close(&self) -> Result<(CloseCode, String), WsError> {
        match self.payload.as_slice() {
            [] => Ok((CloseCode::NO_STATUS, String::new())),
            [_] => Err(WsError::Protocol("close frame with a 1-byte body")),
            [hi, lo, reason @ ..] => {
                let code = CloseCode(u16::from_be_bytes([*hi, *lo]));
                if !code.is_sendable() {
                    return Err(WsError::Protocol("invalid close code"));
                }

                let reason =
                    simdutf8::basic::from_utf8(reason).map_err(|_| WsError::InvalidUtf8)?;
                Ok((code, reason.to_owned()))
            }
        }
    }

    #[inline]
    pub(crate) fn has_rsv(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    /// Appends the wire form of the frame to `out`, using the shortest
    /// length encoding. The payload is masked only when `mask` is set.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut first = self.opcode as u8;
        for (set, bit) in [
            (self.fin, FIN_BIT),
            (self.rsv1, RSV1_BIT),
            (self.rsv2, RSV2_BIT),
            (self.rsv3, RSV3_BIT),
        ] {
            if set {
                first |= bit;
            }
        }
        out.push(first);

        let mask_bit = match self.mask {
            Some(_) => MASK_BIT,
            None => 0,
        };

        let len = self.payload.len();
        match len {
            0..=MAX_SHORT_LEN => out.push(mask_bit | len as u8),
            _ if len <= u16::MAX as usize => {
                out.push(mask_bit | LEN_16);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            _ => {
                out.push(mask_bit | LEN_64);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }

        match self.mask {
            None => out.extend_from_slice(&self.payload),
            Some(key) => {
                out.extend_from_slice(&key);
                out.extend(self.payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Opcode,
    Length,
    ExtendedLength { need: u8, got: u8, value: u64 },
    MaskKey { got: u8 },
    Payload { remaining: usize },
}

/// Byte-driven frame decoder.
///
/// Fed one byte at a time through [`push`](Self::push), so it does not care
/// how bytes are delivered. Payload bytes are unmasked as they arrive.
#[derive(Debug)]
pub(crate) struct FrameDecoder {
    state: State,
    max_frame_size: usize,
    frame: Frame,
    masked: bool,
    mask_index: usize,
    payload_len: usize,
}

impl FrameDecoder {
    pub(crate) fn new(max_frame_size: usize) -> Self {
        Self {
            state: State::Opcode,
            max_frame_size,
            frame: Frame::new(OpCode::Continuation, Vec::new(), false),
            masked: false,
            mask_index: 0,
            payload_len: 0,
        }
    }

    /// Consumes one byte. Returns the frame it completed, if any.
    pub(crate) fn push(&mut self, byte: u8) -> Result<Option<Frame>, WsError> {
        match self.state {
            State::Opcode => {
                let opcode = OpCode::from_u8(byte & OPCODE_MASK)
                    .ok_or(WsError::Protocol("unknown opcode"))?;

                let mut frame = Frame::new(opcode, Vec::new(), byte & FIN_BIT != 0);
                frame.rsv1 = byte & RSV1_BIT != 0;
                frame.rsv2 = byte & RSV2_BIT != 0;
                frame.rsv3 = byte & RSV3_BIT != 0;

                if opcode.is_control() && !frame.fin {
                    return Err(WsError::Protocol("fragmented control frame"));
                }

                self.frame = frame;
                self.state = State::Length;
                Ok(None)
            }
            State::Length => {
                self.masked = byte & MASK_BIT != 0;

                match byte & LENGTH_MASK {
                    LEN_16 => self.state = State::ExtendedLength { need: 2, got: 0, value: 0 },
                    LEN_64 => self.state = State::ExtendedLength { need: 8, got: 0, value: 0 },
                    len => return self.start_payload(len as u64),
                }
                Ok(None)
            }
            State::ExtendedLength { need, got, value } => {
                let value = (value << 8) | byte as u64;

                match got + 1 == need {
                    true => self.start_payload(value),
                    false => {
                        self.state = State::ExtendedLength { need, got: got + 1, value };
                        Ok(None)
                    }
                }
            }
            State::MaskKey { got } => {
                let key = self.frame.mask.get_or_insert([0; 4]);
                key[got as usize] = byte;

                match (got + 1, self.payload_len) {
                    (4, 0) => Ok(Some(self.complete())),
                    (4, remaining) => {
                        self.state = State::Payload { remaining };
                        Ok(None)
                    }
                    (got, _) => {
                        self.state = State::MaskKey { got };
                        Ok(None)
                    }
                }
            }
            State::Payload { remaining } => {
                let byte = match self.frame.mask {
                    Some(key) => byte ^ key[self.mask_index % 4],
                    None => byte,
                };
                self.mask_index += 1;
                self.frame.payload.push(byte);

                match remaining - 1 {
                    0 => Ok(Some(self.complete())),
                    remaining => {
                        self.state = State::Payload { remaining };
                        Ok(None)
                    }
                }
            }
        }
    }

    fn start_payload(&mut self, len: u64) -> Result<Option<Frame>, WsError> {
        if self.frame.opcode.is_control() && len > MAX_SHORT_LEN as u64 {
            return Err(WsError::Protocol("control frame payload over 125 bytes"));
        }
        if len > u32::MAX as u64 {
            return Err(WsError::Protocol("frame length over 32 bits"));
        }

        let len = len as usize;
        if len > self.max_frame_size {
            return Err(WsError::MessageTooBig);
        }

        self.frame.payload.reserve_exact(len);
        self.payload_len = len;
        self.mask_index = 0;

        match (self.masked, len) {
            (true, _) => {
                self.state = State::MaskKey { got: 0 };
                Ok(None)
            }
            (false, 0) => Ok(Some(self.complete())),
            (false, remaining) => {
                self.state = State::Payload { remaining };
                Ok(None)
            }
        }
    }

    #[inline]
    fn complete(&mut self) -> Frame {
        self.state = State::Opcode;
        std::mem::replace(&mut self.frame, Frame::new(OpCode::Continuation, Vec::new(), false))
    }
}

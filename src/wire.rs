//! Byte-level constants shared by the HTTP and WebSocket codecs

/// Line terminator for the request line, header lines and chunk size lines.
pub(crate) const CRLF: &[u8] = b"\r\n";

/// Magic value concatenated with `Sec-WebSocket-Key` before hashing.
pub(crate) const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Tail of a deflate block flushed with `Z_SYNC_FLUSH`.
///
/// Stripped from every compressed message and appended back before inflating.
pub(crate) const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

pub(crate) const FIN_BIT: u8 = 0x80;
pub(crate) const RSV1_BIT: u8 = 0x40;
pub(crate) const RSV2_BIT: u8 = 0x20;
pub(crate) const RSV3_BIT: u8 = 0x10;
pub(crate) const OPCODE_MASK: u8 = 0x0F;
pub(crate) const MASK_BIT: u8 = 0x80;
pub(crate) const LENGTH_MASK: u8 = 0x7F;

/// Largest payload that fits in the 7-bit length field.
pub(crate) const MAX_SHORT_LEN: usize = 125;
/// Marker for a 16-bit extended length.
pub(crate) const LEN_16: u8 = 126;
/// Marker for a 64-bit extended length.
pub(crate) const LEN_64: u8 = 127;

/// WebSocket frame opcode
///
/// [[RFC6455, Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message
    Continuation = 0x0,
    /// UTF-8 text message
    Text = 0x1,
    /// Binary message
    Binary = 0x2,
    /// Close handshake
    Close = 0x8,
    /// Ping, answered with a pong
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    #[inline]
    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns `true` for close, ping and pong.
    #[inline]
    pub const fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }

    /// Returns `true` for text, binary and continuation.
    #[inline]
    pub const fn is_data(self) -> bool {
        !self.is_control()
    }
}

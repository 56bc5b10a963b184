//! `permessage-deflate` extension
//!
//! [[RFC7692](https://datatracker.ietf.org/doc/html/rfc7692)]

use crate::{
    errors::WsError,
    wire::{OpCode, DEFLATE_TAIL},
    ws::{
        extension::{Extension, Negotiation, NoExtension},
        frame::Frame,
    },
};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const NAME: &str = "permessage-deflate";

/// Compression of message payloads with raw DEFLATE.
///
/// Only the 15-bit window is supported, so offers asking for a smaller
/// `server_max_window_bits` are declined. A client that offers nothing usable
/// still gets its upgrade, just without compression.
///
/// # Examples
/// ```
/// use maker_ws::PerMessageDeflate;
///
/// let deflate = PerMessageDeflate::new()
///     .level(3)
///     .threshold(256)
///     .server_no_context_takeover(true);
/// ```
pub struct PerMessageDeflate {
    level: u32,
    threshold: usize,
    max_inflated: usize,
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,

    enabled: bool,
    compress: Compress,
    decompress: Decompress,
    /// The message being received started with RSV1 set.
    inbound_compressed: bool,
}

impl std::fmt::Debug for PerMessageDeflate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerMessageDeflate")
            .field("level", &self.level)
            .field("threshold", &self.threshold)
            .field("enabled", &self.enabled)
            .field("server_no_context_takeover", &self.server_no_context_takeover)
            .field("client_no_context_takeover", &self.client_no_context_takeover)
            .finish_non_exhaustive()
    }
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        Self::new()
    }
}

impl PerMessageDeflate {
    pub fn new() -> Self {
        Self {
            level: 6,
            threshold: 32,
            max_inflated: 4 * 1024 * 1024,
            server_no_context_takeover: false,
            client_no_context_takeover: false,

            enabled: false,
            compress: Compress::new(Compression::new(6), false),
            decompress: Decompress::new(false),
            inbound_compressed: false,
        }
    }

    /// Compression level, 0 to 9 (default: `6`).
    pub fn level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self.compress = Compress::new(Compression::new(self.level), false);
        self
    }

    /// Messages shorter than this are sent uncompressed (default: `32`).
    pub fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Largest payload one frame may inflate to (default: `4 MB`).
    pub fn max_inflated_size(mut self, size: usize) -> Self {
        self.max_inflated = size;
        self
    }

    /// Reset the compressor after every message even if the client did not
    /// ask for it (default: `false`).
    pub fn server_no_context_takeover(mut self, enabled: bool) -> Self {
        self.server_no_context_takeover = enabled;
        self
    }

    /// `true` once an offer was accepted.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Checks one offer, returning the flags it asks for.
    fn accept_offer(offer: &str) -> Option<(bool, bool)> {
        let mut params = offer.split(';').map(str::trim);
        if !params.next()?.eq_ignore_ascii_case(NAME) {
            return None;
        }

        let (mut server_nct, mut client_nct) = (false, false);
        let (mut server_bits, mut client_bits) = (false, false);

        for param in params.filter(|p| !p.is_empty()) {
            let (name, value) = match param.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (param, None),
            };

            let (seen, ok) = match name {
                "server_no_context_takeover" => (&mut server_nct, value.is_none()),
                "client_no_context_takeover" => (&mut client_nct, value.is_none()),
                // Only the full window is available for compression
                "server_max_window_bits" => (&mut server_bits, value == Some("15")),
                "client_max_window_bits" => (
                    &mut client_bits,
                    value.map_or(true, |v| matches!(v.parse::<u8>(), Ok(8..=15))),
                ),
                _ => return None,
            };

            if *seen || !ok {
                return None;
            }
            *seen = true;
        }

        Some((server_nct, client_nct))
    }

    fn inflate(&mut self, input: &[u8]) -> Result<Vec<u8>, WsError> {
        let mut out = Vec::with_capacity((input.len() * 4).max(64).min(self.max_inflated + 1));
        let mut consumed = 0;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(4096));
            }

            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| WsError::Extension(format!("inflate error: {e}")))?;
            consumed += (self.decompress.total_in() - before) as usize;

            if out.len() > self.max_inflated {
                return Err(WsError::MessageTooBig);
            }

            let drained = consumed == input.len() && out.len() < out.capacity();
            match status {
                Status::StreamEnd => break,
                Status::Ok if drained => break,
                Status::BufError if consumed == input.len() => break,
                Status::Ok | Status::BufError => {}
            }
        }

        Ok(out)
    }

    fn deflate(&mut self, input: &[u8]) -> Result<Vec<u8>, WsError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let mut consumed = 0;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(4096));
            }

            let before = self.compress.total_in();
            self.compress
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| WsError::Extension(format!("deflate error: {e}")))?;
            consumed += (self.compress.total_in() - before) as usize;

            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }
        Ok(out)
    }
}

impl Extension for PerMessageDeflate {
    fn negotiate(&mut self, offer: Option<&str>) -> Negotiation {
        let accepted = offer
            .into_iter()
            .flat_map(|header| header.split(','))
            .find_map(Self::accept_offer);

        let Some((server_nct, client_nct)) = accepted else {
            self.enabled = false;
            return Negotiation::Accept(None);
        };

        self.enabled = true;
        self.server_no_context_takeover |= server_nct;
        self.client_no_context_takeover = client_nct;

        let mut echo = String::from(NAME);
        if self.server_no_context_takeover {
            echo.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            echo.push_str("; client_no_context_takeover");
        }
        Negotiation::Accept(Some(echo))
    }

    fn decode(&mut self, frame: &mut Frame) -> Result<(), WsError> {
        if !self.enabled {
            return NoExtension.decode(frame);
        }
        if frame.rsv2 || frame.rsv3 {
            return Err(WsError::Protocol("reserved bits set"));
        }

        match frame.opcode {
            _ if frame.opcode.is_control() && frame.rsv1 => {
                return Err(WsError::Protocol("compressed control frame"));
            }
            OpCode::Continuation if frame.rsv1 => {
                return Err(WsError::Protocol("RSV1 set on a continuation frame"));
            }
            OpCode::Text | OpCode::Binary => self.inbound_compressed = frame.rsv1,
            _ => {}
        }

        if frame.opcode.is_control() || !self.inbound_compressed {
            return Ok(());
        }

        let mut input = std::mem::take(&mut frame.payload);
        if frame.fin {
            input.extend_from_slice(&DEFLATE_TAIL);
        }

        frame.payload = self.inflate(&input)?;
        frame.rsv1 = false;

        if frame.fin {
            self.inbound_compressed = false;
            if self.client_no_context_takeover {
                self.decompress.reset(false);
            }
        }
        Ok(())
    }

    fn encode(&mut self, frame: &mut Frame) -> Result<(), WsError> {
        let whole_message = frame.fin && matches!(frame.opcode, OpCode::Text | OpCode::Binary);
        if !self.enabled || !whole_message || frame.payload.len() < self.threshold {
            return Ok(());
        }

        frame.payload = self.deflate(&frame.payload)?;
        frame.rsv1 = true;

        if self.server_no_context_takeover {
            self.compress.reset();
        }
        Ok(())
    }
}

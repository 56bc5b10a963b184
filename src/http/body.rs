//! Request body decoding and the lazy [`Body`] source.

use crate::{
    errors::ErrorKind,
    http::{
        headers::HeaderSet,
        query::{self, Query},
        types::hex_to_usize,
    },
    server::inbox::Inbox,
};
use std::{collections::HashMap, io, time::Duration};
use tokio::io::AsyncRead;

const MAX_CHUNK_SIZE_DIGITS: usize = 16;
const MAX_CHUNK_EXTENSION: usize = 1024;
const MAX_TRAILER: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chunk {
    Size { digits: usize },
    Extension { seen: usize },
    SizeLf,
    Data { remaining: usize },
    DataCr,
    DataLf,
    Trailer { line_start: bool, seen: usize },
    TrailerLf { seen: usize },
    EndLf,
}

/// Body framing state machine, fixed length or chunked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decoder {
    Fixed { remaining: usize },
    Chunked { state: Chunk, size: usize },
    Done,
}

impl Decoder {
    pub(crate) fn for_headers(headers: &HeaderSet) -> Self {
        match (headers.is_chunked(), headers.content_length()) {
            (true, _) => Decoder::Chunked {
                state: Chunk::Size { digits: 0 },
                size: 0,
            },
            (false, Some(n)) if n > 0 => Decoder::Fixed { remaining: n },
            _ => Decoder::Done,
        }
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        matches!(self, Decoder::Done)
    }

    /// Decodes body bytes from `input` into `out`.
    ///
    /// Returns how many input bytes were consumed; anything past the end of
    /// the body is left untouched.
    pub(crate) fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ErrorKind> {
        match self {
            Decoder::Done => Ok(0),
            Decoder::Fixed { remaining } => {
                let n = (*remaining).min(input.len());
                out.extend_from_slice(&input[..n]);
                *remaining -= n;
                if *remaining == 0 {
                    *self = Decoder::Done;
                }
                Ok(n)
            }
            Decoder::Chunked { state, size } => {
                let mut i = 0;

                while i < input.len() {
                    let byte = input[i];

                    *state = match *state {
                        Chunk::Size { digits } => match byte {
                            b';' | b' ' | b'\t' if digits > 0 => Chunk::Extension { seen: 0 },
                            b'\r' if digits > 0 => Chunk::SizeLf,
                            _ if digits < MAX_CHUNK_SIZE_DIGITS => {
                                let digit = hex_to_usize(&[byte]).ok_or(ErrorKind::InvalidChunk)?;
                                *size = size
                                    .checked_mul(16)
                                    .and_then(|s| s.checked_add(digit))
                                    .ok_or(ErrorKind::InvalidChunk)?;
                                Chunk::Size { digits: digits + 1 }
                            }
                            _ => return Err(ErrorKind::InvalidChunk),
                        },
                        Chunk::Extension { seen } => match byte {
                            b'\r' => Chunk::SizeLf,
                            _ if seen < MAX_CHUNK_EXTENSION => Chunk::Extension { seen: seen + 1 },
                            _ => return Err(ErrorKind::InvalidChunk),
                        },
                        Chunk::SizeLf => match (byte, *size) {
                            (b'\n', 0) => Chunk::Trailer {
                                line_start: true,
                                seen: 0,
                            },
                            (b'\n', n) => Chunk::Data { remaining: n },
                            _ => return Err(ErrorKind::InvalidChunk),
                        },
                        Chunk::Data { remaining } => {
                            let n = remaining.min(input.len() - i);
                            out.extend_from_slice(&input[i..i + n]);
                            i += n;

                            *state = match remaining - n {
                                0 => Chunk::DataCr,
                                left => Chunk::Data { remaining: left },
                            };
                            continue;
                        }
                        Chunk::DataCr if byte == b'\r' => Chunk::DataLf,
                        Chunk::DataLf if byte == b'\n' => {
                            *size = 0;
                            Chunk::Size { digits: 0 }
                        }
                        Chunk::DataCr | Chunk::DataLf => return Err(ErrorKind::InvalidChunk),

                        // Trailer fields are read and discarded
                        Chunk::Trailer { line_start, seen } => match (byte, line_start) {
                            _ if seen >= MAX_TRAILER => return Err(ErrorKind::HeaderTooLarge),
                            (b'\r', true) => Chunk::EndLf,
                            (b'\r', false) => Chunk::TrailerLf { seen: seen + 1 },
                            _ => Chunk::Trailer {
                                line_start: false,
                                seen: seen + 1,
                            },
                        },
                        Chunk::TrailerLf { seen } if byte == b'\n' => Chunk::Trailer {
                            line_start: true,
                            seen: seen + 1,
                        },
                        Chunk::TrailerLf { .. } => return Err(ErrorKind::InvalidChunk),
                        Chunk::EndLf if byte == b'\n' => {
                            *self = Decoder::Done;
                            return Ok(i + 1);
                        }
                        Chunk::EndLf => return Err(ErrorKind::InvalidChunk),
                    };
                    i += 1;
                }

                Ok(i)
            }
        }
    }
}

/// Errors surfaced to the dispatcher while pulling the request body.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    /// The body is larger than [`ReqLimits::body_size`](crate::limits::ReqLimits::body_size).
    #[error("request body too large")]
    TooLarge,
    /// The chunked framing is malformed.
    #[error("malformed request body")]
    Malformed,
    /// The client stopped sending before the body was complete.
    #[error("request body read timed out")]
    TimedOut,
    /// The client closed the connection before the body was complete.
    #[error("connection closed before the body was complete")]
    Closed,
    #[error("i/o error while reading the body: {0}")]
    Io(io::Error),
    /// [`Body::text`] on a body that is not UTF-8.
    #[error("request body is not valid UTF-8")]
    InvalidUtf8,
    /// [`Body::form`] on a body that is not a valid form.
    #[error("invalid form body: {0}")]
    Form(#[from] query::Error),
}

impl From<&ErrorKind> for BodyError {
    fn from(kind: &ErrorKind) -> Self {
        match kind {
            ErrorKind::BodyTooLarge => BodyError::TooLarge,
            ErrorKind::Timeout => BodyError::TimedOut,
            ErrorKind::Eof => BodyError::Closed,
            ErrorKind::Io(err) => BodyError::Io(io::Error::new(err.0.kind(), err.0.to_string())),
            _ => BodyError::Malformed,
        }
    }
}

/// Lazy source of the request body.
///
/// Nothing is read from the socket until the dispatcher asks for the body.
/// The first successful read is cached for the rest of the request, and so
/// are the decoded views built on top of it.
///
/// # Examples
/// ```
/// use maker_ws::{Body, BodyError};
///
/// async fn greet(body: &mut Body<'_>) -> Result<String, BodyError> {
///     let form = body.form().await?;
///     Ok(format!("Hello, {}!", form.get("name").map_or("stranger", String::as_str)))
/// }
/// ```
pub struct Body<'a> {
    inbox: &'a mut Inbox,
    reader: &'a mut (dyn AsyncRead + Unpin + Send),
    decoder: Decoder,
    limit: usize,
    form_limit: usize,
    timeout: Duration,

    raw: Option<Vec<u8>>,
    form: Option<HashMap<String, String>>,
    failure: Option<ErrorKind>,
}

impl<'a> Body<'a> {
    pub(crate) fn new(
        inbox: &'a mut Inbox,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
        decoder: Decoder,
        limit: usize,
        form_limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            inbox,
            reader,
            decoder,
            limit,
            form_limit,
            timeout,
            raw: None,
            form: None,
            failure: None,
        }
    }

    /// `true` when the request carries no body at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_none() && self.decoder.is_done()
    }

    /// The raw body bytes, read and cached on first call.
    pub async fn bytes(&mut self) -> Result<&[u8], BodyError> {
        if let Some(kind) = &self.failure {
            return Err(kind.into());
        }

        if self.raw.is_none() {
            if let Err(kind) = self.read_all().await {
                let err = BodyError::from(&kind);
                self.failure = Some(kind);
                return Err(err);
            }
        }

        Ok(self.raw.as_deref().unwrap_or_default())
    }

    /// The body as UTF-8 text.
    pub async fn text(&mut self) -> Result<&str, BodyError> {
        let raw = self.bytes().await?;
        simdutf8::basic::from_utf8(raw).map_err(|_| BodyError::InvalidUtf8)
    }

    /// The body decoded as `application/x-www-form-urlencoded`, cached on
    /// first call. A repeated field keeps its last value.
    pub async fn form(&mut self) -> Result<&HashMap<String, String>, BodyError> {
        if self.form.is_none() {
            let limit = self.form_limit;
            let raw = self.bytes().await?;
            let parsed: HashMap<String, String> = Query::parse(raw, limit)?;
            self.form = Some(parsed);
        }

        Ok(self.form.get_or_insert_with(HashMap::new))
    }

    async fn read_all(&mut self) -> Result<(), ErrorKind> {
        let mut out = Vec::new();

        loop {
            if !self.inbox.is_empty() {
                let n = self.decoder.decode(self.inbox.pending(), &mut out)?;
                self.inbox.consume(n);

                if out.len() > self.limit {
                    return Err(ErrorKind::BodyTooLarge);
                }
            }

            if self.decoder.is_done() {
                break;
            }

            if self.inbox.fill(&mut *self.reader, self.timeout).await? == 0 {
                return Err(ErrorKind::Eof);
            }
        }

        self.raw = Some(out);
        Ok(())
    }

    /// What the connection must do with the socket after dispatch.
    pub(crate) fn into_outcome(self) -> BodyOutcome {
        match (self.failure, self.decoder.is_done()) {
            (Some(kind), _) => BodyOutcome::Failed(kind),
            (None, true) => BodyOutcome::Drained,
            (None, false) => BodyOutcome::Unread,
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum BodyOutcome {
    Drained,
    /// Body bytes are still on the socket; it cannot be reused.
    Unread,
    Failed(ErrorKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn chunked() -> Decoder {
        Decoder::Chunked {
            state: Chunk::Size { digits: 0 },
            size: 0,
        }
    }

    fn decode_all(mut decoder: Decoder, input: &[u8]) -> Result<(Vec<u8>, usize), ErrorKind> {
        let mut out = Vec::new();
        let n = decoder.decode(input, &mut out)?;
        assert!(decoder.is_done(), "not done: {decoder:?}");
        Ok((out, n))
    }

    #[test]
    fn fixed() {
        let (out, n) = decode_all(Decoder::Fixed { remaining: 5 }, b"helloGET /").unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(n, 5);
    }

    #[test]
    fn chunked_cases() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[u8]); 5] = [
            (b"0\r\n\r\n",                                  b""),
            (b"5\r\nhello\r\n0\r\n\r\n",                     b"hello"),
            (b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\n\r\n", b"hello world"),
            (b"A\r\n0123456789\r\n0\r\n\r\n",               b"0123456789"),
            (b"3\r\nabc\r\n0\r\nX-Trailer: 1\r\n\r\n",      b"abc"),
        ];

        for (input, expected) in cases {
            let mut with_tail = input.to_vec();
            with_tail.extend_from_slice(b"NEXT");

            let (out, n) = decode_all(chunked(), &with_tail).unwrap();
            assert_eq!(out, expected);
            assert_eq!(n, input.len());
        }
    }

    #[test]
    fn chunked_errors() {
        #[rustfmt::skip]
        let cases: [&[u8]; 6] = [
            b"\r\n",
            b"z\r\n",
            b"5\nhello",
            b"3\r\nabcX",
            b"11111111111111111\r\n",
            b"0\r\n\rX",
        ];

        for input in cases {
            let mut out = Vec::new();
            assert_eq!(
                chunked().decode(input, &mut out),
                Err(ErrorKind::InvalidChunk),
                "{:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn chunked_any_split() {
        let input = b"4\r\nWiki\r\n5;x\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nT: v\r\n\r\n";

        for chunk in 1..input.len() {
            let mut decoder = chunked();
            let mut out = Vec::new();

            for part in input.chunks(chunk) {
                assert_eq!(decoder.decode(part, &mut out).unwrap(), part.len());
            }

            assert!(decoder.is_done(), "chunk {chunk}");
            assert_eq!(out, b"Wikipedia in\r\n\r\nchunks.", "chunk {chunk}");
        }
    }

    #[tokio::test]
    async fn lazy_read_and_cache() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut inbox = Inbox::from_bytes(b"name=Jo");
        client.write_all(b"hn+Doe&x=1").await.unwrap();

        let mut body = Body::new(
            &mut inbox,
            &mut server,
            Decoder::Fixed { remaining: 17 },
            1024,
            8,
            Duration::from_secs(1),
        );

        assert!(!body.is_empty());
        assert_eq!(body.text().await.unwrap(), "name=John+Doe&x=1");
        assert_eq!(body.form().await.unwrap()["name"], "John Doe");
        assert_eq!(body.form().await.unwrap().len(), 2);
        assert_eq!(body.bytes().await.unwrap().len(), 17);
        assert_eq!(body.into_outcome(), BodyOutcome::Drained);
    }

    #[tokio::test]
    async fn untouched_body_is_unread() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut inbox = Inbox::new(64);

        let body = Body::new(
            &mut inbox,
            &mut server,
            Decoder::Fixed { remaining: 3 },
            1024,
            8,
            Duration::from_secs(1),
        );

        assert_eq!(body.into_outcome(), BodyOutcome::Unread);
    }

    #[tokio::test]
    async fn chunked_limit() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut inbox = Inbox::from_bytes(b"8\r\n12345678\r\n0\r\n\r\n");

        let mut body = Body::new(
            &mut inbox,
            &mut server,
            chunked(),
            4,
            8,
            Duration::from_secs(1),
        );

        assert!(matches!(body.bytes().await, Err(BodyError::TooLarge)));
        assert!(matches!(body.bytes().await, Err(BodyError::TooLarge)));
        assert_eq!(
            body.into_outcome(),
            BodyOutcome::Failed(ErrorKind::BodyTooLarge)
        );
    }

    #[tokio::test]
    async fn peer_closes_early() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut inbox = Inbox::from_bytes(b"ab");
        drop(client);

        let mut body = Body::new(
            &mut inbox,
            &mut server,
            Decoder::Fixed { remaining: 10 },
            1024,
            8,
            Duration::from_secs(1),
        );

        assert!(matches!(body.bytes().await, Err(BodyError::Closed)));
    }
}

//! Header block reader and the case-insensitive [`HeaderSet`].

use crate::{
    errors::ErrorKind,
    http::{
        signature::Status,
        types::{self, slice_to_usize, trim_ows},
    },
    limits::ReqLimits,
};
use std::collections::{hash_map, HashMap};

/// Request headers with case-insensitive names.
///
/// Names are stored lower-cased; a repeated name keeps the last value.
/// Built once per request and read-only afterwards.
///
/// # Examples
///
/// For the block
/// ```text
/// Host: example.com
/// Content-Type: text/plain
/// X-Tag: a
/// x-tag: b
/// ```
/// - `get("content-type")` and `get("CONTENT-TYPE")`: `Some("text/plain")`
/// - `get("x-tag")`: `Some("b")`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    map: HashMap<String, String>,
    content_length: Option<usize>,
    chunked: bool,
}

impl HeaderSet {
    /// Value of a header, looked up case-insensitively.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        match name.bytes().any(|b| b.is_ascii_uppercase()) {
            true => self.map.get(&name.to_ascii_lowercase()),
            false => self.map.get(name),
        }
        .map(String::as_str)
    }

    /// Checks a comma-separated header (`Connection`, `Upgrade`, ...) for a
    /// token, ignoring case and surrounding whitespace.
    ///
    /// # Examples
    ///
    /// With `Connection: keep-alive, Upgrade`:
    /// - `has_token("connection", "upgrade")`: `true`
    /// - `has_token("connection", "close")`: `false`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name).is_some_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    /// Declared `Content-Length`.
    #[inline]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// `true` for `Transfer-Encoding: chunked`.
    #[inline]
    pub const fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// `Content-Type` value, if present.
    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }

    /// Number of distinct header names.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over `(lower-cased name, value)` pairs in no particular order.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter(self.map.iter())
    }
}

/// Iterator returned by [`HeaderSet::iter`].
#[derive(Debug)]
pub struct Iter<'a>(hash_map::Iter<'a, String, String>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a str);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Name,
    Value,
    LineCr,
    EndCr,
}

/// Incremental header block reader.
///
/// Consumes bytes until the empty line that ends the block, never holding
/// more than `header_block_size` bytes.
#[derive(Debug)]
pub(crate) struct HeaderReader {
    state: State,
    name: Vec<u8>,
    value: Vec<u8>,
    seen: usize,
    lines: usize,
    max_block: usize,
    max_count: usize,
    transfer_encoding: Option<String>,
    set: HeaderSet,
}

impl HeaderReader {
    #[inline]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            state: State::Name,
            name: Vec::with_capacity(32),
            value: Vec::with_capacity(128),
            seen: 0,
            lines: 0,
            max_block: limits.header_block_size,
            max_count: limits.header_count,
            transfer_encoding: None,
            set: HeaderSet::default(),
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) -> Result<Status, ErrorKind> {
        for (i, &byte) in data.iter().enumerate() {
            self.seen += 1;
            if self.seen > self.max_block {
                return Err(ErrorKind::HeaderTooLarge);
            }

            match (self.state, byte) {
                (State::Name, b'\r') if self.name.is_empty() => self.state = State::EndCr,
                // obs-fold and whitespace-led names are rejected
                (State::Name, b' ' | b'\t') if self.name.is_empty() => {
                    return Err(ErrorKind::InvalidHeader)
                }
                (State::Name, b':') => self.state = State::Value,
                (State::Name, b' ' | b'\t') => self.name.push(byte),
                (State::Name, _) if byte.is_ascii_graphic() => self.name.push(byte),
                (State::Name, _) => return Err(ErrorKind::InvalidHeader),

                (State::Value, b'\r') => self.state = State::LineCr,
                (State::Value, b'\t') => self.value.push(byte),
                (State::Value, _) if byte < 0x20 || byte == 0x7F => {
                    return Err(ErrorKind::InvalidHeader)
                }
                (State::Value, _) => self.value.push(byte),

                (State::LineCr, b'\n') => {
                    self.commit()?;
                    self.state = State::Name;
                }
                (State::EndCr, b'\n') => return Ok(Status::Complete(i + 1)),
                (State::LineCr | State::EndCr, _) => return Err(ErrorKind::InvalidHeader),
            }
        }

        Ok(Status::Incomplete)
    }

    fn commit(&mut self) -> Result<(), ErrorKind> {
        self.lines += 1;
        if self.lines > self.max_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        types::to_lower_case(&mut self.name);
        let name = trim_ows(&self.name);
        let value = trim_ows(&self.value);

        if name.is_empty() || name.contains(&b' ') || name.contains(&b'\t') {
            return Err(ErrorKind::InvalidHeader);
        }
        let value = simdutf8::basic::from_utf8(value).map_err(|_| ErrorKind::InvalidEncoding)?;
        // Names are ASCII graphic bytes, checked in `feed`
        let name = String::from_utf8_lossy(name).into_owned();

        match name.as_str() {
            "content-length" => {
                let length =
                    slice_to_usize(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?;

                match self.set.content_length {
                    Some(prev) if prev != length => return Err(ErrorKind::InvalidContentLength),
                    _ => self.set.content_length = Some(length),
                }
            }
            "transfer-encoding" => self.transfer_encoding = Some(value.to_ascii_lowercase()),
            _ => {}
        }

        self.set.map.insert(name, value.to_owned());
        self.name.clear();
        self.value.clear();
        Ok(())
    }

    /// Validates body framing and returns the set. Only valid after
    /// [`Status::Complete`].
    pub(crate) fn finish(mut self) -> Result<HeaderSet, ErrorKind> {
        if let Some(encoding) = self.transfer_encoding {
            if self.set.content_length.is_some() {
                return Err(ErrorKind::ConflictingLength);
            }
            if !encoding.trim().eq_ignore_ascii_case("chunked") {
                return Err(ErrorKind::UnsupportedTransferEncoding);
            }
            self.set.chunked = true;
        }

        Ok(self.set)
    }
}

#[cfg(test)]
impl HeaderSet {
    /// Reads a complete block, `"\r\n"` terminator included.
    pub(crate) fn from_block(block: &str) -> Self {
        let mut reader = HeaderReader::new(&ReqLimits::default());
        match reader.feed(block.as_bytes()) {
            Ok(Status::Complete(_)) => reader.finish().unwrap(),
            other => panic!("bad header block {block:?}: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(block: &str) -> Result<HeaderSet, ErrorKind> {
        read_with(block, &ReqLimits::default())
    }

    fn read_with(block: &str, limits: &ReqLimits) -> Result<HeaderSet, ErrorKind> {
        let mut reader = HeaderReader::new(limits);
        match reader.feed(block.as_bytes())? {
            Status::Complete(n) => {
                assert_eq!(n, block.len());
                reader.finish()
            }
            Status::Incomplete => panic!("incomplete: {block:?}"),
        }
    }

    #[test]
    fn basic() {
        let set = read(
            "Host: example.com\r\n\
             Content-Type:  text/plain \r\n\
             X-Tag: a\r\n\
             x-TAG: b\r\n\
             Empty:\r\n\
             \r\n",
        )
        .unwrap();

        assert_eq!(set.len(), 4);
        assert_eq!(set.get("host"), Some("example.com"));
        assert_eq!(set.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(set.content_type(), Some("text/plain"));
        assert_eq!(set.get("x-tag"), Some("b"));
        assert_eq!(set.get("empty"), Some(""));
        assert_eq!(set.get("missing"), None);
        assert_eq!(set.content_length(), None);
        assert!(!set.is_chunked());
    }

    #[test]
    fn empty_block() {
        assert!(read("\r\n").unwrap().is_empty());
    }

    #[test]
    fn body_framing() {
        let set = read("Content-Length: 42\r\n\r\n").unwrap();
        assert_eq!(set.content_length(), Some(42));

        let set = read("Transfer-Encoding: Chunked\r\n\r\n").unwrap();
        assert!(set.is_chunked());

        let set = read("Content-Length: 5\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(set.content_length(), Some(5));
    }

    #[test]
    fn tokens() {
        let set = read("Connection: keep-alive, Upgrade\r\nUpgrade: WebSocket\r\n\r\n").unwrap();

        assert!(set.has_token("connection", "upgrade"));
        assert!(set.has_token("Connection", "Keep-Alive"));
        assert!(!set.has_token("connection", "close"));
        assert!(set.has_token("upgrade", "websocket"));
        assert!(!set.has_token("missing", "x"));
    }

    #[test]
    fn errors() {
        #[rustfmt::skip]
        let cases = [
            ("Bad Header\r\n\r\n",                               ErrorKind::InvalidHeader),
            (": value\r\n\r\n",                                  ErrorKind::InvalidHeader),
            (" folded: x\r\n\r\n",                               ErrorKind::InvalidHeader),
            ("Name: a\nb\r\n\r\n",                               ErrorKind::InvalidHeader),
            ("Name: value\r\r\n",                                ErrorKind::InvalidHeader),
            ("Name: value\r\n\rx",                               ErrorKind::InvalidHeader),
            ("Content-Length: 1x\r\n\r\n",                       ErrorKind::InvalidContentLength),
            ("Content-Length: \r\n\r\n",                         ErrorKind::InvalidContentLength),
            ("Content-Length: 1\r\nContent-Length: 2\r\n\r\n",   ErrorKind::InvalidContentLength),
            ("Content-Length: 1\r\nTransfer-Encoding: chunked\r\n\r\n", ErrorKind::ConflictingLength),
            ("Transfer-Encoding: gzip\r\n\r\n",                  ErrorKind::UnsupportedTransferEncoding),
        ];

        for (block, expected) in cases {
            let mut reader = HeaderReader::new(&ReqLimits::default());
            let result = reader.feed(block.as_bytes()).and_then(|_| reader.finish());
            assert_eq!(result, Err(expected), "{block:?}");
        }
    }

    #[test]
    fn invalid_utf8_value() {
        let mut reader = HeaderReader::new(&ReqLimits::default());
        assert_eq!(
            reader.feed(b"Name: \xff\xfe\r\n\r\n"),
            Err(ErrorKind::InvalidEncoding)
        );
    }

    #[test]
    fn block_size_bound() {
        let limits = ReqLimits {
            header_block_size: 64,
            ..ReqLimits::default()
        };

        // Never terminated: the reader must fail as soon as the bound is crossed
        let mut reader = HeaderReader::new(&limits);
        let flood = vec![b'a'; 10_000];
        assert_eq!(reader.feed(&flood), Err(ErrorKind::HeaderTooLarge));
        assert!(reader.name.len() <= 64);

        let exact = format!("X: {}\r\n\r\n", "v".repeat(64 - 7));
        assert_eq!(exact.len(), 64);
        assert!(read_with(&exact, &limits).is_ok());
    }

    #[test]
    fn count_bound() {
        let limits = ReqLimits {
            header_count: 2,
            ..ReqLimits::default()
        };

        assert!(read_with("A: 1\r\nB: 2\r\n\r\n", &limits).is_ok());

        let mut reader = HeaderReader::new(&limits);
        assert_eq!(
            reader.feed(b"A: 1\r\nB: 2\r\nC: 3\r\n\r\n"),
            Err(ErrorKind::TooManyHeaders)
        );
    }

    #[test]
    fn any_split_gives_same_result() {
        let block = b"Host: a\r\nContent-Length: 3\r\nX-Long-Header-Name: some value\r\n\r\nabc";
        let expected = read("Host: a\r\nContent-Length: 3\r\nX-Long-Header-Name: some value\r\n\r\n")
            .unwrap();

        for chunk in 1..block.len() {
            let mut reader = HeaderReader::new(&ReqLimits::default());
            let mut offset = 0;

            let done = loop {
                let end = (offset + chunk).min(block.len());
                match reader.feed(&block[offset..end]).unwrap() {
                    Status::Complete(n) => break offset + n,
                    Status::Incomplete => offset = end,
                }
            };

            assert_eq!(&block[done..], b"abc", "chunk {chunk}");
            assert_eq!(reader.finish().unwrap(), expected, "chunk {chunk}");
        }
    }
}

//! Request line (`METHOD SP URI SP VERSION CRLF`) reader.

use crate::{
    errors::ErrorKind,
    http::{
        query::{self, Query},
        types::{Method, Version},
    },
    limits::ReqLimits,
    wire::CRLF,
};
use memchr::{memchr, memchr_iter};
use std::collections::HashMap;

/// Method, target and version of a request.
///
/// Produced once per exchange from the request line and never modified
/// afterwards. The path and query are percent-decoded.
///
/// # Examples
///
/// For `GET /api/caf%C3%A9?sort=name&q=a+b HTTP/1.1`:
/// - [`method()`](Self::method): `Method::Get`
/// - [`uri()`](Self::uri): `/api/caf%C3%A9?sort=name&q=a+b`
/// - [`path()`](Self::path): `/api/café`
/// - [`query("q")`](Self::query): `Some("a b")`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSignature {
    method: Method,
    version: Version,
    uri: String,
    path: String,
    query: HashMap<String, String>,
}

impl RequestSignature {
    /// Request method.
    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Protocol version from the request line.
    #[inline]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Raw request target, exactly as received.
    #[inline]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Percent-decoded path without the query string.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Decoded value of a query parameter. The last occurrence wins.
    #[inline]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// All decoded query parameters.
    #[inline]
    pub fn query_map(&self) -> &HashMap<String, String> {
        &self.query
    }
}

/// Outcome of feeding bytes to an incremental reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// More input is needed; the whole slice was consumed.
    Incomplete,
    /// The element ended inside the slice after this many bytes.
    Complete(usize),
}

/// Incremental request-line reader.
///
/// Accepts the line split at arbitrary byte boundaries. Bytes after the
/// terminating CRLF are left to the caller.
#[derive(Debug)]
pub(crate) struct SignatureReader {
    line: Vec<u8>,
    max_line: usize,
    query_parts: usize,
    empty_lines: usize,
}

/// Empty lines tolerated before the request line (RFC 9112, 2.2).
const MAX_EMPTY_LINES: usize = 2;

impl SignatureReader {
    #[inline]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            line: Vec::with_capacity(64),
            max_line: limits.first_line(),
            query_parts: limits.url_query_parts,
            empty_lines: 0,
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) -> Result<Status, ErrorKind> {
        let mut consumed = 0;

        while consumed < data.len() {
            let rest = &data[consumed..];

            let Some(pos) = memchr(b'\n', rest) else {
                self.push(rest)?;
                return Ok(Status::Incomplete);
            };

            self.push(&rest[..=pos])?;
            consumed += pos + 1;

            if !self.line.ends_with(CRLF) {
                return Err(ErrorKind::InvalidVersion);
            }

            if self.line.len() == CRLF.len() {
                self.empty_lines += 1;
                if self.empty_lines > MAX_EMPTY_LINES {
                    return Err(ErrorKind::InvalidMethod);
                }
                self.line.clear();
                continue;
            }

            return Ok(Status::Complete(consumed));
        }

        Ok(Status::Incomplete)
    }

    #[inline]
    fn push(&mut self, bytes: &[u8]) -> Result<(), ErrorKind> {
        if self.line.len() + bytes.len() > self.max_line {
            return Err(ErrorKind::UriTooLong);
        }

        self.line.extend_from_slice(bytes);
        Ok(())
    }

    /// Parses the collected line. Only valid after [`Status::Complete`].
    pub(crate) fn finish(self) -> Result<RequestSignature, ErrorKind> {
        let line = &self.line[..self.line.len() - CRLF.len()];
        simdutf8::basic::from_utf8(line).map_err(|_| ErrorKind::InvalidEncoding)?;

        let mut spaces = memchr_iter(b' ', line);
        let (Some(first), Some(second), None) = (spaces.next(), spaces.next(), spaces.next())
        else {
            return Err(ErrorKind::InvalidUri);
        };

        let method = Method::from_bytes(&line[..first])?;
        let target = &line[first + 1..second];
        let version = Version::from_bytes(&line[second + 1..])?;

        let (path, query) = match target {
            [b'/', ..] => match memchr(b'?', target) {
                Some(pos) => (&target[..pos], &target[pos..]),
                None => (target, &b""[..]),
            },
            b"*" if method == Method::Options => (target, &b""[..]),
            _ => return Err(ErrorKind::InvalidUri),
        };

        let path = query::decode_component(path, false).map_err(|_| ErrorKind::InvalidUri)?;
        let query = Query::parse(query, self.query_parts).map_err(|_| ErrorKind::InvalidUri)?;

        Ok(RequestSignature {
            method,
            version,
            // Valid UTF-8, checked above
            uri: String::from_utf8_lossy(target).into_owned(),
            path,
            query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<RequestSignature, ErrorKind> {
        let mut reader = SignatureReader::new(&ReqLimits::default());
        match reader.feed(line.as_bytes())? {
            Status::Complete(_) => reader.finish(),
            Status::Incomplete => panic!("incomplete: {line:?}"),
        }
    }

    #[test]
    fn basic() {
        let sig = parse("GET /api/users?sort=name&debug HTTP/1.1\r\n").unwrap();

        assert_eq!(sig.method(), Method::Get);
        assert_eq!(sig.version(), Version::Http11);
        assert_eq!(sig.uri(), "/api/users?sort=name&debug");
        assert_eq!(sig.path(), "/api/users");
        assert_eq!(sig.query("sort"), Some("name"));
        assert_eq!(sig.query("debug"), Some(""));
        assert_eq!(sig.query("other"), None);
    }

    #[test]
    fn decodes_path_and_query() {
        let sig = parse("POST /caf%C3%A9/a+b?q=a+b%21 HTTP/1.0\r\n").unwrap();

        assert_eq!(sig.path(), "/café/a+b");
        assert_eq!(sig.query("q"), Some("a b!"));
        assert_eq!(sig.uri(), "/caf%C3%A9/a+b?q=a+b%21");
    }

    #[test]
    fn errors() {
        #[rustfmt::skip]
        let cases = [
            ("get / HTTP/1.1\r\n",          ErrorKind::InvalidMethod),
            ("TRACE / HTTP/1.1\r\n",        ErrorKind::InvalidMethod),
            ("GET / HTTP/2.0\r\n",          ErrorKind::UnsupportedVersion),
            ("GET / HTTX/1.1\r\n",          ErrorKind::InvalidVersion),
            ("GET /\r\n",                   ErrorKind::InvalidUri),
            ("GET  / HTTP/1.1\r\n",         ErrorKind::InvalidUri),
            ("GET api HTTP/1.1\r\n",        ErrorKind::InvalidUri),
            ("GET * HTTP/1.1\r\n",          ErrorKind::InvalidUri),
            ("GET /%FF HTTP/1.1\r\n",       ErrorKind::InvalidUri),
            ("GET / HTTP/1.1\n",            ErrorKind::InvalidVersion),
        ];

        for (line, expected) in cases {
            assert_eq!(parse(line), Err(expected), "{line:?}");
        }
    }

    #[test]
    fn options_asterisk() {
        let sig = parse("OPTIONS * HTTP/1.1\r\n").unwrap();
        assert_eq!(sig.path(), "*");
    }

    #[test]
    fn too_long() {
        let limits = ReqLimits::default();
        let line = format!("GET /{} HTTP/1.1\r\n", "a".repeat(limits.url_size + 32));

        let mut reader = SignatureReader::new(&limits);
        assert_eq!(reader.feed(line.as_bytes()), Err(ErrorKind::UriTooLong));
    }

    #[test]
    fn skips_leading_empty_lines() {
        assert_eq!(parse("\r\n\r\nGET / HTTP/1.1\r\n").unwrap().path(), "/");

        // Fed one line at a time, as a trickling client would
        let mut reader = SignatureReader::new(&ReqLimits::default());
        assert_eq!(reader.feed(b"\r\n"), Ok(Status::Incomplete));
        assert_eq!(reader.feed(b"\r\n"), Ok(Status::Incomplete));
        assert_eq!(reader.feed(b"\r\n"), Err(ErrorKind::InvalidMethod));
    }

    #[test]
    fn any_split_gives_same_result() {
        let input = b"DELETE /items/42?force=true HTTP/1.1\r\nHost: x\r\n";
        let expected = parse("DELETE /items/42?force=true HTTP/1.1\r\n").unwrap();

        for chunk in 1..input.len() {
            let mut reader = SignatureReader::new(&ReqLimits::default());
            let mut offset = 0;

            let done = loop {
                let end = (offset + chunk).min(input.len());
                match reader.feed(&input[offset..end]).unwrap() {
                    Status::Complete(n) => break offset + n,
                    Status::Incomplete => offset = end,
                }
            };

            assert_eq!(&input[done..], b"Host: x\r\n", "chunk {chunk}");
            assert_eq!(reader.finish().unwrap(), expected, "chunk {chunk}");
        }
    }
}

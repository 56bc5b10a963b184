use crate::Version;
use std::io;

/// Errors raised by the admission pipeline before a response exists.
///
/// Every variant owns a canned response (see [`ErrorKind::as_http`]); the
/// connection writes it and closes.
#[derive(Debug, PartialEq, thiserror::Error)]
pub(crate) enum ErrorKind {
    #[error("invalid request method")]
    InvalidMethod,
    #[error("invalid request URI")]
    InvalidUri,
    #[error("request line exceeds the configured URL size")]
    UriTooLong,
    #[error("malformed HTTP version")]
    InvalidVersion,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,

    #[error("malformed header line")]
    InvalidHeader,
    #[error("header block exceeds the configured size")]
    HeaderTooLarge,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("both Content-Length and Transfer-Encoding present")]
    ConflictingLength,
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,

    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("request body exceeds the configured size")]
    BodyTooLarge,

    #[error("no route for request")]
    NotFound,
    #[error("stage read timed out")]
    Timeout,
    #[error("dispatcher did not answer in time")]
    DispatchTimeout,
    #[error("websocket handshake failed: {0}")]
    HandshakeFailed(&'static str),

    #[error("peer closed the connection")]
    Eof,
    #[error("server is at capacity")]
    ServiceUnavailable,
    #[error("i/o error: {0}")]
    Io(IoError),
}

macro_rules! http_errors {
    (
        json { $($name:ident: $status_code:expr, $len:literal => $json:literal; )* }
        bare { $($bare:ident: $bare_code:expr; )* }
    ) => {
        /// Canned response bytes for this error.
        ///
        /// `json == false` drops the body. Entries in the `bare` group never
        /// carry a body.
        pub(crate) const fn as_http(&self, version: Version, json: bool) -> &'static [u8] {
            match (json, self, version) {
                $(
                    (true, Self::$name { .. }, Version::Http11) => concat!(
                        "HTTP/1.1 ", $status_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: ", $len, "\r\n",
                        "content-type: application/json\r\n",
                        "\r\n",
                        $json
                    ),
                    (false, Self::$name { .. }, Version::Http11) => concat!(
                        "HTTP/1.1 ", $status_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: 0\r\n\r\n",
                    ),
                    (true, Self::$name { .. }, Version::Http10) => concat!(
                        "HTTP/1.0 ", $status_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: ", $len, "\r\n",
                        "content-type: application/json\r\n",
                        "\r\n",
                        $json
                    ),
                    (false, Self::$name { .. }, Version::Http10) => concat!(
                        "HTTP/1.0 ", $status_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: 0\r\n\r\n",
                    ),
                )*
                $(
                    (_, Self::$bare, Version::Http11) => concat!(
                        "HTTP/1.1 ", $bare_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: 0\r\n\r\n",
                    ),
                    (_, Self::$bare, Version::Http10) => concat!(
                        "HTTP/1.0 ", $bare_code, "\r\n",
                        "connection: close\r\n",
                        "content-length: 0\r\n\r\n",
                    ),
                )*
            }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        json {
            InvalidMethod: "400 Bad Request", "55"
                => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
            InvalidUri: "400 Bad Request", "52"
                => r#"{"error":"Invalid request URI","code":"INVALID_URI"}"#;
            UriTooLong: "414 URI Too Long", "54"
                => r#"{"error":"Request URI too long","code":"URI_TOO_LONG"}"#;
            InvalidVersion: "400 Bad Request", "57"
                => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
            UnsupportedVersion: "505 HTTP Version Not Supported", "67"
                => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;
            InvalidEncoding: "400 Bad Request", "64"
                => r#"{"error":"Invalid character encoding","code":"INVALID_ENCODING"}"#;

            InvalidHeader: "400 Bad Request", "57"
                => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
            HeaderTooLarge: "431 Request Header Fields Too Large", "60"
                => r#"{"error":"Header block too large","code":"HEADER_TOO_LARGE"}"#;
            TooManyHeaders: "431 Request Header Fields Too Large", "54"
                => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
            InvalidContentLength: "400 Bad Request", "66"
                => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
            ConflictingLength: "400 Bad Request", "63"
                => r#"{"error":"Conflicting body length","code":"CONFLICTING_LENGTH"}"#;
            UnsupportedTransferEncoding: "501 Not Implemented", "82"
                => r#"{"error":"Transfer-Encoding not supported","code":"UNSUPPORTED_TRANSFER_ENCODING"}"#;

            InvalidChunk: "400 Bad Request", "55"
                => r#"{"error":"Invalid chunked body","code":"INVALID_CHUNK"}"#;
            BodyTooLarge: "413 Payload Too Large", "58"
                => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;

            Timeout: "408 Request Timeout", "52"
                => r#"{"error":"Request timeout","code":"REQUEST_TIMEOUT"}"#;
            DispatchTimeout: "503 Service Unavailable", "55"
                => r#"{"error":"Handler timed out","code":"DISPATCH_TIMEOUT"}"#;
            HandshakeFailed: "400 Bad Request", "64"
                => r#"{"error":"WebSocket handshake failed","code":"HANDSHAKE_FAILED"}"#;

            ServiceUnavailable: "503 Service Unavailable", "72"
                => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
            Io: "503 Service Unavailable", "48"
                => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
        }
        bare {
            NotFound: "404 Not Found";
            Eof: "400 Bad Request";
        }
    }

    /// Errors after which nothing is written back to the peer.
    #[inline]
    pub(crate) const fn is_silent(&self) -> bool {
        matches!(self, Self::Eof | Self::Io(_))
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            _ => ErrorKind::Io(IoError(err)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// WebSocket status code sent in a close frame
///
/// [[RFC6455, Section 7.4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4.1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    /// Reported locally when a close frame carried no status; never sent.
    pub const NO_STATUS: Self = Self(1005);
    /// Reported locally when the socket dropped without a close frame; never sent.
    pub const ABNORMAL: Self = Self(1006);
    pub const INVALID_PAYLOAD: Self = Self(1007);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    pub const INTERNAL_ERROR: Self = Self(1011);

    /// Codes a peer is allowed to put on the wire.
    pub const fn is_sendable(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// Errors of a running WebSocket session.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// The peer violated RFC 6455 framing rules.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// A text message or close reason was not valid UTF-8.
    #[error("invalid utf-8 payload")]
    InvalidUtf8,
    /// A frame or reassembled message exceeded the configured limit.
    #[error("message too big")]
    MessageTooBig,
    /// The negotiated extension failed to transform a payload.
    #[error("extension error: {0}")]
    Extension(String),
    /// Nothing was received within the idle timeout.
    #[error("session idle timeout")]
    IdleTimeout,
    /// The session is already closed.
    #[error("session closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WsError {
    /// Close code sent to the peer when this error ends the session.
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::Protocol(_) => CloseCode::PROTOCOL_ERROR,
            Self::InvalidUtf8 | Self::Extension(_) => CloseCode::INVALID_PAYLOAD,
            Self::MessageTooBig => CloseCode::MESSAGE_TOO_BIG,
            Self::IdleTimeout => CloseCode::GOING_AWAY,
            Self::Closed | Self::Io(_) => CloseCode::ABNORMAL,
        }
    }
}

/// Errors returned while building a [`Server`](crate::Server).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Another [`Server`](crate::Server) is alive in this process.
    #[error("a server instance is already running in this process")]
    AlreadyRunning,
    /// [`ServerBuilder::listener`](crate::ServerBuilder::listener) was never called.
    #[error("the `listener` method must be called before `build`")]
    MissingListener,
    /// [`ServerBuilder::dispatcher`](crate::ServerBuilder::dispatcher) was never called.
    #[error("the `dispatcher` method must be called before `build`")]
    MissingDispatcher,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn content_length_matches_body() {
        #[rustfmt::skip]
        let cases = [
            ErrorKind::InvalidMethod, ErrorKind::InvalidUri, ErrorKind::UriTooLong,
            ErrorKind::InvalidVersion, ErrorKind::UnsupportedVersion, ErrorKind::InvalidEncoding,
            ErrorKind::InvalidHeader, ErrorKind::HeaderTooLarge, ErrorKind::TooManyHeaders,
            ErrorKind::InvalidContentLength, ErrorKind::ConflictingLength,
            ErrorKind::UnsupportedTransferEncoding, ErrorKind::InvalidChunk,
            ErrorKind::BodyTooLarge, ErrorKind::Timeout, ErrorKind::DispatchTimeout,
            ErrorKind::HandshakeFailed("x"), ErrorKind::ServiceUnavailable,
        ];

        for error in cases {
            for version in [Version::Http10, Version::Http11] {
                let text = str_op(error.as_http(version, true));
                let (head, body) = text.split_once("\r\n\r\n").unwrap();
                let declared = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length: "))
                    .unwrap();

                assert_eq!(declared.parse::<usize>().unwrap(), body.len(), "{error:?}");
            }
        }
    }

    #[test]
    fn not_found_has_no_body() {
        for json in [true, false] {
            assert_eq!(
                str_op(ErrorKind::NotFound.as_http(Version::Http11, json)),
                "HTTP/1.1 404 Not Found\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
            );
        }
    }

    #[test]
    fn bare_mode() {
        assert_eq!(
            str_op(ErrorKind::BodyTooLarge.as_http(Version::Http10, false)),
            "HTTP/1.0 413 Payload Too Large\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
        );
    }

    #[test]
    fn io_conversion() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "t");
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "e");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "r");

        assert_eq!(ErrorKind::from(timed_out), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from(eof), ErrorKind::Eof);
        assert!(ErrorKind::from(reset).is_silent());
    }

    #[test]
    fn close_codes() {
        assert_eq!(WsError::Protocol("x").close_code(), CloseCode::PROTOCOL_ERROR);
        assert_eq!(WsError::InvalidUtf8.close_code().0, 1007);
        assert_eq!(WsError::MessageTooBig.close_code().0, 1009);
        assert!(CloseCode::NORMAL.is_sendable());
        assert!(!CloseCode::NO_STATUS.is_sendable());
        assert!(!CloseCode::ABNORMAL.is_sendable());
        assert!(!CloseCode(999).is_sendable());
        assert!(CloseCode(4000).is_sendable());
    }
}

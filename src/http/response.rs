//! HTTP response builder and serializer.

use crate::{
    http::{
        cookie::Cookie,
        types::{StatusCode, Version},
    },
    server::connection::writer::write_bytes,
};
use std::{
    borrow::Cow,
    fmt,
    future::Future,
    io,
    pin::Pin,
    time::{Duration, SystemTime},
};
use tokio::{io::AsyncWrite, sync::mpsc};

type StreamFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;
type StreamCallback = Box<dyn FnOnce(BodySink) -> StreamFuture + Send>;

/// Chunks a streaming callback may queue before it has to wait for the socket.
const STREAM_BACKLOG: usize = 8;

/// HTTP response returned by a [`Dispatcher`](crate::Dispatcher).
///
/// Built by value: a status, then any headers and cookies, then either a
/// buffered body or a streaming callback. Framing headers are added by the
/// server when the response is written:
/// - `date`
/// - `content-length`, or `transfer-encoding: chunked` for streams
/// - `connection`, when the keep-alive decision differs from the protocol default
///
/// # Examples
/// ```
/// use maker_ws::{Response, StatusCode};
///
/// let resp = Response::new(StatusCode::Ok)
///     .header("content-type", "text/html")
///     .header("x-request-id", 42)
///     .body("<h1>Hello World</h1>");
///
/// assert_eq!(resp.status(), StatusCode::Ok);
/// ```
///
/// # Panics
/// `header` checks its input for line breaks in `debug` mode and panics on
/// violation. In `release` mode the check is omitted.
pub struct Response {
    status: StatusCode,
    message: Option<Cow<'static, str>>,
    headers: Vec<u8>,
    cookies: Vec<Cookie>,
    payload: Payload,
    close: bool,
}

enum Payload {
    Bytes(Vec<u8>),
    Stream(StreamCallback),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match &self.payload {
            Payload::Bytes(bytes) => format!("{} bytes", bytes.len()),
            Payload::Stream(_) => "stream".to_owned(),
        };

        f.debug_struct("Response")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("headers", &String::from_utf8_lossy(&self.headers))
            .field("cookies", &self.cookies)
            .field("payload", &payload)
            .field("close", &self.close)
            .finish()
    }
}

impl Response {
    /// Creates an empty response with the given status.
    #[inline]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            message: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            payload: Payload::Bytes(Vec::new()),
            close: false,
        }
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Replaces the standard reason phrase of the status line.
    ///
    /// # Examples
    /// ```
    /// use maker_ws::{Response, StatusCode};
    ///
    /// let resp = Response::new(StatusCode::Ok).with_message("All Good");
    /// // HTTP/1.1 200 All Good
    /// ```
    #[inline]
    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds a header to the response.
    ///
    /// PLEASE DO NOT ADD THE FOLLOWING HEADINGS:
    /// - `content-length`, `transfer-encoding` - calculated automatically
    /// - `connection` - use [`close()`](Response::close)
    /// - `date` - added on write
    /// - `set-cookie` - use [`cookie()`](Response::cookie)
    ///
    /// # Examples
    /// ```
    /// use maker_ws::{Response, StatusCode};
    ///
    /// Response::new(StatusCode::Ok)
    ///     .header("content-type", "text/plain")        // &str, &str
    ///     .header("x-custom-id", 128)                  // &str, i32
    ///     .header("x-cache-enabled", true)             // &str, bool
    ///     .body("Done");
    /// ```
    #[inline]
    #[track_caller]
    pub fn header<N: WriteBuffer, V: WriteBuffer>(mut self, name: N, value: V) -> Self {
        let start = self.headers.len();

        name.write_to(&mut self.headers);
        self.headers.extend_from_slice(b": ");
        value.write_to(&mut self.headers);

        debug_assert!(
            !self.headers[start..].iter().any(|b| matches!(b, b'\r' | b'\n')),
            "Header must not contain line breaks"
        );

        self.headers.extend_from_slice(b"\r\n");
        self
    }

    /// Adds a cookie, written as its own `set-cookie` line.
    #[inline]
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Sets a buffered body, replacing any previous body or stream.
    #[inline]
    pub fn body<T: WriteBuffer>(mut self, data: T) -> Self {
        let mut bytes = Vec::new();
        data.write_to(&mut bytes);

        self.payload = Payload::Bytes(bytes);
        self
    }

    /// Builds a buffered body piece by piece.
    ///
    /// # Examples
    /// ```
    /// use maker_ws::{Response, StatusCode};
    /// use std::io::Write;
    ///
    /// Response::new(StatusCode::Ok).body_with(|w| {
    ///     w.write("lib: ");
    ///     w.write("maker_ws");
    ///     w.write(", answer: ");
    ///     w.write(42);
    ///     write!(w, ", pi: {:.2}", 3.14159).unwrap();
    /// });
    /// ```
    #[inline]
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(mut self, f: F) -> Self {
        let mut bytes = Vec::new();
        f(&mut BodyWriter(&mut bytes));

        self.payload = Payload::Bytes(bytes);
        self
    }

    /// Produces the body at write time through a [`BodySink`].
    ///
    /// The callback runs once the head is on the wire. On `HTTP/1.1` every
    /// write becomes one chunk of a `transfer-encoding: chunked` body; on
    /// `HTTP/1.0` the bytes are written as they are and the connection is
    /// closed at the end. An error from the callback aborts the body and
    /// closes the connection.
    ///
    /// # Examples
    /// ```
    /// use maker_ws::{Response, StatusCode};
    ///
    /// Response::new(StatusCode::Ok)
    ///     .header("content-type", "text/plain")
    ///     .stream(|sink| async move {
    ///         for i in 0..3 {
    ///             sink.write(i).await?;
    ///             sink.write("\n").await?;
    ///         }
    ///         std::io::Result::Ok(())
    ///     });
    /// ```
    #[inline]
    pub fn stream<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce(BodySink) -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<()>> + Send + 'static,
    {
        self.payload = Payload::Stream(Box::new(move |sink| Box::pin(callback(sink))));
        self
    }

    /// Forces the connection to close after this response.
    #[inline]
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Whether the connection can serve another request after this response,
    /// given what the request asked for.
    #[inline]
    pub(crate) fn keeps_alive(&self, version: Version, requested: bool) -> bool {
        let unframed_stream =
            matches!(self.payload, Payload::Stream(_)) && version == Version::Http10;
        requested && !self.close && !unframed_stream
    }
}

/// How a response is put on the wire for one exchange.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteContext {
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    /// `HEAD` request: headers only.
    pub(crate) head_only: bool,
    pub(crate) timeout: Duration,
}

impl Response {
    /// Writes everything before the payload into `out`.
    pub(crate) fn write_head(&self, ctx: &WriteContext, now: SystemTime, out: &mut Vec<u8>) {
        match &self.message {
            None => out.extend_from_slice(self.status.into_first_line(ctx.version)),
            Some(message) => {
                out.extend_from_slice(ctx.version.as_bytes());
                out.push(b' ');
                write::write_number(self.status.as_u16() as u128, out);
                out.push(b' ');
                out.extend_from_slice(message.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }

        out.extend_from_slice(b"date: ");
        out.extend_from_slice(httpdate::fmt_http_date(now).as_bytes());
        out.extend_from_slice(b"\r\n");

        out.extend_from_slice(&self.headers);
        for cookie in &self.cookies {
            cookie.write_line(now, out);
        }

        // 1xx and 204 never carry a body (RFC 9110, 8.6)
        let informational = self.status.as_u16() < 200;
        if !informational && self.status != StatusCode::NoContent {
            match &self.payload {
                Payload::Bytes(bytes) => {
                    out.extend_from_slice(b"content-length: ");
                    write::write_number(bytes.len() as u128, out);
                    out.extend_from_slice(b"\r\n");
                }
                Payload::Stream(_) if ctx.version == Version::Http11 => {
                    out.extend_from_slice(b"transfer-encoding: chunked\r\n");
                }
                Payload::Stream(_) => {}
            }
        }

        if !informational {
            if let Some(value) = connection_header(ctx.version, ctx.keep_alive) {
                out.extend_from_slice(b"connection: ");
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
        }

        out.extend_from_slice(b"\r\n");
    }

    /// Serializes and writes the response. `out` is a scratch buffer owned by
    /// the connection.
    pub(crate) async fn write_to<W>(
        self,
        writer: &mut W,
        out: &mut Vec<u8>,
        ctx: WriteContext,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.write_head(&ctx, SystemTime::now(), out);

        let no_body = ctx.head_only
            || self.status.as_u16() < 200
            || self.status == StatusCode::NoContent;

        match self.payload {
            Payload::Bytes(bytes) => {
                if !no_body {
                    out.extend_from_slice(&bytes);
                }
                write_bytes(writer, out, ctx.timeout).await
            }
            Payload::Stream(callback) => {
                write_bytes(writer, out, ctx.timeout).await?;
                if no_body {
                    return Ok(());
                }

                let chunked = ctx.version == Version::Http11;
                stream_body(callback, writer, out, chunked, ctx.timeout).await?;

                if chunked {
                    write_bytes(writer, b"0\r\n\r\n", ctx.timeout).await?;
                }
                Ok(())
            }
        }
    }
}

async fn stream_body<W>(
    callback: StreamCallback,
    writer: &mut W,
    out: &mut Vec<u8>,
    chunked: bool,
    timeout: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(STREAM_BACKLOG);
    let produce = callback(BodySink { tx });

    let drain = async move {
        while let Some(chunk) = rx.recv().await {
            if chunk.is_empty() {
                continue;
            }

            out.clear();
            if chunked {
                out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            }
            out.extend_from_slice(&chunk);
            if chunked {
                out.extend_from_slice(b"\r\n");
            }

            write_bytes(writer, out, timeout).await?;
        }

        Ok::<(), io::Error>(())
    };

    let (produced, drained) = tokio::join!(produce, drain);
    drained?;
    produced
}

#[inline(always)]
const fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http11, false) => Some(b"close"),
        (Version::Http10, true) => Some(b"keep-alive"),
        (Version::Http10, false) => Some(b"close"),
    }
}

/// Output handle of a streaming response, see [`Response::stream`].
#[derive(Debug)]
pub struct BodySink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl BodySink {
    /// Queues `data` for the socket. Waits while the socket falls behind.
    ///
    /// Fails with `BrokenPipe` once the connection stopped accepting data.
    pub async fn write<T: WriteBuffer>(&self, data: T) -> io::Result<()> {
        let mut chunk = Vec::new();
        data.write_to(&mut chunk);

        self.tx
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response stream closed"))
    }
}

pub use write::{BodyWriter, WriteBuffer};

pub mod write {
    use std::{borrow::Cow, rc::Rc, sync::Arc};

    /// Writer for building a buffered body.
    /// Used in [`body_with`](super::Response::body_with).
    ///
    /// Accepts any [`WriteBuffer`] and also implements [`std::io::Write`].
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends content to the response body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl std::io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Trait for writing header values and bodies of a [`Response`](super::Response).
    ///
    /// Implemented for strings, bytes, booleans, chars and integer types.
    ///
    /// # Note on Floating-Point
    /// Floating-point numbers are not implemented to avoid locale-dependent
    /// formatting and precision issues in protocol headers. Format them to a
    /// string with controlled precision instead.
    ///
    /// # Example
    /// ```
    /// use maker_ws::WriteBuffer;
    ///
    /// struct UserId(u32);
    ///
    /// impl WriteBuffer for UserId {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         buffer.extend_from_slice(b"user-");
    ///         self.0.write_to(buffer);
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conv:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conv;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conv:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conv(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }
    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), write_number => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        number(i128), write_signed => i8, i16, i32, i64, i128, isize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    #[inline]
    pub(crate) fn write_number(mut n: u128, buffer: &mut Vec<u8>) {
        let mut digits = [b'0'; 39];
        let mut i = digits.len();

        loop {
            i -= 1;
            digits[i] = b'0' + (n % 10) as u8;
            n /= 10;

            if n == 0 {
                break;
            }
        }

        buffer.extend_from_slice(&digits[i..]);
    }

    #[inline]
    fn write_signed(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }
        write_number(value.unsigned_abs(), buffer);
    }
}

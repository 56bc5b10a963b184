//! Server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//! - Oversized WebSocket messages
//!
//! # Examples
//!
//! ```no_run
//! # maker_ws::impt_default_dispatcher!{MyDispatcher}
//! use maker_ws::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .dispatcher(MyDispatcher)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             header_timeout: Duration::from_secs(3),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 48,          // More headers for complex APIs
//!             body_size: 16 * 1024 * 1024, // 16MB uploads
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency and overload protection.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /-----------------\   No   [-------------]
/// [ Add to cycler] <====== | Free admission? | =====> [ Sending 503 ]
/// [--------------]         \-----------------/        [-------------]
///        ||
///        \/
/// [-------------------------]        [---------------------]
/// [ Cycler: ready sockets   ] =====> [ Worker pool (batch) ]
/// [-------------------------]        [---------------------]
///                                           ||  upgrade
///                                           \/
///                                 [-----------------------]
///                                 [ Dedicated WS session  ]
///                                 [-----------------------]
/// ```
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Hard cap on concurrently admitted sockets, WebSocket sessions
    /// included (default: `1024`).
    ///
    /// Sockets accepted above the cap receive an immediate
    /// [`503`](crate::StatusCode::ServiceUnavailable).
    pub max_connections: usize,

    /// Size of the worker pool the cycler submits ready connections to
    /// (default: `64`).
    ///
    /// At most this many HTTP exchanges run at the same time.
    pub workers: usize,

    /// How the cycler waits when none of its connections has pending bytes
    /// (default: `Sleep(1 second)`).
    pub wait_strategy: WaitStrategy,

    /// Dedicated tasks answering overflow connections (default: `1`).
    ///
    /// Set to 0 to silently close rejected sockets (not recommended for
    /// production HTTP servers).
    pub count_503_handlers: usize,

    /// Overflow sockets waiting for their `503` (default: `256`).
    ///
    /// Sockets rejected while this many are already waiting are closed
    /// without a response.
    pub max_pending_503: usize,

    /// Format for error responses (default: `true`)
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 55\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 0\r
    /// \r
    /// ```
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            workers: 64,
            wait_strategy: WaitStrategy::Sleep(Duration::from_secs(1)),
            count_503_handlers: 1,
            max_pending_503: 256,
            json_errors: true,

            _priv: (),
        }
    }
}

/// Strategy for the cycler when no connection has pending bytes
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// # Note
    /// Keeps one core busy. Only for latency benchmarks.
    Yield,

    /// Parks until a connection turns readable or a new one is admitted.
    ///
    /// The duration bounds the park, so connections past
    /// [`idle_timeout`](ConnLimits::idle_timeout) are dropped at most this
    /// late.
    Sleep(Duration),
}

/// Connection-level limits and timeouts
///
/// Every admission stage has its own deadline: a short one for the
/// request line, which sheds idle and non-HTTP clients cheaply, and longer
/// ones for the later stages. A stage deadline covers all reads of that
/// stage, so trickling bytes does not extend it.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Time allowed for the whole request line once bytes arrived
    /// (default: `2 seconds`)
    pub signature_timeout: Duration,

    /// Time allowed for the whole header block (default: `5 seconds`)
    pub header_timeout: Duration,

    /// Time allowed for each read of the request body (default: `10 seconds`)
    pub body_timeout: Duration,

    /// Time the dispatcher has to produce a response (default: `30 seconds`)
    ///
    /// On expiry the client gets a `503` and the connection is closed.
    pub dispatch_timeout: Duration,

    /// Maximum duration of a single socket write (default: `3 seconds`)
    pub write_timeout: Duration,

    /// Keep-alive connections silent for this long are dropped by the
    /// cycler (default: `30 seconds`)
    pub idle_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`)
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of a keep-alive connection (default: `2 minutes`)
    ///
    /// Checked between exchanges; an exchange in progress is never cut.
    pub connection_lifetime: Duration,

    /// TCP keepalive probe interval set on accepted sockets
    /// (default: `Some(60 seconds)`).
    pub tcp_keepalive: Option<Duration>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            signature_timeout: Duration::from_secs(2),
            header_timeout: Duration::from_secs(5),
            body_timeout: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(30),
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),
            tcp_keepalive: Some(Duration::from_secs(60)),

            _priv: (),
        }
    }
}

/// HTTP request parsing limits
///
/// ⚠️ **SECURITY-FIRST DEFAULTS**
///
/// 🔧 **You MAY need to increase these if you see:**
/// - `413 Payload Too Large` for legitimate requests
/// - `414 URI Too Long` for normal API calls
/// - `431 Request Header Fields Too Large`
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request target length in bytes, path and query included
    /// (default: `1024 B`)
    pub url_size: usize,

    /// Maximum number of query parameters (default: `32`)
    pub url_query_parts: usize,

    /// Maximum size of the whole header block, terminating empty line
    /// included (default: `8 KB`)
    ///
    /// Bytes are never buffered past this bound: the request fails with
    /// `431` as soon as it is crossed.
    pub header_block_size: usize,

    /// Maximum number of header lines (default: `32`)
    pub header_count: usize,

    /// Maximum request body size in bytes (default: `1 MB`)
    ///
    /// A larger `Content-Length` is rejected with `413` before any body byte
    /// is read. Chunked bodies are cut off while decoding.
    pub body_size: usize,

    /// Maximum number of `application/x-www-form-urlencoded` fields decoded
    /// by [`Body::form`](crate::Body::form) (default: `64`)
    pub form_fields: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            url_size: 1024,
            url_query_parts: 32,

            header_block_size: 8 * 1024,
            header_count: 32,

            body_size: 1024 * 1024,
            form_fields: 64,

            _priv: (),
        }
    }
}

impl ReqLimits {
    #[inline(always)]
    // First line of a request:
    // OPTIONS /url/test HTTP/1.1\r\n
    // |-----| |-------| |------|
    //  Method    URl    Version
    //
    // Formula: Method(7) + " " + URl + " " + Version(8) + "\r\n"
    pub(crate) const fn first_line(&self) -> usize {
        19 + self.url_size
    }
}

/// Response buffer management.
///
/// The connection reuses one buffer for response heads:
/// ```rust
/// # use maker_ws::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<()> = Vec::with_capacity(limits.default_capacity);
/// #
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`)
    pub default_capacity: usize,
    /// Maximum capacity kept between exchanges (default: `8192 B`)
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,

            _priv: (),
        }
    }
}

/// WebSocket session limits
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Largest single frame payload accepted (default: `1 MB`)
    pub max_frame_size: usize,

    /// Largest reassembled (and inflated) message accepted (default: `4 MB`)
    ///
    /// Exceeding it closes the session with `1009`.
    pub max_message_size: usize,

    /// A session with no inbound traffic for this long is closed with
    /// `1001` (default: `60 seconds`)
    pub idle_timeout: Duration,

    /// Size of the read buffer of the session loop (default: `4096 B`)
    pub read_buffer: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
            max_message_size: 4 * 1024 * 1024,
            idle_timeout: Duration::from_secs(60),
            read_buffer: 4096,

            _priv: (),
        }
    }
}

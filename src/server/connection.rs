use crate::{
    errors::ErrorKind,
    http::{
        body::{Body, BodyOutcome, Decoder},
        headers::HeaderReader,
        response::{Response, WriteContext},
        signature::{SignatureReader, Status},
        types::{Method, StatusCode, Version},
    },
    server::{
        dispatch::{Dispatcher, ErrorHandler},
        inbox::Inbox,
        server::AllLimits,
    },
    ws::{
        handshake::{is_upgrade_request, Accepted, WebSocketUpgrade},
        session::{self, WebSocket, WebSocketHandler},
    },
};
use std::{
    marker::PhantomData,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::OwnedSemaphorePermit,
    time::timeout,
};
use tracing::{debug, trace, warn};

/// Byte stream a connection can be served over.
pub(crate) trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Socket for T {}

/// Everything connections of one server share.
pub(crate) struct Service<D, W> {
    pub(crate) dispatcher: D,
    pub(crate) error_handler: ErrorHandler,
    pub(crate) limits: AllLimits,
    pub(crate) _marker: PhantomData<fn() -> W>,
}

/// Position of a connection inside the current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    AwaitingSignature,
    AwaitingHeaders,
    Dispatching,
    Upgraded,
    Closed,
}

impl Stage {
    const fn as_str(self) -> &'static str {
        match self {
            Stage::AwaitingSignature => "signature",
            Stage::AwaitingHeaders => "headers",
            Stage::Dispatching => "dispatch",
            Stage::Upgraded => "upgraded",
            Stage::Closed => "closed",
        }
    }
}

/// What the cycler should do with a connection it is holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Request bytes are waiting.
    Ready,
    /// Nothing to read yet.
    Idle,
    /// Closed by the peer or broken.
    Gone,
}

enum Flow<W> {
    KeepAlive,
    Close,
    Upgrade(WebSocketUpgrade<W>, Option<String>),
}

/// One accepted socket, served one exchange at a time.
pub(crate) struct Connection<S, D, W> {
    stream: S,
    peer: SocketAddr,
    inbox: Inbox,
    out: Vec<u8>,
    service: Arc<Service<D, W>>,
    stage: Stage,

    created: Instant,
    last_active: Instant,
    requests: usize,
    permit: OwnedSemaphorePermit,
}

impl<S, D, W> Connection<S, D, W>
where
    S: Socket,
    D: Dispatcher<W>,
    W: WebSocketHandler,
{
    pub(crate) fn new(
        stream: S,
        peer: SocketAddr,
        service: Arc<Service<D, W>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let req = &service.limits.req;
        let inbox = Inbox::new(req.header_block_size.max(req.first_line()));
        let out = Vec::with_capacity(service.limits.resp.default_capacity);

        Self {
            stream,
            peer,
            inbox,
            out,
            service,
            stage: Stage::AwaitingSignature,

            created: Instant::now(),
            last_active: Instant::now(),
            requests: 0,
            permit,
        }
    }

    /// Checks for pending bytes without waiting for them.
    pub(crate) async fn poll_ready(&mut self) -> Readiness {
        if !self.inbox.is_empty() {
            return Readiness::Ready;
        }

        match self.inbox.try_fill(&mut self.stream).await {
            None => Readiness::Idle,
            Some(Ok(0) | Err(_)) => Readiness::Gone,
            Some(Ok(_)) => Readiness::Ready,
        }
    }

    #[inline]
    pub(crate) fn is_idle_expired(&self) -> bool {
        self.last_active.elapsed() > self.service.limits.conn.idle_timeout
    }

    /// Runs one exchange. Returns the connection when it stays open for the
    /// next request.
    pub(crate) async fn serve(mut self) -> Option<Self> {
        match self.exchange().await {
            Flow::KeepAlive => {
                self.stage = Stage::AwaitingSignature;
                self.last_active = Instant::now();
                Some(self)
            }
            Flow::Close => {
                self.stage = Stage::Closed;
                let _ = timeout(
                    self.service.limits.conn.write_timeout,
                    self.stream.shutdown(),
                )
                .await;
                None
            }
            Flow::Upgrade(upgrade, protocol) => {
                self.stage = Stage::Upgraded;
                self.into_session(upgrade, protocol);
                None
            }
        }
    }

    async fn exchange(&mut self) -> Flow<W> {
        let service = Arc::clone(&self.service);
        let limits = &service.limits;

        // A: request line, then the early route check
        self.stage = Stage::AwaitingSignature;
        let mut reader = SignatureReader::new(&limits.req);
        let read = self
            .read_stage(limits.conn.signature_timeout, |data| reader.feed(data))
            .await;

        let signature = match read.and_then(|()| reader.finish()) {
            Ok(signature) => signature,
            Err(ErrorKind::Timeout | ErrorKind::Eof | ErrorKind::Io(_)) => return Flow::Close,
            Err(err) => return self.reject(Version::Http11, err).await,
        };
        let (method, version) = (signature.method(), signature.version());

        if !service.dispatcher.can_process(method, signature.path()) {
            if method == Method::Options && service.dispatcher.has_path(signature.path()) {
                trace!(peer = %self.peer, path = signature.path(), "preflight answered");
                let response = Response::new(StatusCode::NoContent);
                self.write_response(response, version, false, false).await;
                return Flow::Close;
            }
            return self.reject(version, ErrorKind::NotFound).await;
        }

        // B: header block
        self.stage = Stage::AwaitingHeaders;
        let mut reader = HeaderReader::new(&limits.req);
        let read = self
            .read_stage(limits.conn.header_timeout, |data| reader.feed(data))
            .await;

        let headers = match read.and_then(|()| reader.finish()) {
            Ok(headers) => headers,
            Err(err) => return self.reject(version, err).await,
        };

        // C: size guard, before any body byte
        if headers
            .content_length()
            .is_some_and(|length| length > limits.req.body_size)
        {
            return self.reject(version, ErrorKind::BodyTooLarge).await;
        }

        if is_upgrade_request(&headers) {
            if let Some(mut upgrade) = service.dispatcher.upgrade(&signature, &headers) {
                return match upgrade.accept(&signature, &headers) {
                    Ok(Accepted { response, protocol }) => {
                        match self.write_response(response, version, true, false).await {
                            true => Flow::Upgrade(upgrade, protocol),
                            false => Flow::Close,
                        }
                    }
                    Err(err) => self.reject(version, err).await,
                };
            }
        }

        // D: dispatch
        self.stage = Stage::Dispatching;
        let requested = match version {
            Version::Http11 => !headers.has_token("connection", "close"),
            Version::Http10 => headers.has_token("connection", "keep-alive"),
        };

        let mut body = Body::new(
            &mut self.inbox,
            &mut self.stream,
            Decoder::for_headers(&headers),
            limits.req.body_size,
            limits.req.form_fields,
            limits.conn.body_timeout,
        );
        let handled = timeout(
            limits.conn.dispatch_timeout,
            service.dispatcher.handle(&signature, &headers, &mut body),
        )
        .await;
        let outcome = body.into_outcome();

        let response = match handled {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                warn!(peer = %self.peer, path = signature.path(), error = %error, "dispatcher failed");
                (service.error_handler)(&error)
            }
            Err(_) => {
                warn!(peer = %self.peer, path = signature.path(), "dispatcher timed out");
                return self.reject(version, ErrorKind::DispatchTimeout).await;
            }
        };

        let drained = match outcome {
            BodyOutcome::Drained => true,
            BodyOutcome::Unread => false,
            BodyOutcome::Failed(err) => return self.reject(version, err).await,
        };

        self.requests += 1;
        let keep_alive = response.keeps_alive(version, requested && drained)
            && self.requests < limits.conn.max_requests_per_connection
            && self.created.elapsed() < limits.conn.connection_lifetime;

        let head_only = method == Method::Head;
        match self
            .write_response(response, version, keep_alive, head_only)
            .await
        {
            true if keep_alive => Flow::KeepAlive,
            _ => Flow::Close,
        }
    }

    /// Feeds buffered and then freshly read bytes to `feed` until it
    /// completes. The whole stage must finish within `time`, however the
    /// bytes are spread over reads.
    async fn read_stage<F>(&mut self, time: Duration, mut feed: F) -> Result<(), ErrorKind>
    where
        F: FnMut(&[u8]) -> Result<Status, ErrorKind>,
    {
        let deadline = Instant::now() + time;

        loop {
            if !self.inbox.is_empty() {
                match feed(self.inbox.pending())? {
                    Status::Complete(n) => {
                        self.inbox.consume(n);
                        return Ok(());
                    }
                    Status::Incomplete => {
                        let n = self.inbox.pending().len();
                        self.inbox.consume(n);
                    }
                }
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ErrorKind::Timeout);
            }
            if self.inbox.fill(&mut self.stream, left).await? == 0 {
                return Err(ErrorKind::Eof);
            }
        }
    }

    /// Writes the canned response of `err` unless it is silent.
    async fn reject(&mut self, version: Version, err: ErrorKind) -> Flow<W> {
        if err.is_silent() {
            trace!(peer = %self.peer, stage = self.stage.as_str(), error = %err, "dropping connection");
            return Flow::Close;
        }

        debug!(peer = %self.peer, stage = self.stage.as_str(), error = %err, "rejecting request");
        let limits = &self.service.limits;
        let _ = writer::send_error(
            &mut self.stream,
            version,
            &err,
            limits.server.json_errors,
            limits.conn.write_timeout,
        )
        .await;

        Flow::Close
    }

    async fn write_response(
        &mut self,
        response: Response,
        version: Version,
        keep_alive: bool,
        head_only: bool,
    ) -> bool {
        let ctx = WriteContext {
            version,
            keep_alive,
            head_only,
            timeout: self.service.limits.conn.write_timeout,
        };

        let result = response.write_to(&mut self.stream, &mut self.out, ctx).await;

        let resp = &self.service.limits.resp;
        if self.out.capacity() > resp.max_capacity {
            self.out = Vec::with_capacity(resp.default_capacity);
        } else {
            self.out.clear();
        }

        if let Err(e) = &result {
            debug!(peer = %self.peer, error = %e, "response write failed");
        }
        result.is_ok()
    }

    /// Hands the socket to a dedicated session task. The admission permit
    /// moves with it.
    fn into_session(self, upgrade: WebSocketUpgrade<W>, protocol: Option<String>) {
        let Connection {
            stream,
            peer,
            mut inbox,
            service,
            permit,
            ..
        } = self;

        let leftover = inbox.take();
        let (reader, writer) = tokio::io::split(stream);
        let WebSocketUpgrade {
            handler, extension, ..
        } = upgrade;

        let limits = &service.limits;
        let ws = WebSocket::new(
            Box::new(writer),
            extension,
            protocol,
            limits.conn.write_timeout,
        );

        debug!(peer = %peer, protocol = ws.protocol(), "websocket session started");
        tokio::spawn(session::run(
            reader,
            ws,
            leftover,
            handler,
            limits.ws.clone(),
            permit,
        ));
    }
}

pub(crate) mod writer {
    use crate::{errors::ErrorKind, http::types::Version};
    use std::{io, time::Duration};
    use tokio::{
        io::{AsyncWrite, AsyncWriteExt},
        time::timeout,
    };

    #[inline(always)]
    pub(crate) async fn send_error<W>(
        writer: &mut W,
        version: Version,
        error: &ErrorKind,
        json: bool,
        time: Duration,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        write_bytes(writer, error.as_http(version, json), time).await
    }

    /// `write_all` bounded by `time`; expiry is reported as `TimedOut`.
    #[inline(always)]
    pub(crate) async fn write_bytes<W>(writer: &mut W, bytes: &[u8], time: Duration) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match timeout(time, writer.write_all(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
        }
    }
}

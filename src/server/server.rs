use crate::{
    errors::{ErrorKind, ServerError},
    http::{response::Response, types::Version},
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WsLimits},
    server::{
        connection::{writer, Connection, Service},
        cycler::Cycler,
        dispatch::{default_error_handler, BoxError, Dispatcher, ErrorHandler},
    },
    ws::session::WebSocketHandler,
};
use crossbeam::queue::ArrayQueue;
use socket2::{SockRef, TcpKeepalive};
use std::{
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::AsyncWrite,
    net::{TcpListener, TcpStream},
    sync::{Notify, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

/// Set while a [`Server`] exists in this process.
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Every limit of a server, resolved from the builder.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllLimits {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) resp: RespLimits,
    pub(crate) ws: WsLimits,
}

/// An HTTP/1.1 server with WebSocket upgrade.
///
/// Only one server may exist per process at a time; see
/// [`ServerBuilder::build`].
///
/// # Examples
///
/// ```no_run
/// use maker_ws::{Body, BoxError, Dispatcher, HeaderSet, Method, RequestSignature, Response, Server, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyDispatcher;
///
/// impl Dispatcher for MyDispatcher {
///     fn can_process(&self, method: Method, path: &str) -> bool {
///         method == Method::Get && path == "/"
///     }
///
///     async fn handle(
///         &self,
///         _: &RequestSignature,
///         _: &HeaderSet,
///         _: &mut Body<'_>,
///     ) -> Result<Response, BoxError> {
///         Ok(Response::new(StatusCode::Ok).body("Hello world!"))
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .dispatcher(MyDispatcher)
///         .build()
///         .unwrap()
///         .launch()
///         .await
/// }
/// ```
pub struct Server<D, W = ()>
where
    D: Dispatcher<W>,
    W: WebSocketHandler,
{
    listener: TcpListener,
    service: Arc<Service<D, W>>,
}

impl<D, W> Server<D, W>
where
    D: Dispatcher<W>,
    W: WebSocketHandler,
{
    /// Creates a new builder for configuring the server instance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_ws::impt_default_dispatcher!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use maker_ws::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .dispatcher(MyStruct) // structure with Dispatcher implementation
    ///     .build();
    /// # }
    /// ```
    #[inline]
    pub fn builder() -> ServerBuilder<D, W> {
        ServerBuilder {
            listener: None,
            dispatcher: None,
            error_handler: default_error_handler(),
            limits: AllLimits::default(),
            _marker: PhantomData,
        }
    }

    /// Address the listener is bound to.
    #[inline]
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the returned future is dropped.
    ///
    /// Every accepted socket needs one of
    /// [`max_connections`](ServerLimits::max_connections) admission slots for
    /// its whole life, WebSocket sessions included. Sockets arriving when all
    /// slots are taken get a `503`, as long as no more than
    /// [`max_pending_503`](ServerLimits::max_pending_503) of them are already
    /// waiting for one.
    pub async fn launch(self) {
        let limits = &self.service.limits;
        let admission = Arc::new(Semaphore::new(limits.server.max_connections));
        let cycler = Arc::new(Cycler::new(
            limits.server.workers,
            limits.server.wait_strategy.clone(),
        ));
        let overflow = Arc::new(Overflow::new(limits.server.max_pending_503));

        let mut tasks = Tasks(Vec::with_capacity(1 + limits.server.count_503_handlers));
        tasks.0.push(tokio::spawn(Arc::clone(&cycler).run()));
        for _ in 0..limits.server.count_503_handlers {
            tasks.0.push(spawn_alarmist(
                Arc::clone(&overflow),
                limits.server.json_errors,
                limits.conn.write_timeout,
            ));
        }

        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "server listening");
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            tune_socket(&stream, &limits.conn);

            match Arc::clone(&admission).try_acquire_owned() {
                Ok(permit) => {
                    trace!(%peer, "connection admitted");
                    cycler.add(Connection::new(
                        stream,
                        peer,
                        Arc::clone(&self.service),
                        permit,
                    ));
                }
                Err(_) if limits.server.count_503_handlers == 0 => {
                    debug!(%peer, "at capacity, dropping connection");
                }
                Err(_) => match overflow.offer(stream) {
                    true => debug!(%peer, "at capacity, answering 503"),
                    false => debug!(%peer, "at capacity, 503 queue full, dropping connection"),
                },
            }
        }
    }
}

impl<D, W> Drop for Server<D, W>
where
    D: Dispatcher<W>,
    W: WebSocketHandler,
{
    fn drop(&mut self) {
        RUNNING.store(false, Ordering::Release);
    }
}

/// Sockets rejected at the admission cap, waiting for their `503`.
struct Overflow<S> {
    queue: ArrayQueue<S>,
    pushed: Notify,
}

impl<S> Overflow<S> {
    fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            pushed: Notify::new(),
        }
    }

    /// Queues `stream` for an alarmist. A full queue drops it.
    fn offer(&self, stream: S) -> bool {
        match self.queue.push(stream) {
            Ok(()) => {
                self.pushed.notify_one();
                true
            }
            Err(_) => false,
        }
    }

    async fn next(&self) -> S {
        loop {
            if let Some(stream) = self.queue.pop() {
                return stream;
            }
            self.pushed.notified().await;
        }
    }
}

fn spawn_alarmist<S>(
    overflow: Arc<Overflow<S>>,
    json: bool,
    write_timeout: Duration,
) -> JoinHandle<()>
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut stream = overflow.next().await;
            let _ = writer::send_error(
                &mut stream,
                Version::Http11,
                &ErrorKind::ServiceUnavailable,
                json,
                write_timeout,
            )
            .await;
        }
    })
}

/// Background tasks of a running server, stopped with it.
struct Tasks(Vec<JoinHandle<()>>);

impl Drop for Tasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

fn tune_socket(stream: &TcpStream, limits: &ConnLimits) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(error = %e, "TCP_NODELAY not set");
    }

    if let Some(time) = limits.tcp_keepalive {
        let keepalive = TcpKeepalive::new().with_time(time);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            trace!(error = %e, "TCP keepalive not set");
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<D, W = ()>
where
    D: Dispatcher<W>,
    W: WebSocketHandler,
{
    listener: Option<TcpListener>,
    dispatcher: Option<D>,
    error_handler: ErrorHandler,
    limits: AllLimits,
    _marker: PhantomData<fn() -> W>,
}

impl<D, W> ServerBuilder<D, W>
where
    D: Dispatcher<W>,
    W: WebSocketHandler,
{
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the dispatcher that routes incoming requests.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn dispatcher(mut self, dispatcher: D) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Replaces the handler that turns dispatcher errors into responses.
    ///
    /// The default answers `500 Internal Server Error` with the error message
    /// as the body.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_ws::impt_default_dispatcher!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_ws::{Response, Server, StatusCode};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .dispatcher(MyStruct)
    ///     .error_handler(|_| Response::new(StatusCode::BadGateway).body("try again later"))
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BoxError) -> Response + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Configures server-level concurrency limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_ws::impt_default_dispatcher!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_ws::{Server, limits::ServerLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .dispatcher(MyStruct)
    ///     .server_limits(ServerLimits {
    ///         max_connections: 10_000,
    ///         workers: 128,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.limits.server = limits;
        self
    }

    /// Configures per-connection timeouts and reuse limits.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.limits.conn = limits;
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.limits.req = limits;
        self
    }

    /// Configures response buffer reuse.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.limits.resp = limits;
        self
    }

    /// Configures WebSocket session limits.
    #[inline(always)]
    pub fn websocket_limits(mut self, limits: WsLimits) -> Self {
        self.limits.ws = limits;
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Errors
    ///
    /// - [`ServerError::MissingListener`] / [`ServerError::MissingDispatcher`]
    ///   when a required component was not set.
    /// - [`ServerError::AlreadyRunning`] while another [`Server`] is alive in
    ///   this process. Dropping that server frees the slot.
    pub fn build(self) -> Result<Server<D, W>, ServerError> {
        let listener = self.listener.ok_or(ServerError::MissingListener)?;
        let dispatcher = self.dispatcher.ok_or(ServerError::MissingDispatcher)?;

        if RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServerError::AlreadyRunning);
        }

        Ok(Server {
            listener,
            service: Arc::new(Service {
                dispatcher,
                error_handler: self.error_handler,
                limits: self.limits,
                _marker: PhantomData,
            }),
        })
    }
}

//! WebSocket session: application callbacks, the send handle and the read
//! loop that runs on its own task after a successful upgrade.

use crate::{
    errors::{CloseCode, WsError},
    limits::WsLimits,
    server::{connection::writer::write_bytes, inbox::Inbox},
    wire::OpCode,
    ws::{
        extension::Extension,
        frame::{Frame, FrameDecoder},
    },
};
use std::{
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, OwnedSemaphorePermit},
    time::timeout,
};
use tracing::{debug, trace};

/// Callbacks of an upgraded connection.
///
/// Every method has an empty default, so implementors only write the events
/// they care about. Callbacks of one session run one at a time, in frame
/// order; a slow callback delays reading from that socket only.
///
/// # Examples
/// ```
/// use maker_ws::{CloseCode, WebSocket, WebSocketHandler};
///
/// struct Chat;
///
/// impl WebSocketHandler for Chat {
///     async fn on_open(&self, ws: &WebSocket) {
///         let _ = ws.send_text("welcome").await;
///     }
///
///     async fn on_text(&self, ws: &WebSocket, text: String) {
///         if text == "bye" {
///             let _ = ws.close(CloseCode::NORMAL, "see you").await;
///         } else {
///             let _ = ws.send_text(text).await;
///         }
///     }
///
///     async fn on_close(&self, _: &WebSocket, code: CloseCode, reason: &str, remote: bool) {
///         println!("closed {}: {} {reason}", if remote { "by the peer" } else { "on a local failure" }, code.0);
///     }
/// }
/// ```
pub trait WebSocketHandler
where
    Self: Send + Sync + 'static,
{
    /// Runs once, right after the `101` response was written.
    fn on_open(&self, _ws: &WebSocket) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A complete, UTF-8 validated text message.
    fn on_text(&self, _ws: &WebSocket, _text: String) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A complete binary message.
    fn on_binary(&self, _ws: &WebSocket, _data: Vec<u8>) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A ping. The pong is sent automatically after this returns.
    fn on_ping(&self, _ws: &WebSocket, _payload: &[u8]) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_pong(&self, _ws: &WebSocket, _payload: &[u8]) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Runs exactly once per session.
    ///
    /// `remote` is `true` whenever the session ended on a close frame from
    /// the peer or a dropped socket, including the peer's answer to a close
    /// the server sent first. It is `false` when the session ended on a local
    /// failure such as a protocol error or a timeout.
    fn on_close(
        &self,
        _ws: &WebSocket,
        _code: CloseCode,
        _reason: &str,
        _remote: bool,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A protocol or I/O failure; [`on_close`](Self::on_close) follows.
    fn on_error(&self, _ws: &WebSocket, _error: &WsError) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Sessions without callbacks.
impl WebSocketHandler for () {}

type Writer = Box<dyn AsyncWrite + Unpin + Send>;

struct Shared {
    writer: AsyncMutex<Writer>,
    extension: Mutex<Box<dyn Extension>>,
    protocol: Option<String>,
    close_sent: AtomicBool,
    finished: AtomicBool,
    write_timeout: Duration,
}

/// Send handle of a session.
///
/// Cheap to clone and usable from any task. Frames are written one at a
/// time; concurrent senders queue on the session's writer.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("protocol", &self.shared.protocol)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl WebSocket {
    pub(crate) fn new(
        writer: Writer,
        extension: Box<dyn Extension>,
        protocol: Option<String>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                writer: AsyncMutex::new(writer),
                extension: Mutex::new(extension),
                protocol,
                close_sent: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                write_timeout,
            }),
        }
    }

    /// Subprotocol selected during the handshake.
    #[inline]
    pub fn protocol(&self) -> Option<&str> {
        self.shared.protocol.as_deref()
    }

    /// `true` once a close frame was sent or the session ended.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.close_sent.load(Ordering::Acquire)
            || self.shared.finished.load(Ordering::Acquire)
    }

    /// Sends a text message as a single frame.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), WsError> {
        self.send_data(OpCode::Text, text.into().into_bytes()).await
    }

    /// Sends a binary message as a single frame.
    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), WsError> {
        self.send_data(OpCode::Binary, data.into()).await
    }

    /// Sends a ping. At most 125 bytes of `payload` are allowed.
    pub async fn ping(&self, payload: impl Into<Vec<u8>>) -> Result<(), WsError> {
        let payload = payload.into();
        if payload.len() > 125 {
            return Err(WsError::Protocol("control frame payload over 125 bytes"));
        }
        self.send_data(OpCode::Ping, payload).await
    }

    /// Starts the close handshake. Does nothing if a close frame was already
    /// sent.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), WsError> {
        if self.shared.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.write_frame(Frame::close(code, reason)).await
    }

    async fn send_data(&self, opcode: OpCode, payload: Vec<u8>) -> Result<(), WsError> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        self.write_frame(Frame::new(opcode, payload, true)).await
    }

    /// Encodes and writes one frame while holding the writer.
    async fn write_frame(&self, mut frame: Frame) -> Result<(), WsError> {
        let mut writer = self.shared.writer.lock().await;
        if self.shared.finished.load(Ordering::Acquire) {
            return Err(WsError::Closed);
        }

        {
            let mut extension = self
                .shared
                .extension
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            extension.encode(&mut frame)?;
        }

        let mut out = Vec::with_capacity(frame.payload.len() + 10);
        frame.encode(&mut out);

        write_bytes(&mut *writer, &out, self.shared.write_timeout).await?;
        Ok(())
    }

    fn decode(&self, frame: &mut Frame) -> Result<(), WsError> {
        self.shared
            .extension
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decode(frame)
    }

    async fn finish(&self) {
        let mut writer = self.shared.writer.lock().await;
        self.shared.finished.store(true, Ordering::Release);
        let _ = timeout(self.shared.write_timeout, writer.shutdown()).await;
    }
}

/// How the read loop ended.
enum End {
    /// Close frame received and answered.
    Closed,
    /// Socket closed without a close frame.
    Dropped,
    Failed(WsError),
}

struct Session<W> {
    handler: W,
    decoder: FrameDecoder,
    pending: Option<(OpCode, Vec<u8>)>,
    max_message_size: usize,
}

/// Runs a session to completion. `leftover` holds bytes read past the
/// handshake request.
pub(crate) async fn run<R, W>(
    mut reader: R,
    ws: WebSocket,
    leftover: Vec<u8>,
    handler: W,
    limits: WsLimits,
    _permit: OwnedSemaphorePermit,
) where
    R: AsyncRead + Unpin + Send,
    W: WebSocketHandler,
{
    let mut session = Session {
        handler,
        decoder: FrameDecoder::new(limits.max_frame_size),
        pending: None,
        max_message_size: limits.max_message_size,
    };

    session.handler.on_open(&ws).await;

    let end = session.read_loop(&ws, &mut reader, leftover, &limits).await;
    match end {
        End::Closed => {}
        End::Dropped => {
            trace!("websocket peer went away");
            session
                .handler
                .on_close(&ws, CloseCode::ABNORMAL, "", true)
                .await;
        }
        End::Failed(err) => {
            debug!(error = %err, code = err.close_code().0, "websocket session failed");
            session.handler.on_error(&ws, &err).await;

            let code = err.close_code();
            if !matches!(err, WsError::Io(_)) {
                let _ = ws.close(code, &err.to_string()).await;
            }
            session.handler.on_close(&ws, code, "", false).await;
        }
    }

    ws.finish().await;
}

impl<W: WebSocketHandler> Session<W> {
    async fn read_loop<R>(
        &mut self,
        ws: &WebSocket,
        reader: &mut R,
        leftover: Vec<u8>,
        limits: &WsLimits,
    ) -> End
    where
        R: AsyncRead + Unpin + Send,
    {
        match self.feed(ws, &leftover).await {
            Ok(true) => return End::Closed,
            Ok(false) => {}
            Err(err) => return End::Failed(err),
        }

        let mut inbox = Inbox::new(limits.read_buffer);
        loop {
            match inbox.fill(reader, limits.idle_timeout).await {
                Ok(0) => return End::Dropped,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return End::Failed(WsError::IdleTimeout)
                }
                Err(e) => return End::Failed(WsError::Io(e)),
            }

            let bytes = inbox.take();
            match self.feed(ws, &bytes).await {
                Ok(true) => return End::Closed,
                Ok(false) => {}
                Err(err) => return End::Failed(err),
            }
        }
    }

    /// Pushes bytes through the decoder. `Ok(true)` once the close
    /// handshake finished.
    async fn feed(&mut self, ws: &WebSocket, bytes: &[u8]) -> Result<bool, WsError> {
        for &byte in bytes {
            if let Some(frame) = self.decoder.push(byte)? {
                if self.on_frame(ws, frame).await? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn on_frame(&mut self, ws: &WebSocket, mut frame: Frame) -> Result<bool, WsError> {
        ws.decode(&mut frame)?;
        if frame.has_rsv() {
            return Err(WsError::Protocol("reserved bits set"));
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.pending.is_some() {
                    return Err(WsError::Protocol("data frame inside a fragmented message"));
                }
                self.check_size(frame.payload.len())?;

                match frame.fin {
                    true => self.deliver(ws, frame.opcode, frame.payload).await?,
                    false => self.pending = Some((frame.opcode, frame.payload)),
                }
            }
            OpCode::Continuation => {
                let Some((_, buffer)) = self.pending.as_mut() else {
                    return Err(WsError::Protocol("continuation without a message"));
                };
                buffer.extend_from_slice(&frame.payload);
                let size = buffer.len();
                self.check_size(size)?;

                if frame.fin {
                    if let Some((opcode, payload)) = self.pending.take() {
                        self.deliver(ws, opcode, payload).await?;
                    }
                }
            }
            OpCode::Ping => {
                self.handler.on_ping(ws, &frame.payload).await;
                if !ws.is_closed() {
                    ws.write_frame(Frame::new(OpCode::Pong, frame.payload, true))
                        .await?;
                }
            }
            OpCode::Pong => self.handler.on_pong(ws, &frame.payload).await,
            OpCode::Close => {
                let (code, reason) = frame.parse_close()?;
                self.pending = None;

                let echo = !ws.shared.close_sent.swap(true, Ordering::AcqRel);
                if echo {
                    // Echo the received code; a bodiless close is echoed bodiless
                    let _ = ws.write_frame(Frame::close(code, "")).await;
                }

                trace!(code = code.0, echo, "websocket close handshake");
                self.handler.on_close(ws, code, &reason, true).await;
                return Ok(true);
            }
        }

        Ok(false)
    }

    #[inline]
    fn check_size(&self, size: usize) -> Result<(), WsError> {
        match size > self.max_message_size {
            true => Err(WsError::MessageTooBig),
            false => Ok(()),
        }
    }

    async fn deliver(&self, ws: &WebSocket, opcode: OpCode, payload: Vec<u8>) -> Result<(), WsError> {
        if opcode == OpCode::Binary {
            self.handler.on_binary(ws, payload).await;
            return Ok(());
        }

        simdutf8::basic::from_utf8(&payload).map_err(|_| WsError::InvalidUtf8)?;
        // SAFETY: validated as UTF-8 on the line above
        let text = unsafe { String::from_utf8_unchecked(payload) };
        self.handler.on_text(ws, text).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{deflate::PerMessageDeflate, extension::Negotiation, extension::NoExtension};
    use std::sync::Arc;
    use tokio::{
        io::{AsyncReadExt, DuplexStream},
        sync::Semaphore,
        task::JoinHandle,
    };

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl WebSocketHandler for Recorder {
        async fn on_open(&self, _: &WebSocket) {
            self.push("open".into());
        }

        async fn on_text(&self, ws: &WebSocket, text: String) {
            self.push(format!("text:{text}"));
            if text == "close me" {
                ws.close(CloseCode::NORMAL, "done").await.unwrap();
            } else {
                ws.send_text(text).await.unwrap();
            }
        }

        async fn on_binary(&self, _: &WebSocket, data: Vec<u8>) {
            self.push(format!("binary:{}", data.len()));
        }

        async fn on_ping(&self, _: &WebSocket, payload: &[u8]) {
            self.push(format!("ping:{}", String::from_utf8_lossy(payload)));
        }

        async fn on_close(&self, _: &WebSocket, code: CloseCode, reason: &str, remote: bool) {
            self.push(format!("close:{}:{reason}:{remote}", code.0));
        }

        async fn on_error(&self, _: &WebSocket, error: &WsError) {
            self.push(format!("error:{}", error.close_code().0));
        }
    }

    fn limits() -> WsLimits {
        WsLimits {
            max_message_size: 64,
            idle_timeout: Duration::from_secs(2),
            ..WsLimits::default()
        }
    }

    fn start_with(
        recorder: &Recorder,
        extension: Box<dyn Extension>,
        leftover: Vec<u8>,
        limits: WsLimits,
    ) -> (DuplexStream, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let ws = WebSocket::new(Box::new(writer), extension, None, Duration::from_secs(1));

        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        let task = tokio::spawn(run(reader, ws, leftover, recorder.clone(), limits, permit));
        (client, task)
    }

    fn start(recorder: &Recorder) -> (DuplexStream, JoinHandle<()>) {
        start_with(recorder, Box::new(NoExtension), Vec::new(), limits())
    }

    fn masked(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mut frame = Frame::new(opcode, payload.to_vec(), fin);
        frame.mask = Some([0x37, 0xfa, 0x21, 0x3d]);

        let mut out = Vec::new();
        frame.encode(&mut out);
        out
    }

    async fn read_frame(client: &mut DuplexStream) -> Frame {
        let mut decoder = FrameDecoder::new(1 << 20);
        let mut byte = [0u8; 1];
        loop {
            client.read_exact(&mut byte).await.unwrap();
            if let Some(frame) = decoder.push(byte[0]).unwrap() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn echo_and_remote_close() {
        let recorder = Recorder::default();
        let (mut client, task) = start(&recorder);

        client.write_all(&masked(OpCode::Text, b"hello", true)).await.unwrap();
        let echo = read_frame(&mut client).await;
        assert_eq!(echo.opcode, OpCode::Text);
        assert_eq!(echo.payload, b"hello");
        assert_eq!(echo.mask, None);

        let close = Frame::close(CloseCode::GOING_AWAY, "bye");
        client.write_all(&masked(OpCode::Close, &close.payload, true)).await.unwrap();

        let reply = read_frame(&mut client).await;
        assert_eq!(reply.opcode, OpCode::Close);
        assert_eq!(reply.payload, 1001u16.to_be_bytes());

        task.await.unwrap();
        assert_eq!(
            recorder.events(),
            ["open", "text:hello", "close:1001:bye:true"]
        );
    }

    #[tokio::test]
    async fn fragments_with_interleaved_ping() {
        let recorder = Recorder::default();
        let (mut client, task) = start(&recorder);

        client.write_all(&masked(OpCode::Text, b"frag", false)).await.unwrap();
        client.write_all(&masked(OpCode::Ping, b"p", true)).await.unwrap();
        client.write_all(&masked(OpCode::Continuation, b"men", false)).await.unwrap();
        client.write_all(&masked(OpCode::Continuation, b"ted", true)).await.unwrap();

        let pong = read_frame(&mut client).await;
        assert_eq!((pong.opcode, pong.payload.as_slice()), (OpCode::Pong, &b"p"[..]));
        let echo = read_frame(&mut client).await;
        assert_eq!(echo.payload, b"fragmented");

        drop(client);
        task.await.unwrap();
        assert_eq!(
            recorder.events(),
            ["open", "ping:p", "text:fragmented", "close:1006::true"]
        );
    }

    #[tokio::test]
    async fn local_close_is_sent_once() {
        let recorder = Recorder::default();
        let (mut client, task) = start(&recorder);

        client.write_all(&masked(OpCode::Text, b"close me", true)).await.unwrap();
        let close = read_frame(&mut client).await;
        assert_eq!(close.parse_close().unwrap(), (CloseCode::NORMAL, "done".to_owned()));

        // Peer answers; no second close frame is written
        client
            .write_all(&masked(OpCode::Close, &close.payload, true))
            .await
            .unwrap();
        task.await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            recorder.events(),
            ["open", "text:close me", "close:1000:done:true"]
        );
    }

    #[tokio::test]
    async fn protocol_errors_close_with_code() {
        #[rustfmt::skip]
        let cases: [(Vec<u8>, u16); 5] = [
            (masked(OpCode::Continuation, b"x", true),               1002),
            ([masked(OpCode::Text, b"a", false), masked(OpCode::Binary, b"b", true)].concat(), 1002),
            (masked(OpCode::Text, &[0xff, 0xfe], true),              1007),
            (masked(OpCode::Binary, &[0; 65], true),                 1009),
            (masked(OpCode::Ping, &[0x61; 130], true),               1002),
        ];

        for (bytes, code) in cases {
            let recorder = Recorder::default();
            let (mut client, task) = start(&recorder);

            client.write_all(&bytes).await.unwrap();
            let close = read_frame(&mut client).await;
            assert_eq!(close.opcode, OpCode::Close);
            assert_eq!(close.parse_close().unwrap().0, CloseCode(code));

            task.await.unwrap();
            let events = recorder.events();
            assert_eq!(events[1], format!("error:{code}"));
            assert_eq!(events[2], format!("close:{code}::false"));
            assert!(!events.iter().any(|e| e.starts_with("ping:")), "{events:?}");
        }
    }

    #[tokio::test]
    async fn close_mid_fragment_discards_partial() {
        let recorder = Recorder::default();
        let (mut client, task) = start(&recorder);

        client.write_all(&masked(OpCode::Binary, b"part", false)).await.unwrap();
        client.write_all(&masked(OpCode::Close, &[], true)).await.unwrap();

        let reply = read_frame(&mut client).await;
        assert!(reply.payload.is_empty());

        task.await.unwrap();
        assert_eq!(recorder.events(), ["open", "close:1005::true"]);
    }

    #[tokio::test]
    async fn leftover_bytes_are_processed_first() {
        let recorder = Recorder::default();
        let leftover = masked(OpCode::Binary, b"early", true);
        let (client, task) = start_with(&recorder, Box::new(NoExtension), leftover, limits());

        drop(client);
        task.await.unwrap();
        assert_eq!(recorder.events(), ["open", "binary:5", "close:1006::true"]);
    }

    #[tokio::test]
    async fn idle_timeout() {
        let recorder = Recorder::default();
        let limits = WsLimits {
            idle_timeout: Duration::from_millis(50),
            ..limits()
        };
        let (mut client, task) = start_with(&recorder, Box::new(NoExtension), Vec::new(), limits);

        let close = read_frame(&mut client).await;
        assert_eq!(close.parse_close().unwrap().0, CloseCode::GOING_AWAY);

        task.await.unwrap();
        assert_eq!(recorder.events(), ["open", "error:1001", "close:1001::false"]);
    }

    #[tokio::test]
    async fn compressed_echo() {
        let mut server_ext = PerMessageDeflate::new().threshold(0);
        assert!(matches!(
            server_ext.negotiate(Some("permessage-deflate")),
            Negotiation::Accept(Some(_))
        ));
        let mut client_ext = PerMessageDeflate::new().threshold(0);
        client_ext.negotiate(Some("permessage-deflate"));

        let recorder = Recorder::default();
        let (mut client, task) =
            start_with(&recorder, Box::new(server_ext), Vec::new(), limits());

        let mut frame = Frame::new(OpCode::Text, b"squeeze squeeze squeeze".to_vec(), true);
        client_ext.encode(&mut frame).unwrap();
        assert!(frame.rsv1);
        frame.mask = Some([1, 2, 3, 4]);
        let mut bytes = Vec::new();
        frame.encode(&mut bytes);
        client.write_all(&bytes).await.unwrap();

        let mut echo = read_frame(&mut client).await;
        assert!(echo.rsv1);
        client_ext.decode(&mut echo).unwrap();
        assert_eq!(echo.payload, b"squeeze squeeze squeeze");

        drop(client);
        task.await.unwrap();
        assert_eq!(recorder.events()[1], "text:squeeze squeeze squeeze");
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (client, server) = tokio::io::duplex(256);
        let (_reader, writer) = tokio::io::split(server);
        let ws = WebSocket::new(
            Box::new(writer),
            Box::new(NoExtension),
            Some("chat".into()),
            Duration::from_secs(1),
        );

        assert_eq!(ws.protocol(), Some("chat"));
        ws.close(CloseCode::NORMAL, "").await.unwrap();
        assert!(ws.is_closed());
        assert!(matches!(ws.send_text("late").await, Err(WsError::Closed)));
        assert!(ws.close(CloseCode::NORMAL, "again").await.is_ok());
        assert!(matches!(ws.ping(vec![0; 126]).await, Err(WsError::Protocol(_))));
        drop(client);
    }
}

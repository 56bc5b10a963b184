use maker_ws::{
    limits::ServerLimits, Body, BoxError, Dispatcher, HeaderSet, Method, RequestSignature,
    Response, Server, ServerError, StatusCode, WebSocket, WebSocketHandler, WebSocketUpgrade,
};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};

struct Echo;

impl WebSocketHandler for Echo {
    async fn on_text(&self, ws: &WebSocket, text: String) {
        let _ = ws.send_text(text).await;
    }
}

struct App;

impl Dispatcher<Echo> for App {
    fn can_process(&self, method: Method, path: &str) -> bool {
        matches!(
            (method, path),
            (Method::Get, "/hello") | (Method::Post, "/echo") | (Method::Get, "/ws")
        )
    }

    async fn handle(
        &self,
        sig: &RequestSignature,
        _: &HeaderSet,
        body: &mut Body<'_>,
    ) -> Result<Response, BoxError> {
        match sig.path() {
            "/echo" => Ok(Response::new(StatusCode::Ok).body(body.text().await?.to_owned())),
            _ => Ok(Response::new(StatusCode::Ok).body("hello")),
        }
    }

    fn upgrade(&self, sig: &RequestSignature, _: &HeaderSet) -> Option<WebSocketUpgrade<Echo>> {
        (sig.path() == "/ws").then(|| WebSocketUpgrade::new(Echo))
    }
}

async fn roundtrip(addr: SocketAddr, request: &[u8]) -> String {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut out = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(out).unwrap()
}

async fn read_head(client: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn masked(first: u8, payload: &[u8]) -> Vec<u8> {
    let key = [0x11, 0x22, 0x33, 0x44];
    let mut frame = vec![first, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}

#[tokio::test]
async fn serves_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Server::builder()
        .listener(listener)
        .dispatcher(App)
        .server_limits(ServerLimits {
            max_connections: 2,
            ..ServerLimits::default()
        })
        .build()
        .unwrap();

    // Only one server per process
    let second = Server::<App, Echo>::builder()
        .listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
        .dispatcher(App)
        .build();
    assert!(matches!(second, Err(ServerError::AlreadyRunning)));

    let task = tokio::spawn(server.launch());

    // Unknown route, answered before headers are read
    let text = roundtrip(addr, b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{text}");

    let text = roundtrip(
        addr,
        b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhowdy",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("\r\n\r\nhowdy"), "{text}");

    let text = roundtrip(
        addr,
        b"POST /echo HTTP/1.1\r\nContent-Length: 99999999\r\n\r\n",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{text}");

    // WebSocket echo
    let mut ws = TcpStream::connect(addr).await.unwrap();
    ws.write_all(
        b"GET /ws HTTP/1.1\r\n\
          Host: x\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\r\n",
    )
    .await
    .unwrap();

    let head = read_head(&mut ws).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    ws.write_all(&masked(0x81, b"ping?")).await.unwrap();
    let mut frame = [0u8; 7];
    ws.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame, b"\x81\x05ping?");

    // The session holds one slot, a keep-alive connection the other
    sleep(Duration::from_millis(100)).await;
    let mut kept = TcpStream::connect(addr).await.unwrap();
    kept.write_all(b"GET /hello HTTP/1.1\r\n\r\n").await.unwrap();
    let head = read_head(&mut kept).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");

    // Nothing written, so the 503 is not reset away by unread bytes
    let text = roundtrip(addr, b"").await;
    assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{text}");

    // Client-initiated close is echoed
    ws.write_all(&masked(0x88, &1000u16.to_be_bytes())).await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), ws.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rest, b"\x88\x02\x03\xe8");

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // Dropping the server frees the slot
    let again = Server::<App, Echo>::builder()
        .listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
        .dispatcher(App)
        .build();
    assert!(again.is_ok());
}

use maker_ws::{
    limits::WsLimits, Body, BoxError, CloseCode, Dispatcher, HeaderSet, Method, PerMessageDeflate,
    RequestSignature, Response, Server, StatusCode, Subprotocols, WebSocket, WebSocketHandler,
    WebSocketUpgrade, WsError,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Echo;

impl WebSocketHandler for Echo {
    async fn on_open(&self, ws: &WebSocket) {
        info!(protocol = ?ws.protocol(), "session opened");
    }

    async fn on_text(&self, ws: &WebSocket, text: String) {
        if text == "bye" {
            let _ = ws.close(CloseCode::NORMAL, "bye").await;
        } else {
            let _ = ws.send_text(text).await;
        }
    }

    async fn on_binary(&self, ws: &WebSocket, data: Vec<u8>) {
        let _ = ws.send_binary(data).await;
    }

    async fn on_close(&self, _: &WebSocket, code: CloseCode, reason: &str, remote: bool) {
        info!(code = code.0, reason, remote, "session closed");
    }

    async fn on_error(&self, _: &WebSocket, error: &WsError) {
        info!(%error, "session failed");
    }
}

struct App;

impl Dispatcher<Echo> for App {
    fn can_process(&self, method: Method, path: &str) -> bool {
        method == Method::Get && path == "/ws"
    }

    async fn handle(
        &self,
        _: &RequestSignature,
        _: &HeaderSet,
        _: &mut Body<'_>,
    ) -> Result<Response, BoxError> {
        Ok(Response::new(StatusCode::UpgradeRequired).body("websocket only"))
    }

    fn upgrade(&self, _: &RequestSignature, _: &HeaderSet) -> Option<WebSocketUpgrade<Echo>> {
        Some(
            WebSocketUpgrade::new(Echo)
                .extension(PerMessageDeflate::default().threshold(64))
                .protocol(Subprotocols(&["echo"])),
        )
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .dispatcher(App)
        .websocket_limits(WsLimits {
            max_message_size: 1024 * 1024,
            ..WsLimits::default()
        })
        .build()
        .unwrap()
        .launch()
        .await;
}

//! maker_ws - HTTP/1.1 server with WebSocket upgrade for raw Tokio sockets
//!
//! A server that owns the whole request path: request line, headers and
//! body are read in separately timed stages, routing is decided before a
//! single header byte is parsed, and idle keep-alive connections cost no
//! task while they wait.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, chunked request bodies, `HEAD`
//! - **HTTP/1.0**: answered in kind, closed after the response
//! - **WebSocket** ([RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455)):
//!   upgrade from any route, fragmentation, control frames, close handshake
//! - **permessage-deflate** ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)):
//!   negotiated per connection through [`PerMessageDeflate`]
//!
//! # Request pipeline
//!
//! 1. The request line is read under `signature_timeout` and handed to
//!    [`Dispatcher::can_process`]. Unknown routes get `404` without reading
//!    the headers.
//! 2. Headers are read under `header_timeout`. An oversized `Content-Length`
//!    is answered with `413` here.
//! 3. [`Dispatcher::upgrade`] may turn the request into a WebSocket session.
//! 4. [`Dispatcher::handle`] runs under `dispatch_timeout` with a lazy
//!    [`Body`].
//!
//! See [`limits`] for every knob.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use maker_ws::{Body, BoxError, Dispatcher, HeaderSet, Method, RequestSignature, Response, Server, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct Hello;
//!
//! impl Dispatcher for Hello {
//!     fn can_process(&self, method: Method, path: &str) -> bool {
//!         method == Method::Get && path == "/"
//!     }
//!
//!     async fn handle(
//!         &self,
//!         _: &RequestSignature,
//!         _: &HeaderSet,
//!         _: &mut Body<'_>,
//!     ) -> Result<Response, BoxError> {
//!         Ok(Response::new(StatusCode::Ok).body("Hello World!"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .dispatcher(Hello)
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```
//! WebSocket echo with compression:
//! ```no_run
//! use maker_ws::{
//!     Body, BoxError, Dispatcher, HeaderSet, Method, PerMessageDeflate, RequestSignature,
//!     Response, Server, StatusCode, WebSocket, WebSocketHandler, WebSocketUpgrade,
//! };
//! use tokio::net::TcpListener;
//!
//! struct Echo;
//!
//! impl WebSocketHandler for Echo {
//!     async fn on_text(&self, ws: &WebSocket, text: String) {
//!         let _ = ws.send_text(&text).await;
//!     }
//! }
//!
//! struct App;
//!
//! impl Dispatcher<Echo> for App {
//!     fn can_process(&self, method: Method, path: &str) -> bool {
//!         method == Method::Get && path == "/ws"
//!     }
//!
//!     async fn handle(
//!         &self,
//!         _: &RequestSignature,
//!         _: &HeaderSet,
//!         _: &mut Body<'_>,
//!     ) -> Result<Response, BoxError> {
//!         Ok(Response::new(StatusCode::UpgradeRequired))
//!     }
//!
//!     fn upgrade(&self, _: &RequestSignature, _: &HeaderSet) -> Option<WebSocketUpgrade<Echo>> {
//!         Some(WebSocketUpgrade::new(Echo).extension(PerMessageDeflate::default()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .dispatcher(App)
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod body;
    pub(crate) mod cookie;
    pub(crate) mod headers;
    pub mod query;
    pub(crate) mod response;
    pub(crate) mod signature;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod cycler;
    pub(crate) mod dispatch;
    pub(crate) mod inbox;
    #[allow(clippy::module_inception)]
    pub(crate) mod server;
}
pub(crate) mod ws {
    pub(crate) mod deflate;
    pub(crate) mod extension;
    pub(crate) mod frame;
    pub(crate) mod handshake;
    pub(crate) mod session;
}
pub(crate) mod errors;
pub mod limits;
pub(crate) mod wire;

pub use crate::{
    errors::{CloseCode, ServerError, WsError},
    http::{
        body::{Body, BodyError},
        cookie::{Cookie, SameSite},
        headers::{HeaderSet, Iter as HeaderIter},
        query,
        response::{
            write::{BodyWriter, WriteBuffer},
            BodySink, Response,
        },
        signature::RequestSignature,
        types::{Method, StatusCode, Version},
    },
    server::{
        dispatch::{BoxError, Dispatcher},
        server::{Server, ServerBuilder},
    },
    wire::OpCode,
    ws::{
        deflate::PerMessageDeflate,
        extension::{Extension, Negotiation, NoExtension, Protocol, Subprotocols},
        frame::Frame,
        handshake::WebSocketUpgrade,
        session::{WebSocket, WebSocketHandler},
    },
};

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_dispatcher {
    ($name:ident) => {
        use maker_ws::{
            Body, BoxError, Dispatcher, HeaderSet, Method, RequestSignature, Response, StatusCode,
        };
        struct $name;

        impl Dispatcher for $name {
            fn can_process(&self, _: Method, _: &str) -> bool {
                true
            }

            async fn handle(
                &self,
                _: &RequestSignature,
                _: &HeaderSet,
                _: &mut Body<'_>,
            ) -> Result<Response, BoxError> {
                Ok(Response::new(StatusCode::Ok).body("Hello world!"))
            }
        }
    };
}

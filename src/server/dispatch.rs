use crate::{
    http::{
        body::Body,
        headers::HeaderSet,
        response::Response,
        signature::RequestSignature,
        types::{Method, StatusCode},
    },
    ws::{handshake::WebSocketUpgrade, session::WebSocketHandler},
};
use std::{error::Error, future::Future, sync::Arc};

/// Error type a [`Dispatcher`] may return from
/// [`handle`](Dispatcher::handle).
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Turns a dispatcher error into the response sent to the client.
pub(crate) type ErrorHandler = Arc<dyn Fn(&BoxError) -> Response + Send + Sync>;

/// `500 Internal Server Error` with the error message as a plain-text body.
pub(crate) fn default_error_handler() -> ErrorHandler {
    Arc::new(|error: &BoxError| {
        Response::new(StatusCode::InternalServerError)
            .header("content-type", "text/plain; charset=utf-8")
            .body(error.to_string())
    })
}

/// Routes requests of the server.
///
/// The connection asks [`can_process`](Self::can_process) as soon as the
/// request line is read, before a single header byte: a `false` answers
/// `404` (or `204` to an `OPTIONS` request for a [known path](Self::has_path))
/// and closes the socket. Only accepted requests reach
/// [`upgrade`](Self::upgrade) and [`handle`](Self::handle).
///
/// `W` is the [`WebSocketHandler`] of upgraded sessions; dispatchers without
/// WebSocket routes keep the default `()`.
///
/// # Examples
///
/// ```
/// use maker_ws::{
///     Body, BoxError, Dispatcher, HeaderSet, Method, RequestSignature, Response, StatusCode,
/// };
///
/// struct Api;
///
/// impl Dispatcher for Api {
///     fn can_process(&self, method: Method, path: &str) -> bool {
///         matches!((method, path), (Method::Get, "/health") | (Method::Post, "/echo"))
///     }
///
///     async fn handle(
///         &self,
///         sig: &RequestSignature,
///         _: &HeaderSet,
///         body: &mut Body<'_>,
///     ) -> Result<Response, BoxError> {
///         match sig.path() {
///             "/echo" => Ok(Response::new(StatusCode::Ok).body(body.text().await?.to_owned())),
///             _ => Ok(Response::new(StatusCode::Ok).body("ok")),
///         }
///     }
/// }
/// ```
/// With a WebSocket route:
/// ```
/// use maker_ws::{
///     Body, BoxError, Dispatcher, HeaderSet, Method, RequestSignature, Response, StatusCode,
///     WebSocket, WebSocketHandler, WebSocketUpgrade,
/// };
///
/// struct Echo;
///
/// impl WebSocketHandler for Echo {
///     async fn on_binary(&self, ws: &WebSocket, data: Vec<u8>) {
///         let _ = ws.send_binary(data).await;
///     }
/// }
///
/// struct App;
///
/// impl Dispatcher<Echo> for App {
///     fn can_process(&self, method: Method, path: &str) -> bool {
///         method == Method::Get && path == "/ws"
///     }
///
///     async fn handle(
///         &self,
///         _: &RequestSignature,
///         _: &HeaderSet,
///         _: &mut Body<'_>,
///     ) -> Result<Response, BoxError> {
///         Ok(Response::new(StatusCode::UpgradeRequired))
///     }
///
///     fn upgrade(&self, _: &RequestSignature, _: &HeaderSet) -> Option<WebSocketUpgrade<Echo>> {
///         Some(WebSocketUpgrade::new(Echo))
///     }
/// }
/// ```
pub trait Dispatcher<W = ()>
where
    Self: Sync + Send + 'static,
    W: WebSocketHandler,
{
    /// Whether a route exists for this method and percent-decoded path.
    fn can_process(&self, method: Method, path: &str) -> bool;

    /// Whether any method is routed for `path`. Only consulted for `OPTIONS`
    /// requests that [`can_process`](Self::can_process) declined.
    fn has_path(&self, _path: &str) -> bool {
        false
    }

    /// Produces the response to an accepted request.
    ///
    /// The body is read lazily through `body`; a body left unread closes the
    /// connection after the response. Errors go through the server's error
    /// handler.
    fn handle(
        &self,
        signature: &RequestSignature,
        headers: &HeaderSet,
        body: &mut Body<'_>,
    ) -> impl Future<Output = Result<Response, BoxError>> + Send;

    /// Accepts a WebSocket upgrade request. `None` treats the request as an
    /// ordinary one and passes it to [`handle`](Self::handle).
    fn upgrade(
        &self,
        _signature: &RequestSignature,
        _headers: &HeaderSet,
    ) -> Option<WebSocketUpgrade<W>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http::response::WriteContext, tools::str_op, Version};
    use std::time::{Duration, SystemTime};

    #[test]
    fn default_handler_reports_500() {
        let error: BoxError = "database unreachable".into();
        let response = default_error_handler()(&error);
        assert_eq!(response.status(), StatusCode::InternalServerError);

        let ctx = WriteContext {
            version: Version::Http11,
            keep_alive: true,
            head_only: false,
            timeout: Duration::from_secs(1),
        };
        let mut out = Vec::new();
        response.write_head(&ctx, SystemTime::now(), &mut out);
        assert!(str_op(&out).contains("content-length: 20\r\n"));
    }
}

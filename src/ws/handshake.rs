//! Opening handshake
//!
//! [[RFC6455, Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2)]

use crate::{
    errors::ErrorKind,
    http::{
        headers::HeaderSet,
        response::Response,
        signature::RequestSignature,
        types::{Method, StatusCode, Version},
    },
    wire::WS_GUID,
    ws::{
        extension::{Extension, Negotiation, NoExtension, Protocol},
        session::WebSocketHandler,
    },
};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};

/// Accepts an upgrade request, returned from
/// [`Dispatcher::upgrade`](crate::Dispatcher::upgrade).
///
/// Carries the handler that will drive the session and the extension and
/// subprotocol policies used during the handshake.
///
/// # Examples
/// ```
/// use maker_ws::{PerMessageDeflate, Subprotocols, WebSocket, WebSocketHandler, WebSocketUpgrade};
///
/// struct Echo;
///
/// impl WebSocketHandler for Echo {
///     async fn on_text(&self, ws: &WebSocket, text: String) {
///         let _ = ws.send_text(text).await;
///     }
/// }
///
/// let upgrade = WebSocketUpgrade::new(Echo)
///     .extension(PerMessageDeflate::new())
///     .protocol(Subprotocols(&["echo"]));
/// ```
pub struct WebSocketUpgrade<W> {
    pub(crate) handler: W,
    pub(crate) extension: Box<dyn Extension>,
    pub(crate) protocol: Box<dyn Protocol>,
}

impl<W: WebSocketHandler> WebSocketUpgrade<W> {
    /// Upgrade without extensions or subprotocols.
    pub fn new(handler: W) -> Self {
        Self {
            handler,
            extension: Box::new(NoExtension),
            protocol: Box::new(()),
        }
    }

    /// Extension negotiated against `Sec-WebSocket-Extensions`.
    pub fn extension<E: Extension>(mut self, extension: E) -> Self {
        self.extension = Box::new(extension);
        self
    }

    /// Policy for `Sec-WebSocket-Protocol`.
    pub fn protocol<P: Protocol>(mut self, protocol: P) -> Self {
        self.protocol = Box::new(protocol);
        self
    }
}

impl<W> std::fmt::Debug for WebSocketUpgrade<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketUpgrade").finish_non_exhaustive()
    }
}

/// `true` when the request asks to switch to WebSocket.
#[inline]
pub(crate) fn is_upgrade_request(headers: &HeaderSet) -> bool {
    headers.has_token("upgrade", "websocket") && headers.has_token("connection", "upgrade")
}

/// `base64(SHA1(key + GUID))`
pub(crate) fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID);
    STANDARD.encode(hasher.finalize())
}

/// Successful handshake: the `101` response and the selected subprotocol.
#[derive(Debug)]
pub(crate) struct Accepted {
    pub(crate) response: Response,
    pub(crate) protocol: Option<String>,
}

impl<W> WebSocketUpgrade<W> {
    /// Validates the request and runs extension and protocol negotiation.
    pub(crate) fn accept(
        &mut self,
        signature: &RequestSignature,
        headers: &HeaderSet,
    ) -> Result<Accepted, ErrorKind> {
        if signature.method() != Method::Get {
            return Err(ErrorKind::HandshakeFailed("upgrade requires GET"));
        }
        if signature.version() != Version::Http11 {
            return Err(ErrorKind::HandshakeFailed("upgrade requires HTTP/1.1"));
        }
        if headers.get("sec-websocket-version") != Some("13") {
            return Err(ErrorKind::HandshakeFailed("unsupported websocket version"));
        }

        let key = headers
            .get("sec-websocket-key")
            .ok_or(ErrorKind::HandshakeFailed("missing websocket key"))?;
        if !STANDARD.decode(key).is_ok_and(|nonce| nonce.len() == 16) {
            return Err(ErrorKind::HandshakeFailed("invalid websocket key"));
        }

        let Negotiation::Accept(extension) =
            self.extension.negotiate(headers.get("sec-websocket-extensions"))
        else {
            return Err(ErrorKind::HandshakeFailed("extension rejected"));
        };
        let Negotiation::Accept(protocol) =
            self.protocol.negotiate(headers.get("sec-websocket-protocol"))
        else {
            return Err(ErrorKind::HandshakeFailed("subprotocol rejected"));
        };

        let mut response = Response::new(StatusCode::SwitchingProtocols)
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .header("sec-websocket-accept", accept_key(key));

        if let Some(value) = &extension {
            response = response.header("sec-websocket-extensions", value.as_str());
        }
        if let Some(value) = &protocol {
            response = response.header("sec-websocket-protocol", value.as_str());
        }

        Ok(Accepted { response, protocol })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::signature::{SignatureReader, Status},
        http::response::WriteContext,
        limits::ReqLimits,
        tools::str_op,
        ws::{deflate::PerMessageDeflate, extension::Subprotocols},
    };
    use std::time::{Duration, SystemTime};

    fn signature(line: &str) -> RequestSignature {
        let mut reader = SignatureReader::new(&ReqLimits::default());
        assert!(matches!(reader.feed(line.as_bytes()), Ok(Status::Complete(_))));
        reader.finish().unwrap()
    }

    fn upgrade_headers(extra: &str) -> HeaderSet {
        HeaderSet::from_block(&format!(
            "Host: server.example.com\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n{extra}\r\n"
        ))
    }

    fn head(response: &Response) -> String {
        let ctx = WriteContext {
            version: Version::Http11,
            keep_alive: true,
            head_only: false,
            timeout: Duration::from_secs(1),
        };

        let mut out = Vec::new();
        response.write_head(&ctx, SystemTime::now(), &mut out);
        str_op(&out).to_owned()
    }

    #[test]
    fn rfc_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn detects_upgrade() {
        assert!(is_upgrade_request(&upgrade_headers("")));
        assert!(!is_upgrade_request(&HeaderSet::from_block(
            "Upgrade: websocket\r\nConnection: close\r\n\r\n"
        )));
    }

    #[test]
    fn switching_protocols() {
        let mut upgrade = WebSocketUpgrade::new(());
        let accepted = upgrade
            .accept(&signature("GET /chat HTTP/1.1\r\n"), &upgrade_headers(""))
            .unwrap();

        let text = head(&accepted.response);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("\r\nupgrade: websocket\r\n"));
        assert!(text.contains("\r\nconnection: Upgrade\r\n"));
        assert!(text.contains("\r\nsec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!text.contains("sec-websocket-extensions"));
        assert!(!text.contains("content-length"));
        assert_eq!(accepted.protocol, None);
    }

    #[test]
    fn negotiated_headers() {
        let mut upgrade = WebSocketUpgrade::new(())
            .extension(PerMessageDeflate::new())
            .protocol(Subprotocols(&["chat"]));

        let headers = upgrade_headers(
            "Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\
             Sec-WebSocket-Protocol: superchat, chat\r\n",
        );
        let accepted = upgrade
            .accept(&signature("GET /chat HTTP/1.1\r\n"), &headers)
            .unwrap();

        let text = head(&accepted.response);
        assert!(text.contains("\r\nsec-websocket-extensions: permessage-deflate\r\n"));
        assert!(text.contains("\r\nsec-websocket-protocol: chat\r\n"));
        assert_eq!(accepted.protocol.as_deref(), Some("chat"));
    }

    #[test]
    fn failures() {
        #[rustfmt::skip]
        let cases = [
            ("POST /chat HTTP/1.1\r\n", "",                                   "upgrade requires GET"),
            ("GET /chat HTTP/1.0\r\n",  "",                                   "upgrade requires HTTP/1.1"),
            ("GET /chat HTTP/1.1\r\n",  "Sec-WebSocket-Version: 8\r\n",       "unsupported websocket version"),
            ("GET /chat HTTP/1.1\r\n",  "Sec-WebSocket-Key: c2hvcnQ=\r\n",    "invalid websocket key"),
            ("GET /chat HTTP/1.1\r\n",  "Sec-WebSocket-Protocol: mqtt\r\n",   "subprotocol rejected"),
        ];

        for (line, extra, reason) in cases {
            let mut upgrade = WebSocketUpgrade::new(()).protocol(Subprotocols(&["chat"]));
            assert_eq!(
                upgrade.accept(&signature(line), &upgrade_headers(extra)).unwrap_err(),
                ErrorKind::HandshakeFailed(reason),
                "{line:?} {extra:?}"
            );
        }

        let no_key = HeaderSet::from_block(
            "Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );
        assert_eq!(
            WebSocketUpgrade::new(())
                .accept(&signature("GET / HTTP/1.1\r\n"), &no_key)
                .unwrap_err(),
            ErrorKind::HandshakeFailed("missing websocket key")
        );
    }
}

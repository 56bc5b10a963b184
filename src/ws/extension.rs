//! Pluggable WebSocket extension and subprotocol negotiation.

use crate::{errors::WsError, ws::frame::Frame};

/// Result of negotiating an offer from the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Accepted. The value, if any, is echoed in the 101 response.
    Accept(Option<String>),
    /// Refused. The upgrade is aborted.
    Reject,
}

/// Payload transformation negotiated through `Sec-WebSocket-Extensions`.
///
/// A fresh instance is used for every session, so implementations may keep
/// per-session state such as compression contexts.
///
/// # Examples
/// An extension that accepts nothing but plain frames and records traffic:
/// ```
/// use maker_ws::{Extension, Frame, Negotiation, WsError};
///
/// #[derive(Default)]
/// struct Counting {
///     frames_in: usize,
/// }
///
/// impl Extension for Counting {
///     fn negotiate(&mut self, _offer: Option<&str>) -> Negotiation {
///         Negotiation::Accept(None)
///     }
///
///     fn decode(&mut self, frame: &mut Frame) -> Result<(), WsError> {
///         self.frames_in += 1;
///         match frame.rsv1 || frame.rsv2 || frame.rsv3 {
///             true => Err(WsError::Protocol("reserved bits set")),
///             false => Ok(()),
///         }
///     }
///
///     fn encode(&mut self, _frame: &mut Frame) -> Result<(), WsError> {
///         Ok(())
///     }
/// }
/// ```
pub trait Extension: Send + 'static {
    /// Receives the raw `Sec-WebSocket-Extensions` header value, if present.
    fn negotiate(&mut self, offer: Option<&str>) -> Negotiation;

    /// Runs on every received frame before it is dispatched. Must clear or
    /// reject the RSV bits it owns.
    fn decode(&mut self, frame: &mut Frame) -> Result<(), WsError>;

    /// Runs on every frame before it is written.
    fn encode(&mut self, frame: &mut Frame) -> Result<(), WsError>;
}

/// The default extension: a pass-through that requires all RSV bits clear.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExtension;

impl Extension for NoExtension {
    #[inline]
    fn negotiate(&mut self, _: Option<&str>) -> Negotiation {
        Negotiation::Accept(None)
    }

    #[inline]
    fn decode(&mut self, frame: &mut Frame) -> Result<(), WsError> {
        match frame.has_rsv() {
            true => Err(WsError::Protocol("reserved bits set without an extension")),
            false => Ok(()),
        }
    }

    #[inline]
    fn encode(&mut self, _: &mut Frame) -> Result<(), WsError> {
        Ok(())
    }
}

/// Subprotocol selection through `Sec-WebSocket-Protocol`.
pub trait Protocol: Send + Sync + 'static {
    /// Receives the raw `Sec-WebSocket-Protocol` header value, if present.
    fn negotiate(&self, offer: Option<&str>) -> Negotiation;
}

/// No subprotocol: any offer is accepted and nothing is echoed.
impl Protocol for () {
    #[inline]
    fn negotiate(&self, _: Option<&str>) -> Negotiation {
        Negotiation::Accept(None)
    }
}

/// Selects the first offered subprotocol found in a list of supported names.
///
/// Rejects the upgrade when an offer is present but nothing matches; a
/// request without the header is accepted with no protocol.
///
/// # Examples
/// ```
/// use maker_ws::{Negotiation, Protocol, Subprotocols};
///
/// let protocols = Subprotocols(&["chat.v2", "chat.v1"]);
///
/// assert_eq!(
///     protocols.negotiate(Some("chat.v1, chat.v2")),
///     Negotiation::Accept(Some("chat.v1".to_owned()))
/// );
/// assert_eq!(protocols.negotiate(Some("mqtt")), Negotiation::Reject);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Subprotocols(pub &'static [&'static str]);

impl Protocol for Subprotocols {
    fn negotiate(&self, offer: Option<&str>) -> Negotiation {
        let Some(offer) = offer else {
            return Negotiation::Accept(None);
        };

        offer
            .split(',')
            .map(str::trim)
            .find(|name| self.0.iter().any(|known| known == name))
            .map_or(Negotiation::Reject, |name| {
                Negotiation::Accept(Some(name.to_owned()))
            })
    }
}

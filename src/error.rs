//! Network error taxonomy.

use thiserror::Error;

/// Errors surfaced by the connection stack.
///
/// Terminal codes ([`ServiceStopped`], [`ChannelStopped`]) short-circuit
/// per-channel state machines; the rest are recoverable at some level of
/// the session hierarchy.
///
/// [`ServiceStopped`]: Error::ServiceStopped
/// [`ChannelStopped`]: Error::ChannelStopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// The enclosing service is shutting down.
    #[error("service stopped")]
    ServiceStopped,
    /// This channel is stopping but the service continues.
    #[error("channel stopped")]
    ChannelStopped,
    /// A timer fired (inactivity, expiration, handshake or ping).
    #[error("channel timed out")]
    ChannelTimeout,
    /// DNS resolution failed.
    #[error("resolving hostname failed")]
    ResolveFailed,
    /// A duplicate authority (or own nonce) is already connected.
    #[error("address already in use")]
    AddressInUse,
    /// The address is on the configured blacklist.
    #[error("address blocked")]
    AddressBlocked,
    /// Framing, decode or nonce failure on the wire.
    #[error("bad stream")]
    BadStream,
    /// The inbound connection limit was exceeded.
    #[error("oversubscribed")]
    Oversubscribed,
    /// Seeding produced an insufficient address count.
    #[error("peer throttling")]
    PeerThrottling,
    /// Start on a non-stopped service, or invalid configuration.
    #[error("operation failed")]
    OperationFailed,
    /// The host pool is empty.
    #[error("address not found")]
    NotFound,
}

impl Error {
    /// Terminal codes abort protocol handlers outright.
    pub fn is_terminal(self) -> bool {
        matches!(self, Error::ServiceStopped | Error::ChannelStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_codes() {
        assert!(Error::ServiceStopped.is_terminal());
        assert!(Error::ChannelStopped.is_terminal());
        assert!(!Error::ChannelTimeout.is_terminal());
        assert!(!Error::BadStream.is_terminal());
    }
}

//! Per-channel protocol state machines.
//!
//! Each protocol runs as a task over the channel's typed subscriptions
//! and ends when its job is done or the channel stops. Variants attach
//! by negotiated version threshold; see the session layer.

mod address;
mod ping;
mod reject;
mod seed;
mod version;

pub(crate) use address::AddressProtocol;
pub(crate) use ping::PingProtocol;
pub(crate) use reject::RejectProtocol;
pub(crate) use seed::SeedProtocol;
pub(crate) use version::VersionProtocol;

use std::sync::Arc;

use crate::channel::Channel;

/// Common protocol surface, for uniform logging.
pub(crate) trait Protocol {
    const NAME: &'static str;

    fn channel(&self) -> &Arc<Channel>;

    fn log_attach(&self) {
        tracing::trace!(
            protocol = Self::NAME,
            authority = %self.channel().authority(),
            "protocol attached"
        );
    }
}

//! Connection-generation strategies and the shared registration
//! pipeline.

mod inbound;
mod manual;
mod outbound;
mod seed;

pub(crate) use inbound::InboundSession;
pub(crate) use manual::ManualSession;
pub(crate) use outbound::OutboundSession;
pub(crate) use seed::SeedSession;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::channel::Channel;
use crate::connector::Connector;
use crate::error::Error;
use crate::p2p::NetContext;
use crate::protocols::{AddressProtocol, PingProtocol, RejectProtocol, VersionProtocol};
use crate::transport::Transport;
use crate::types::{Authority, Link, LEVEL_BIP31, LEVEL_BIP61};

/// Which strategy is registering; selects the handshake profile and the
/// adoption checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Seed,
    Manual,
    Inbound,
    Outbound,
}

/// Common session machinery: channel construction, the registration
/// pipeline and the connect-cycle backoff policy.
pub(crate) struct Session<T: Transport> {
    pub ctx: Arc<NetContext>,
    pub transport: Arc<T>,
    pub notify_on_connect: bool,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            transport: Arc::clone(&self.transport),
            notify_on_connect: self.notify_on_connect,
        }
    }
}

impl<T: Transport> Session<T> {
    pub fn new(ctx: Arc<NetContext>, transport: Arc<T>, notify_on_connect: bool) -> Self {
        Self {
            ctx,
            transport,
            notify_on_connect,
        }
    }

    pub fn stopped(&self) -> bool {
        self.ctx.stop.is_stopped()
    }

    pub fn blacklisted(&self, authority: &Authority) -> bool {
        self.ctx.config.blacklisted(authority)
    }

    pub fn create_channel<S>(&self, stream: S, authority: Authority, link: Link) -> Arc<Channel>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Channel::new(
            stream,
            authority,
            link,
            Arc::clone(&self.ctx.codec),
            &self.ctx.config,
            &self.ctx.fork_rng(),
        )
    }

    /// One pended, blacklist-checked dial.
    pub async fn connect_one(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(T::Stream, Authority), Error> {
        let connector = Connector::new(self.ctx.config.connect_timeout);
        self.ctx.pend_connector(&connector)?;
        let result = connector
            .connect(self.transport.as_ref(), host, port)
            .await;
        self.ctx.unpend_connector(&connector);

        let (stream, authority) = result?;
        if self.blacklisted(&authority) {
            debug!(%authority, "connected a blacklisted address");
            return Err(Error::AddressBlocked);
        }
        Ok((stream, authority))
    }

    /// The registration pipeline: nonce + notify, proxy start, version
    /// handshake, adoption. Any failure stops the channel with the
    /// failing code.
    pub async fn register_channel(
        &self,
        channel: &Arc<Channel>,
        role: Role,
    ) -> Result<(), Error> {
        if self.stopped() {
            channel.stop(Error::ServiceStopped);
            return Err(Error::ServiceStopped);
        }

        channel.set_notify(self.notify_on_connect);
        channel.set_nonce(self.ctx.random_nonce());

        match self.start_channel(channel, role).await {
            Ok(()) => {
                // Channel stop strictly precedes its removal from the
                // adopted set.
                let ctx = Arc::clone(&self.ctx);
                let watched = Arc::clone(channel);
                tokio::spawn(async move {
                    let reason = watched.stopped().await;
                    ctx.remove_channel(&watched);
                    debug!(authority = %watched.authority(), %reason, "channel removed");
                });
                Ok(())
            }
            Err(reason) => {
                channel.stop(reason);
                Err(reason)
            }
        }
    }

    async fn start_channel(&self, channel: &Arc<Channel>, role: Role) -> Result<(), Error> {
        // Outbound nonces are pended so an inbound echo of one
        // identifies a connection to self.
        let pended = role == Role::Outbound;
        if pended {
            self.ctx.pend_handshake(channel)?;
        }

        let result = self.handshake(channel, role).await;

        if pended {
            self.ctx.unpend_handshake(channel);
        }
        result
    }

    async fn handshake(&self, channel: &Arc<Channel>, role: Role) -> Result<(), Error> {
        // Subscribe the handshake before the read loop starts so the
        // peer's version cannot slip past it.
        let handshake = match role {
            Role::Seed => VersionProtocol::for_seeding(Arc::clone(&self.ctx), Arc::clone(channel)),
            Role::Outbound => {
                VersionProtocol::for_outbound(Arc::clone(&self.ctx), Arc::clone(channel))
            }
            _ => VersionProtocol::new(Arc::clone(&self.ctx), Arc::clone(channel)),
        };

        channel.start()?;

        if let Err(reason) = handshake.run().await {
            debug!(authority = %channel.authority(), %reason, "handshake failed");
            return Err(reason);
        }

        self.handshake_complete(channel, role)
    }

    fn handshake_complete(&self, channel: &Arc<Channel>, role: Role) -> Result<(), Error> {
        if role == Role::Inbound {
            if self.ctx.connection_count() >= self.ctx.config.inbound_connections {
                return Err(Error::Oversubscribed);
            }

            // A peer echoing one of our pending handshake nonces is us.
            let peer_nonce = channel
                .peer_version()
                .map(|version| version.nonce)
                .unwrap_or_default();
            if self.ctx.pending_nonce(peer_nonce) {
                debug!(authority = %channel.authority(), "connection to self detected");
                return Err(Error::AddressInUse);
            }
        }

        self.ctx.store_channel(channel)
    }

    /// Attach the steady-state protocols by negotiated version.
    pub fn attach_protocols(&self, channel: &Arc<Channel>) {
        let version = channel.negotiated_version();

        let ping = PingProtocol::new(
            Arc::clone(&self.ctx),
            Arc::clone(channel),
            version >= LEVEL_BIP31,
        );
        tokio::spawn(ping.run());

        if version >= LEVEL_BIP61 {
            tokio::spawn(RejectProtocol::new(Arc::clone(channel)).run());
        }

        tokio::spawn(AddressProtocol::new(Arc::clone(&self.ctx), Arc::clone(channel)).run());
    }

    /// Delay before the next connect attempt after a failure.
    pub fn cycle_delay(&self, reason: Error) -> Duration {
        match reason {
            // The dial itself already consumed the connect window.
            Error::ChannelTimeout | Error::ResolveFailed => Duration::ZERO,
            _ => self.ctx.config.connect_cycle_delay,
        }
    }
}

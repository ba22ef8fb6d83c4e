//! Version handshake (31402 base, 70002 adds reject handling).

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, error};

use crate::channel::Channel;
use crate::error::Error;
use crate::message::{Message, RejectCode, RejectPayload, VersionPayload};
use crate::p2p::NetContext;
use crate::protocols::Protocol;
use crate::subscriber::Subscription;
use crate::sync::Join;
use crate::types::{unix_time, LEVEL_BIP61, NODE_NONE};

const INSUFFICIENT_VERSION: &str = "insufficient-version";
const INSUFFICIENT_SERVICES: &str = "insufficient-services";

/// The version/verack exchange gating channel adoption.
///
/// Completion requires two events, an acceptable peer `version` and a
/// `verack`, collapsed through [`Join::count`]; the whole exchange is
/// bounded by the `channel_handshake` deadline. Constructing the
/// protocol subscribes it, so it must be built before the channel's
/// read loop starts.
pub(crate) struct VersionProtocol {
    channel: Arc<Channel>,
    context: Arc<NetContext>,
    own_version: u32,
    own_services: u64,
    invalid_services: u64,
    minimum_version: u32,
    minimum_services: u64,
    relay: bool,
    /// Reject messages are understood from 70002 up.
    bip61: bool,
    version_rx: Option<Subscription<VersionPayload>>,
    verack_rx: Option<Subscription<()>>,
    reject_rx: Option<Subscription<RejectPayload>>,
}

impl Protocol for VersionProtocol {
    const NAME: &'static str = "version";

    fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl VersionProtocol {
    /// Inbound and manual channels: advertise configured services,
    /// require none of the peer.
    pub fn new(context: Arc<NetContext>, channel: Arc<Channel>) -> Self {
        let services = context.config.services;
        Self::with_profile(context, channel, services, NODE_NONE, true)
    }

    /// Outbound channels additionally require the configured minimum
    /// services of the peer.
    pub fn for_outbound(context: Arc<NetContext>, channel: Arc<Channel>) -> Self {
        let services = context.config.services;
        let minimum = context.config.minimum_services;
        Self::with_profile(context, channel, services, minimum, true)
    }

    /// Seed channels require nothing of the peer and advertise nothing.
    pub fn for_seeding(context: Arc<NetContext>, channel: Arc<Channel>) -> Self {
        Self::with_profile(context, channel, NODE_NONE, NODE_NONE, false)
    }

    fn with_profile(
        context: Arc<NetContext>,
        channel: Arc<Channel>,
        own_services: u64,
        minimum_services: u64,
        relay_configured: bool,
    ) -> Self {
        let config = &context.config;
        let bip61 = channel.negotiated_version() >= LEVEL_BIP61;

        let version_rx = Some(channel.topics().version.subscribe());
        let verack_rx = Some(channel.topics().verack.subscribe());
        let reject_rx = bip61.then(|| channel.topics().reject.subscribe());

        Self {
            own_version: config.protocol_maximum,
            own_services,
            invalid_services: config.invalid_services,
            minimum_version: config.protocol_minimum,
            minimum_services,
            relay: bip61 && relay_configured && config.relay_transactions,
            bip61,
            version_rx,
            verack_rx,
            reject_rx,
            channel,
            context,
        }
    }

    /// Run the handshake to completion or failure. The caller stops the
    /// channel on any error.
    pub async fn run(mut self) -> Result<(), Error> {
        self.log_attach();
        let mut version_rx = self.version_rx.take().expect("handshake run twice");
        let mut verack_rx = self.verack_rx.take().expect("handshake run twice");
        let mut reject_rx = self.reject_rx.take();

        let join = Join::count(2);
        self.channel
            .send(Message::Version(self.version_factory()))
            .await?;

        let deadline = sleep(self.context.config.channel_handshake);
        tokio::pin!(deadline);

        let mut got_version = false;
        let mut got_verack = false;

        loop {
            if let Some(result) = join.try_result() {
                return result;
            }

            tokio::select! {
                _ = &mut deadline => return Err(Error::ChannelTimeout),
                reason = self.channel.stopped() => return Err(reason),
                version = version_rx.recv() => {
                    let version = version?;
                    if got_version {
                        debug!(
                            authority = %self.channel.authority(),
                            "duplicate version message ignored"
                        );
                        continue;
                    }
                    got_version = true;
                    match self.handle_version(version).await {
                        Ok(()) => join.success(),
                        Err(reason) => join.failure(reason),
                    }
                }
                verack = verack_rx.recv() => {
                    verack?;
                    if got_verack {
                        continue;
                    }
                    got_verack = true;
                    join.success();
                }
                reject = next_reject(&mut reject_rx) => {
                    let reject = reject?;
                    if let Some(reason) = self.handle_reject(reject) {
                        join.failure(reason);
                    }
                }
            }
        }
    }

    fn version_factory(&self) -> VersionPayload {
        let config = &self.context.config;
        let top = self.context.top_block();

        VersionPayload {
            value: self.own_version,
            services: self.own_services,
            timestamp: unix_time(),
            // The peer's services cannot be reflected, so zero them.
            receiver: self.channel.authority().to_network_address(NODE_NONE),
            sender: config.self_address.to_network_address(self.own_services),
            nonce: self.channel.nonce(),
            user_agent: config.user_agent.clone(),
            start_height: top.height as u32,
            relay: self.relay,
        }
    }

    async fn handle_version(&self, version: VersionPayload) -> Result<(), Error> {
        debug!(
            authority = %self.channel.authority(),
            value = version.value,
            user_agent = %version.user_agent,
            "peer version"
        );

        if self.context.config.validate().is_err() {
            error!("invalid protocol version configuration");
            return Err(Error::ChannelStopped);
        }

        if !self.sufficient_peer(&version).await {
            return Err(Error::ChannelStopped);
        }

        let negotiated = version.value.min(self.own_version);
        self.channel.set_negotiated_version(negotiated);
        self.channel.set_peer_version(version);

        debug!(
            authority = %self.channel.authority(),
            negotiated,
            "negotiated protocol version"
        );

        self.channel.send(Message::Verack).await?;
        Ok(())
    }

    async fn sufficient_peer(&self, version: &VersionPayload) -> bool {
        if self.bip61 {
            // Tell the peer why before dropping it.
            let reason = if version.value < self.minimum_version {
                Some(INSUFFICIENT_VERSION)
            } else if (version.services & self.minimum_services) != self.minimum_services {
                Some(INSUFFICIENT_SERVICES)
            } else {
                None
            };

            if let Some(reason) = reason {
                let _ = self
                    .channel
                    .send(Message::Reject(RejectPayload {
                        message: Message::VERSION.to_owned(),
                        code: RejectCode::Obsolete,
                        reason: reason.to_owned(),
                    }))
                    .await;
            }
        }

        if (version.services & self.invalid_services) != 0 {
            debug!(
                authority = %self.channel.authority(),
                services = version.services,
                "invalid peer services"
            );
            return false;
        }

        if (version.services & self.minimum_services) != self.minimum_services {
            debug!(
                authority = %self.channel.authority(),
                services = version.services,
                "insufficient peer services"
            );
            return false;
        }

        if version.value < self.minimum_version {
            debug!(
                authority = %self.channel.authority(),
                value = version.value,
                "insufficient peer version"
            );
            return false;
        }

        true
    }

    /// A peer reject of our version fails the handshake; anything else
    /// is left to the reject protocol.
    fn handle_reject(&self, reject: RejectPayload) -> Option<Error> {
        if reject.message != Message::VERSION {
            return None;
        }

        match reject.code {
            RejectCode::Obsolete | RejectCode::Duplicate => {
                debug!(
                    authority = %self.channel.authority(),
                    reason = %reject.reason,
                    "version rejected by peer"
                );
                Some(Error::ChannelStopped)
            }
            _ => None,
        }
    }
}

async fn next_reject(
    subscription: &mut Option<Subscription<RejectPayload>>,
) -> Result<RejectPayload, Error> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

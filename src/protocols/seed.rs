//! Seed-phase address harvest (31402).

use std::sync::Arc;

use tokio::time::sleep;
use tracing::debug;

use crate::channel::Channel;
use crate::error::Error;
use crate::message::Message;
use crate::p2p::NetContext;
use crate::protocols::Protocol;
use crate::subscriber::Subscription;
use crate::types::NetworkAddress;

/// Requests addresses from a seed and completes once at least one
/// non-empty address message has been stored, or the handshake window
/// elapses.
///
/// Constructing the protocol subscribes it; spawn `run` promptly.
pub(crate) struct SeedProtocol {
    channel: Arc<Channel>,
    context: Arc<NetContext>,
    address_rx: Option<Subscription<Vec<NetworkAddress>>>,
}

impl Protocol for SeedProtocol {
    const NAME: &'static str = "seed";

    fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl SeedProtocol {
    pub fn new(context: Arc<NetContext>, channel: Arc<Channel>) -> Self {
        let address_rx = Some(channel.topics().address.subscribe());
        Self {
            channel,
            context,
            address_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        self.log_attach();
        let mut address_rx = self.address_rx.take().expect("seed protocol run twice");

        self.channel.send(Message::GetAddress).await?;

        let deadline = sleep(self.context.config.channel_handshake);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(Error::ChannelTimeout),
                reason = self.channel.stopped() => return Err(reason),
                addresses = address_rx.recv() => {
                    let addresses = addresses?;
                    if addresses.is_empty() {
                        continue;
                    }
                    debug!(
                        authority = %self.channel.authority(),
                        count = addresses.len(),
                        "seed returned addresses"
                    );
                    self.context.store_addresses(addresses);
                    return Ok(());
                }
            }
        }
    }
}

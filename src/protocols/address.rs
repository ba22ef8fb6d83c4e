//! Address gossip (31402).

use std::sync::Arc;

use tracing::debug;

use crate::channel::Channel;
use crate::message::Message;
use crate::p2p::NetContext;
use crate::protocols::Protocol;
use crate::subscriber::Subscription;
use crate::types::NetworkAddress;

/// Steady-state address exchange: announce self, request peers, store
/// what arrives. Blacklist enforcement happens at the store hook, not
/// here.
///
/// Constructing the protocol subscribes it; spawn `run` promptly.
pub(crate) struct AddressProtocol {
    channel: Arc<Channel>,
    context: Arc<NetContext>,
    address_rx: Option<Subscription<Vec<NetworkAddress>>>,
    get_address_rx: Option<Subscription<()>>,
}

impl Protocol for AddressProtocol {
    const NAME: &'static str = "address";

    fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl AddressProtocol {
    pub fn new(context: Arc<NetContext>, channel: Arc<Channel>) -> Self {
        // Without a pool we neither ask for addresses nor handle them.
        let pooled = context.config.host_pool_capacity != 0;
        let address_rx = pooled.then(|| channel.topics().address.subscribe());
        let get_address_rx = pooled.then(|| channel.topics().get_address.subscribe());

        Self {
            channel,
            context,
            address_rx,
            get_address_rx,
        }
    }

    fn self_announcement(&self) -> Option<Vec<NetworkAddress>> {
        let config = &self.context.config;
        (config.self_address.port != 0)
            .then(|| vec![config.self_address.to_network_address(config.services)])
    }

    pub async fn run(mut self) {
        self.log_attach();

        let announcement = self.self_announcement();

        if let Some(addresses) = &announcement {
            if self
                .channel
                .send(Message::Address(addresses.clone()))
                .await
                .is_err()
            {
                return;
            }
        }

        let (Some(mut address_rx), Some(mut get_address_rx)) =
            (self.address_rx.take(), self.get_address_rx.take())
        else {
            return;
        };

        if self.channel.send(Message::GetAddress).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                _ = self.channel.stopped() => return,
                addresses = address_rx.recv() => {
                    let Ok(addresses) = addresses else { return };
                    debug!(
                        authority = %self.channel.authority(),
                        count = addresses.len(),
                        "storing gossiped addresses"
                    );
                    self.context.store_addresses(addresses);
                }
                request = get_address_rx.recv() => {
                    if request.is_err() {
                        return;
                    }
                    if let Some(addresses) = &announcement {
                        debug!(
                            authority = %self.channel.authority(),
                            "answering getaddr with self"
                        );
                        if self
                            .channel
                            .send(Message::Address(addresses.clone()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        }
    }
}

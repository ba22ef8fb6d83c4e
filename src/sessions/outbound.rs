//! Outbound session: replenished connect cycles over batched dials.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::connector::Connector;
use crate::error::Error;
use crate::sessions::{Role, Session};
use crate::transport::Transport;
use crate::types::Link;

pub(crate) struct OutboundSession<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> OutboundSession<T> {
    pub fn new(session: Session<T>) -> Self {
        Self { session }
    }

    /// Spawn one connect cycle per target outbound connection.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        let target = self.session.ctx.config.outbound_connections;
        if target == 0 {
            info!("not configured for outbound connections");
            return Vec::new();
        }

        info!(target, "starting outbound session");
        (0..target)
            .map(|slot| {
                let session = self.session.clone();
                tokio::spawn(cycle(session, slot))
            })
            .collect()
    }
}

/// One connection slot: batch-dial, register, hold until the channel
/// stops, replace immediately.
async fn cycle<T: Transport>(session: Session<T>, slot: usize) {
    loop {
        if session.stopped() {
            return;
        }

        let channel = match connect_batch(&session).await {
            Ok(channel) => channel,
            Err(reason) => {
                debug!(slot, %reason, "outbound connect failed");
                let delay = session.cycle_delay(reason);
                tokio::select! {
                    _ = session.ctx.stop.wait() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        match session.register_channel(&channel, Role::Outbound).await {
            Ok(()) => {
                info!(
                    slot,
                    authority = %channel.authority(),
                    connections = session.ctx.connection_count(),
                    "outbound channel connected"
                );
                session.attach_protocols(&channel);

                let reason = channel.stopped().await;
                debug!(slot, authority = %channel.authority(), %reason, "outbound channel stopped");
                // Replace immediately.
            }
            Err(reason) => {
                debug!(slot, %reason, "outbound channel failed to start");
                // Back off; with a small address pool the replacement
                // dial tends to land on the same peer.
                let delay = session.cycle_delay(reason);
                tokio::select! {
                    _ = session.ctx.stop.wait() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Issue `connect_batch_size` parallel dials; the first success wins
/// and the remaining legs are stopped and drained.
async fn connect_batch<T: Transport>(session: &Session<T>) -> Result<Arc<Channel>, Error> {
    let batch = session.ctx.config.connect_batch_size.max(1);

    let mut connectors = Vec::with_capacity(batch);
    let mut legs = FuturesUnordered::new();
    for _ in 0..batch {
        let connector = Connector::new(session.ctx.config.connect_timeout);
        session.ctx.pend_connector(&connector)?;
        connectors.push(Arc::clone(&connector));
        legs.push(leg(session, connector));
    }

    let mut winner = None;
    let mut last_error = Error::NotFound;

    while let Some(result) = legs.next().await {
        match result {
            Ok((stream, authority)) if winner.is_none() => {
                // Cancel the rest of the batch; already-resolved legs
                // are unaffected.
                for connector in &connectors {
                    connector.stop(Error::ChannelStopped);
                }
                winner = Some(session.create_channel(stream, authority, Link::Outbound));
            }
            // A second leg won the race after the winner; drop it.
            Ok(_) => {}
            Err(reason) => last_error = reason,
        }
    }

    winner.ok_or(last_error)
}

async fn leg<T: Transport>(
    session: &Session<T>,
    connector: Arc<Connector>,
) -> Result<(T::Stream, crate::types::Authority), Error> {
    let result = async {
        if session.stopped() {
            return Err(Error::ServiceStopped);
        }

        let address = session.ctx.fetch_address()?;
        let authority = address.authority();

        if session.blacklisted(&authority) {
            debug!(%authority, "fetched blacklisted address");
            return Err(Error::AddressBlocked);
        }

        debug!(%authority, "connecting");
        connector
            .connect(
                session.transport.as_ref(),
                &authority.ip.to_string(),
                authority.port,
            )
            .await
    }
    .await;

    session.ctx.unpend_connector(&connector);
    result
}

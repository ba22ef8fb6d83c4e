//! Manual session: persistent peers with reconnect.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::Endpoint;
use crate::error::Error;
use crate::sessions::{Role, Session};
use crate::transport::Transport;
use crate::types::Link;

/// Maintains one channel per requested endpoint for the life of the
/// service, re-dialing with exponential backoff. Pool counts are
/// ignored; manual peers are wanted regardless.
pub(crate) struct ManualSession<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> ManualSession<T> {
    pub fn new(session: Session<T>) -> Self {
        Self { session }
    }

    /// Dispatch loop: one maintenance task per requested endpoint.
    pub async fn run(self, mut requests: mpsc::UnboundedReceiver<Endpoint>) {
        let mut maintained = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.session.ctx.stop.wait() => break,
                request = requests.recv() => match request {
                    Some(peer) => {
                        let session = self.session.clone();
                        maintained.spawn(maintain(session, peer));
                    }
                    None => break,
                },
            }
        }

        while maintained.join_next().await.is_some() {}
    }
}

async fn maintain<T: Transport>(session: Session<T>, peer: Endpoint) {
    let base = session.ctx.config.connect_cycle_delay;
    let ceiling = session.ctx.config.connect_cycle_delay_maximum;
    let mut delay = base;

    loop {
        if session.stopped() {
            return;
        }

        match connect_once(&session, &peer).await {
            Ok(channel) => {
                info!(%peer, authority = %channel.authority(), "manual channel connected");
                delay = base;

                let reason = channel.stopped().await;
                debug!(%peer, %reason, "manual channel stopped");
            }
            Err(reason) => {
                warn!(%peer, %reason, "manual connect failed");
                tokio::select! {
                    _ = session.ctx.stop.wait() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(ceiling.max(base));
            }
        }
    }
}

async fn connect_once<T: Transport>(
    session: &Session<T>,
    peer: &Endpoint,
) -> Result<Arc<Channel>, Error> {
    let (stream, authority) = session.connect_one(&peer.host, peer.port).await?;

    let channel = session.create_channel(stream, authority, Link::Outbound);
    session.register_channel(&channel, Role::Manual).await?;
    session.attach_protocols(&channel);
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    #[test]
    fn backoff_doubles_to_ceiling() {
        let base = Duration::from_secs(5);
        let ceiling = Duration::from_secs(30);

        let mut delay = base;
        let mut observed = Vec::new();
        for _ in 0..4 {
            observed.push(delay);
            delay = (delay * 2).min(ceiling.max(base));
        }

        assert_eq!(
            observed,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30),
            ]
        );
    }
}

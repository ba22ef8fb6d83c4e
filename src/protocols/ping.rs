//! Keep-alive heartbeat (31402 plain, 60001 nonce-matched).

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::channel::Channel;
use crate::error::Error;
use crate::message::Message;
use crate::p2p::NetContext;
use crate::protocols::Protocol;
use crate::subscriber::Subscription;

/// Periodic ping traffic; at 60001 every ping carries a nonce and an
/// unanswered ping by the next heartbeat drops the channel.
///
/// Constructing the protocol subscribes it; spawn `run` promptly.
pub(crate) struct PingProtocol {
    channel: Arc<Channel>,
    context: Arc<NetContext>,
    /// Nonce matching per BIP31.
    nonced: bool,
    rng: fastrand::Rng,
    ping_rx: Option<Subscription<Option<u64>>>,
    pong_rx: Option<Subscription<u64>>,
}

impl Protocol for PingProtocol {
    const NAME: &'static str = "ping";

    fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl PingProtocol {
    pub fn new(context: Arc<NetContext>, channel: Arc<Channel>, nonced: bool) -> Self {
        let rng = context.fork_rng();
        // Pre-BIP31 peers are kept alive but not latency-checked, and
        // their pings are ignored.
        let ping_rx = nonced.then(|| channel.topics().ping.subscribe());
        let pong_rx = nonced.then(|| channel.topics().pong.subscribe());

        Self {
            channel,
            context,
            nonced,
            rng,
            ping_rx,
            pong_rx,
        }
    }

    pub async fn run(mut self) {
        self.log_attach();

        // The first tick fires immediately: an initial ping goes out as
        // soon as the protocol attaches.
        let mut heartbeat = tokio::time::interval(self.context.config.channel_heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ping_rx = self.ping_rx.take();
        let mut pong_rx = self.pong_rx.take();
        let mut pending: Option<u64> = None;

        loop {
            tokio::select! {
                _ = self.channel.stopped() => return,
                _ = heartbeat.tick() => {
                    if self.nonced && pending.is_some() {
                        debug!(
                            authority = %self.channel.authority(),
                            "ping latency limit exceeded"
                        );
                        self.channel.stop(Error::ChannelTimeout);
                        return;
                    }

                    let nonce = self.nonced.then(|| self.rng.u64(..));
                    pending = nonce;
                    if self.channel.send(Message::Ping { nonce }).await.is_err() {
                        return;
                    }
                }
                ping = next(&mut ping_rx) => {
                    let Ok(nonce) = ping else { return };
                    // Echo nonced pings; a nonce-less ping from a 60001
                    // peer needs no answer.
                    if let Some(nonce) = nonce {
                        if self.channel.send(Message::Pong { nonce }).await.is_err() {
                            return;
                        }
                    }
                }
                pong = next(&mut pong_rx) => {
                    let Ok(nonce) = pong else { return };
                    match pending {
                        Some(expected) if expected == nonce => pending = None,
                        _ => {
                            debug!(
                                authority = %self.channel.authority(),
                                nonce,
                                "unexpected pong nonce"
                            );
                            self.channel.stop(Error::BadStream);
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn next<M>(subscription: &mut Option<Subscription<M>>) -> Result<M, Error> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

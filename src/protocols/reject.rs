//! Rejection notices (70002), logged so they are not silently dropped.

use std::sync::Arc;

use tracing::debug;

use crate::channel::Channel;
use crate::message::Message;
use crate::protocols::Protocol;
use crate::subscriber::Subscription;

/// Constructing the protocol subscribes it; spawn `run` promptly.
pub(crate) struct RejectProtocol {
    channel: Arc<Channel>,
    reject_rx: Option<Subscription<crate::message::RejectPayload>>,
}

impl Protocol for RejectProtocol {
    const NAME: &'static str = "reject";

    fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl RejectProtocol {
    pub fn new(channel: Arc<Channel>) -> Self {
        let reject_rx = Some(channel.topics().reject.subscribe());
        Self { channel, reject_rx }
    }

    // TODO: drop-and-log above a per-interval budget; a hostile peer can
    // currently fill the debug log.
    pub async fn run(mut self) {
        self.log_attach();
        let mut reject_rx = self.reject_rx.take().expect("reject protocol run twice");

        loop {
            let Ok(reject) = reject_rx.recv().await else {
                return;
            };

            // Version rejects are handled during the handshake.
            if reject.message == Message::VERSION {
                continue;
            }

            debug!(
                authority = %self.channel.authority(),
                message = %reject.message,
                code = ?reject.code,
                reason = %reject.reason,
                "peer rejected message"
            );
        }
    }
}

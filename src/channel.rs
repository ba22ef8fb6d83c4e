//! A live peer connection: proxy, timers and per-peer state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::codec::Codec;
use crate::config::Config;
use crate::error::Error;
use crate::message::{Message, VersionPayload};
use crate::pending::Stoppable;
use crate::proxy::{Proxy, Topics};
use crate::sync::StopSignal;
use crate::types::{Authority, Link};

/// Add up to a tenth of uniform jitter, de-synchronizing disconnects
/// across channels.
fn jittered(base: Duration, rng: &fastrand::Rng) -> Duration {
    let tenth = (base.as_millis() / 10) as u64;
    base + Duration::from_millis(rng.u64(0..=tenth))
}

/// One connected peer.
///
/// The channel owns its expiration and inactivity timers; the handshake
/// timer belongs to the version protocol. `nonce`, `peer_version` and
/// `negotiated_version` are set once and then read-only.
pub struct Channel {
    proxy: Arc<Proxy>,
    /// Assigned by the session at registration; non-zero once set.
    nonce: AtomicU64,
    peer_version: OnceLock<VersionPayload>,
    /// Initialized to the configured maximum, lowered at handshake.
    negotiated: AtomicU32,
    notify: AtomicBool,
    expiration: Duration,
    inactivity: Duration,
    activity: watch::Sender<Instant>,
}

impl Channel {
    pub fn new<S>(
        stream: S,
        authority: Authority,
        link: Link,
        codec: Arc<dyn Codec>,
        config: &Config,
        rng: &fastrand::Rng,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            proxy: Proxy::new(stream, authority, link, codec),
            nonce: AtomicU64::new(0),
            peer_version: OnceLock::new(),
            negotiated: AtomicU32::new(config.protocol_maximum),
            notify: AtomicBool::new(false),
            expiration: jittered(config.channel_expiration, rng),
            inactivity: jittered(config.channel_inactivity, rng),
            activity: watch::channel(Instant::now()).0,
        })
    }

    /// Start the frame loops and both timers.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        self.proxy.start(self.activity.clone())?;
        self.activity.send_replace(Instant::now());

        tokio::spawn(run_timers(
            Arc::downgrade(self),
            self.stop_handle(),
            self.activity.subscribe(),
            self.expiration,
            self.inactivity,
        ));
        Ok(())
    }

    // Properties.

    pub fn authority(&self) -> Authority {
        self.proxy.authority()
    }

    pub fn link(&self) -> Link {
        self.proxy.link()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce.load(Ordering::Acquire)
    }

    pub fn set_nonce(&self, nonce: u64) {
        debug_assert_ne!(nonce, 0);
        self.nonce.store(nonce, Ordering::Release);
    }

    /// The peer's version message; `None` before handshake success.
    pub fn peer_version(&self) -> Option<&VersionPayload> {
        self.peer_version.get()
    }

    pub fn set_peer_version(&self, version: VersionPayload) {
        let _ = self.peer_version.set(version);
    }

    pub fn negotiated_version(&self) -> u32 {
        self.negotiated.load(Ordering::Acquire)
    }

    pub fn set_negotiated_version(&self, version: u32) {
        self.negotiated.store(version, Ordering::Release);
    }

    pub fn notify(&self) -> bool {
        self.notify.load(Ordering::Acquire)
    }

    pub fn set_notify(&self, notify: bool) {
        self.notify.store(notify, Ordering::Release);
    }

    // Talk.

    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.proxy.send(message).await
    }

    pub(crate) fn topics(&self) -> &Topics {
        self.proxy.topics()
    }

    // Stop.

    pub fn stop(&self, reason: Error) {
        self.proxy.stop(reason);
    }

    pub fn is_stopped(&self) -> bool {
        self.proxy.is_stopped()
    }

    pub fn stop_reason(&self) -> Option<Error> {
        self.proxy.stop_reason()
    }

    /// Resolves with the stop reason; the channel-level one-shot stop
    /// subscription.
    pub async fn stopped(&self) -> Error {
        self.proxy.stopped().await
    }

    fn stop_handle(&self) -> StopSignal {
        // The timers only need wait/is_stopped; sharing the proxy's
        // signal keeps stop a single latch.
        self.proxy_stop().clone()
    }

    fn proxy_stop(&self) -> &StopSignal {
        self.proxy.stop_signal()
    }
}

impl Stoppable for Channel {
    fn stop(&self, reason: Error) {
        Channel::stop(self, reason);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("authority", &self.authority())
            .field("link", &self.link())
            .field("nonce", &self.nonce())
            .field("negotiated", &self.negotiated_version())
            .finish()
    }
}

/// Expiration and inactivity races. Both observe the stop latch and
/// no-op once the channel is stopped or freed.
async fn run_timers(
    channel: Weak<Channel>,
    stop: StopSignal,
    activity: watch::Receiver<Instant>,
    expiration: Duration,
    inactivity: Duration,
) {
    let expiry = tokio::time::sleep(expiration);
    tokio::pin!(expiry);

    loop {
        let last = *activity.borrow();

        tokio::select! {
            _ = stop.wait() => return,
            _ = &mut expiry => {
                if let Some(channel) = channel.upgrade() {
                    debug!(authority = %channel.authority(), "channel lifetime expired");
                    channel.stop(Error::ChannelTimeout);
                }
                return;
            }
            _ = tokio::time::sleep_until(last + inactivity) => {
                // Re-armed by any inbound frame since we sampled.
                if *activity.borrow() == last {
                    if let Some(channel) = channel.upgrade() {
                        debug!(authority = %channel.authority(), "channel inactivity timeout");
                        channel.stop(Error::ChannelTimeout);
                    }
                    return;
                }
            }
        }
    }
}

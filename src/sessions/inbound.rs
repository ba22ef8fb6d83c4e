//! Inbound session: accept loop with cap and self-connect refusal.

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connector::Acceptor;
use crate::error::Error;
use crate::sessions::{Role, Session};
use crate::transport::{Listener, Transport};
use crate::types::Link;

pub(crate) struct InboundSession<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> InboundSession<T> {
    pub fn new(session: Session<T>) -> Self {
        Self { session }
    }

    /// Bind the configured endpoint and spawn the accept loop. Bind
    /// failures surface to the caller; a disabled configuration is not
    /// an error.
    pub async fn start(self) -> Result<Option<JoinHandle<()>>, Error> {
        let config = &self.session.ctx.config;

        if config.inbound_connections == 0 || config.bind.port == 0 {
            info!("not configured for inbound connections");
            return Ok(None);
        }

        let listener = self.session.transport.bind(config.bind).await?;
        info!(bind = %listener.local_addr(), "accepting inbound connections");

        let acceptor = Acceptor::new(listener, self.session.ctx.stop.clone());
        Ok(Some(tokio::spawn(accept_loop(self.session, acceptor))))
    }
}

async fn accept_loop<T: Transport>(
    session: Session<T>,
    mut acceptor: Acceptor<T::Listener>,
) {
    loop {
        let (stream, authority) = match acceptor.accept().await {
            Ok(accepted) => accepted,
            Err(reason) => {
                debug!(%reason, "accept loop ending");
                return;
            }
        };

        if session.stopped() {
            return;
        }

        if session.blacklisted(&authority) {
            debug!(%authority, "dropping blacklisted inbound connection");
            continue;
        }

        debug!(%authority, "accepted inbound connection");

        // Register concurrently; the accept loop keeps running.
        let session = session.clone();
        tokio::spawn(async move {
            let channel = session.create_channel(stream, authority, Link::Inbound);
            match session.register_channel(&channel, Role::Inbound).await {
                Ok(()) => {
                    info!(
                        %authority,
                        connections = session.ctx.connection_count(),
                        "inbound channel connected"
                    );
                    session.attach_protocols(&channel);
                }
                Err(reason) => {
                    debug!(%authority, %reason, "inbound channel failed to start");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::channel::Channel;
    use crate::codec::{Codec, PlainCodec};
    use crate::config::Config;
    use crate::message::VersionPayload;
    use crate::p2p::NetContext;
    use crate::types::{Authority, NetworkAddress, NODE_NETWORK};

    fn version(nonce: u64) -> VersionPayload {
        let address = |port: u16| NetworkAddress {
            services: NODE_NETWORK,
            ip: "10.0.0.9".parse().unwrap(),
            port,
            timestamp: 0,
        };
        VersionPayload {
            value: 70002,
            services: NODE_NETWORK,
            timestamp: 0,
            receiver: address(1),
            sender: address(2),
            nonce,
            user_agent: "/test/".into(),
            start_height: 0,
            relay: false,
        }
    }

    fn test_channel(ctx: &NetContext, authority: Authority) -> Arc<Channel> {
        let (near, _far) = tokio::io::duplex(1024);
        let codec: Arc<dyn Codec> = Arc::new(PlainCodec::new());
        Channel::new(
            near,
            authority,
            Link::Inbound,
            codec,
            &ctx.config,
            &ctx.fork_rng(),
        )
    }

    // A peer that echoes a locally pending handshake nonce in its
    // version is a loopback of our own dial and must not be adopted.
    #[tokio::test]
    async fn self_connection_is_refused() {
        let net = crate::transport::memory::MemoryNet::new();
        let transport = Arc::new(net.endpoint("10.0.0.1".parse().unwrap()));
        let ctx = NetContext::for_tests(Config {
            rng_seed: Some(11),
            ..Config::default()
        });
        let session = Session::new(Arc::clone(&ctx), transport, false);

        // Our own outbound dial, mid-handshake with nonce 0x11.
        let outbound = test_channel(&ctx, "10.0.0.9:8333".parse().unwrap());
        outbound.set_nonce(0x11);
        ctx.pend_handshake(&outbound).unwrap();

        // The loopback arrives inbound carrying that same nonce.
        let inbound = test_channel(&ctx, "10.0.0.9:50001".parse().unwrap());
        inbound.set_peer_version(version(0x11));

        let result = session.handshake_complete(&inbound, Role::Inbound);
        assert_eq!(result, Err(Error::AddressInUse));
        assert_eq!(ctx.connection_count(), 0);

        // An unrelated nonce is adopted fine.
        let other = test_channel(&ctx, "10.0.0.10:50002".parse().unwrap());
        other.set_peer_version(version(0x22));
        assert_eq!(session.handshake_complete(&other, Role::Inbound), Ok(()));
        assert_eq!(ctx.connection_count(), 1);
    }

    #[tokio::test]
    async fn inbound_cap_is_enforced() {
        let net = crate::transport::memory::MemoryNet::new();
        let transport = Arc::new(net.endpoint("10.0.0.1".parse().unwrap()));
        let ctx = NetContext::for_tests(Config {
            inbound_connections: 1,
            rng_seed: Some(11),
            ..Config::default()
        });
        let session = Session::new(Arc::clone(&ctx), transport, false);

        let first = test_channel(&ctx, "10.0.0.2:50001".parse().unwrap());
        first.set_peer_version(version(0xa1));
        assert_eq!(session.handshake_complete(&first, Role::Inbound), Ok(()));

        let second = test_channel(&ctx, "10.0.0.3:50002".parse().unwrap());
        second.set_peer_version(version(0xa2));
        assert_eq!(
            session.handshake_complete(&second, Role::Inbound),
            Err(Error::Oversubscribed)
        );
    }

    #[tokio::test]
    async fn duplicate_authority_is_refused() {
        let net = crate::transport::memory::MemoryNet::new();
        let transport = Arc::new(net.endpoint("10.0.0.1".parse().unwrap()));
        let ctx = NetContext::for_tests(Config {
            rng_seed: Some(11),
            ..Config::default()
        });
        let session = Session::new(Arc::clone(&ctx), transport, false);

        let authority: Authority = "10.0.0.2:50001".parse().unwrap();
        let first = test_channel(&ctx, authority);
        first.set_peer_version(version(0xb1));
        assert_eq!(session.handshake_complete(&first, Role::Inbound), Ok(()));

        let duplicate = test_channel(&ctx, authority);
        duplicate.set_peer_version(version(0xb2));
        assert_eq!(
            session.handshake_complete(&duplicate, Role::Inbound),
            Err(Error::AddressInUse)
        );
    }
}

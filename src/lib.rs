//! Connection management for Bitcoin-style peer-to-peer networks.
//!
//! The crate owns the session layer (seed, manual, inbound, outbound),
//! the channel lifecycle (handshake, keep-alive, timers) and the
//! per-channel protocol machines. The wire codec, socket transport and
//! address-book persistence are injected through traits; the consuming
//! node supplies its top block and subscribes to adopted channels.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use goshawk::{Config, Endpoint, P2p, PlainCodec, TcpTransport};
//!
//! # async fn node() -> Result<(), goshawk::Error> {
//! let config = Config {
//!     seeds: vec![Endpoint::new("seed.example.org", 8333)],
//!     ..Config::default()
//! };
//! let p2p = P2p::new(config, Arc::new(PlainCodec::new()), TcpTransport::new());
//!
//! let mut connections = p2p.subscribe_connection();
//! p2p.start().await?;
//! p2p.run().await?;
//!
//! while let Ok(channel) = connections.recv().await {
//!     tracing::info!("peer up: {}", channel.authority());
//! }
//! # Ok(())
//! # }
//! ```

mod channel;
mod codec;
mod config;
mod connector;
mod error;
mod hosts;
mod message;
mod p2p;
mod pending;
mod protocols;
mod proxy;
mod sessions;
mod subscriber;
mod sync;
mod transport;
mod types;

pub use channel::Channel;
pub use codec::{Codec, FrameHeader, PlainCodec};
pub use config::{Config, Endpoint, Subnet};
pub use connector::{Acceptor, Connector};
pub use error::Error;
pub use hosts::{EphemeralStorage, FileStorage, HostStorage, Hosts};
pub use message::{Message, RejectCode, RejectPayload, VersionPayload};
pub use p2p::P2p;
pub use pending::{Pending, Stoppable};
pub use subscriber::{Subscriber, Subscription};
pub use sync::{Join, StopSignal};
pub use transport::{memory, Listener, TcpTransport, Transport};
pub use types::{
    Authority, Link, NetworkAddress, TopBlock, LEVEL_BIP31, LEVEL_BIP37, LEVEL_BIP61,
    LEVEL_MAXIMUM, LEVEL_MINIMUM, NODE_NETWORK, NODE_NONE, NODE_WITNESS, USER_AGENT,
};

//! Seed session: one-shot address-pool bootstrap.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info};

use crate::config::Endpoint;
use crate::error::Error;
use crate::protocols::{PingProtocol, RejectProtocol, SeedProtocol};
use crate::sessions::{Role, Session};
use crate::transport::Transport;
use crate::types::{Link, LEVEL_BIP31, LEVEL_BIP61};

/// Seeding must grow the pool by at least this many addresses to count
/// as a success, clamped to the configured capacity.
const MINIMUM_HOST_INCREASE: usize = 100;

pub(crate) struct SeedSession<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> SeedSession<T> {
    pub fn new(session: Session<T>) -> Self {
        Self { session }
    }

    /// Contact every configured seed in parallel; individual failures
    /// are suppressed, the aggregate address increase decides.
    pub async fn run(&self) -> Result<(), Error> {
        let config = &self.session.ctx.config;

        if config.host_pool_capacity == 0 {
            info!("not configured to populate an address pool");
            return Ok(());
        }

        let start_count = self.session.ctx.address_count();
        if start_count != 0 {
            debug!(count = start_count, "seeding skipped, pool already cached");
            return Ok(());
        }

        if config.seeds.is_empty() {
            error!("seeding required but no seeds configured");
            return Err(Error::OperationFailed);
        }

        let mut attempts: FuturesUnordered<_> = config
            .seeds
            .iter()
            .map(|seed| self.contact_seed(seed))
            .collect();
        while attempts.next().await.is_some() {}

        let required = MINIMUM_HOST_INCREASE.min(config.host_pool_capacity);
        let count = self.session.ctx.address_count();
        if count >= start_count + required {
            info!(count, "seeding complete");
            Ok(())
        } else {
            Err(Error::PeerThrottling)
        }
    }

    async fn contact_seed(&self, seed: &Endpoint) {
        if let Err(reason) = self.try_seed(seed).await {
            info!(%seed, %reason, "seed contact failed");
        }
    }

    async fn try_seed(&self, seed: &Endpoint) -> Result<(), Error> {
        if self.session.stopped() {
            return Err(Error::ChannelStopped);
        }

        info!(%seed, "contacting seed");
        let (stream, authority) = self.session.connect_one(&seed.host, seed.port).await?;

        let channel = self.session.create_channel(stream, authority, Link::Outbound);
        self.session.register_channel(&channel, Role::Seed).await?;

        // Keep-alive and reject logging for the duration of the
        // harvest; the address protocol proper is not wanted here.
        let version = channel.negotiated_version();
        let ping = PingProtocol::new(
            Arc::clone(&self.session.ctx),
            Arc::clone(&channel),
            version >= LEVEL_BIP31,
        );
        tokio::spawn(ping.run());
        if version >= LEVEL_BIP61 {
            tokio::spawn(RejectProtocol::new(Arc::clone(&channel)).run());
        }

        let harvest = SeedProtocol::new(
            Arc::clone(&self.session.ctx),
            Arc::clone(&channel),
        )
        .run()
        .await;

        // The seed channel has served its purpose either way.
        channel.stop(Error::ChannelStopped);
        harvest
    }
}

//! The network facade: lifecycle, shared collections and hooks.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::Channel;
use crate::codec::Codec;
use crate::config::{Config, Endpoint};
use crate::connector::Connector;
use crate::error::Error;
use crate::hosts::{EphemeralStorage, FileStorage, HostStorage, Hosts};
use crate::pending::Pending;
use crate::sessions::{InboundSession, ManualSession, OutboundSession, SeedSession, Session};
use crate::subscriber::{Subscriber, Subscription};
use crate::sync::StopSignal;
use crate::transport::Transport;
use crate::types::{Authority, NetworkAddress, TopBlock};

fn same_authority(a: &Channel, b: &Channel) -> bool {
    a.authority() == b.authority()
}

/// State shared by the facade, its sessions and the protocols.
pub(crate) struct NetContext {
    pub config: Arc<Config>,
    pub codec: Arc<dyn Codec>,
    pub hosts: Hosts,
    /// Service-wide stop latch.
    pub stop: StopSignal,
    /// In-flight dials.
    pub pending_connect: Pending<Connector>,
    /// Channels mid-handshake, searched by nonce for self-detection.
    pub pending_handshake: Pending<Channel>,
    /// Adopted channels, deduplicated by authority.
    pub pending_close: Pending<Channel>,
    /// Adopted-channel notifications for the node.
    pub connections: Subscriber<Arc<Channel>>,
    top_block: Mutex<TopBlock>,
    rng: Mutex<fastrand::Rng>,
}

impl NetContext {
    fn new(config: Arc<Config>, codec: Arc<dyn Codec>, storage: impl HostStorage) -> Arc<Self> {
        let rng = match config.rng_seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let hosts_rng = fastrand::Rng::with_seed(rng.u64(..));

        Arc::new(Self {
            hosts: Hosts::new(config.host_pool_capacity, storage, hosts_rng),
            config,
            codec,
            stop: StopSignal::new(),
            pending_connect: Pending::new(),
            pending_handshake: Pending::new(),
            pending_close: Pending::with_dedup(same_authority),
            connections: Subscriber::new(),
            top_block: Mutex::new(TopBlock::default()),
            rng: Mutex::new(rng),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: Config) -> Arc<Self> {
        Self::new(
            Arc::new(config),
            Arc::new(crate::codec::PlainCodec::new()),
            EphemeralStorage,
        )
    }

    // Randomness.

    pub fn fork_rng(&self) -> fastrand::Rng {
        let rng = self.rng.lock().expect("rng poisoned");
        fastrand::Rng::with_seed(rng.u64(..))
    }

    /// A fresh non-zero channel nonce.
    pub fn random_nonce(&self) -> u64 {
        self.rng.lock().expect("rng poisoned").u64(1..=u64::MAX)
    }

    // Top block.

    pub fn top_block(&self) -> TopBlock {
        *self.top_block.lock().expect("top block poisoned")
    }

    pub fn set_top_block(&self, top: TopBlock) {
        *self.top_block.lock().expect("top block poisoned") = top;
    }

    // Hosts.

    pub fn address_count(&self) -> usize {
        self.hosts.count()
    }

    pub fn fetch_address(&self) -> Result<NetworkAddress, Error> {
        self.hosts.fetch()
    }

    /// Admit gossiped addresses, dropping blacklisted ones.
    pub fn store_addresses(&self, addresses: Vec<NetworkAddress>) {
        let config = Arc::clone(&self.config);
        self.hosts.store_many(
            addresses
                .into_iter()
                .filter(move |address| !config.blacklisted(&address.authority())),
        );
    }

    // Adopted channels.

    /// Adopt a channel, rejecting duplicate authorities, and notify
    /// connection subscribers when the channel asks for it.
    pub fn store_channel(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        self.pending_close.store(channel)?;
        if channel.notify() {
            self.connections.relay(Arc::clone(channel));
        }
        Ok(())
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.pending_close.remove(channel);
    }

    pub fn connected(&self, authority: &Authority) -> bool {
        self.pending_close
            .exists(|channel| channel.authority() == *authority)
    }

    pub fn connection_count(&self) -> usize {
        self.pending_close.len()
    }

    // Handshake collection.

    pub fn pend_handshake(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        self.pending_handshake.store(channel)
    }

    pub fn unpend_handshake(&self, channel: &Arc<Channel>) {
        self.pending_handshake.remove(channel);
    }

    /// Whether a locally pending handshake carries this nonce; a match
    /// on a peer's version nonce identifies a connection to self.
    pub fn pending_nonce(&self, nonce: u64) -> bool {
        nonce != 0 && self.pending_handshake.exists(|channel| channel.nonce() == nonce)
    }

    // Connect collection.

    pub fn pend_connector(&self, connector: &Arc<Connector>) -> Result<(), Error> {
        self.pending_connect.store(connector)
    }

    pub fn unpend_connector(&self, connector: &Arc<Connector>) {
        self.pending_connect.remove(connector);
    }
}

struct State {
    running: bool,
    manual: Option<mpsc::UnboundedSender<Endpoint>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The process-wide network service.
///
/// Lifecycle: [`start`] (hosts + seeding) → [`run`] (manual, inbound,
/// outbound sessions) → [`stop`] / [`close`]. Runs on the ambient tokio
/// runtime; [`Config::runtime`] builds a dedicated one when the node
/// wants network I/O isolated.
///
/// [`start`]: P2p::start
/// [`run`]: P2p::run
/// [`stop`]: P2p::stop
/// [`close`]: P2p::close
pub struct P2p<T: Transport> {
    ctx: Arc<NetContext>,
    transport: Arc<T>,
    state: Mutex<State>,
}

impl<T: Transport> P2p<T> {
    /// Build with host persistence taken from `config.hosts_file`.
    pub fn new(config: Config, codec: Arc<dyn Codec>, transport: T) -> Self {
        match config.hosts_file.clone() {
            Some(path) => Self::with_storage(config, codec, transport, FileStorage::new(path)),
            None => Self::with_storage(config, codec, transport, EphemeralStorage),
        }
    }

    pub fn with_storage(
        config: Config,
        codec: Arc<dyn Codec>,
        transport: T,
        storage: impl HostStorage,
    ) -> Self {
        Self {
            ctx: NetContext::new(Arc::new(config), codec, storage),
            transport: Arc::new(transport),
            state: Mutex::new(State {
                running: false,
                manual: None,
                tasks: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Load the host pool, attach the manual session and run seeding to
    /// completion. Fails with [`Error::OperationFailed`] when already
    /// running.
    pub async fn start(&self) -> Result<(), Error> {
        self.ctx.config.validate()?;

        {
            let mut state = self.state.lock().expect("p2p state poisoned");
            if state.running {
                return Err(Error::OperationFailed);
            }
            state.running = true;
        }

        self.ctx.stop.reset();
        self.ctx.connections.reopen();
        self.ctx.pending_connect.reopen();
        self.ctx.pending_handshake.reopen();
        self.ctx.pending_close.reopen();

        let (manual_tx, manual_rx) = mpsc::unbounded_channel();
        let manual = ManualSession::new(self.session(true));
        let manual_task = tokio::spawn(manual.run(manual_rx));

        {
            let mut state = self.state.lock().expect("p2p state poisoned");
            state.manual = Some(manual_tx);
            state.tasks.push(manual_task);
        }

        self.ctx.hosts.start()?;
        SeedSession::new(self.session(false)).run().await
    }

    /// Dial persistent peers and start the inbound and outbound
    /// sessions.
    pub async fn run(&self) -> Result<(), Error> {
        if self.stopped() {
            return Err(Error::ServiceStopped);
        }
        if !self.state.lock().expect("p2p state poisoned").running {
            return Err(Error::OperationFailed);
        }

        for peer in self.ctx.config.peers.clone() {
            self.dial_manual(peer);
        }

        let mut tasks = Vec::new();
        if let Some(task) = InboundSession::new(self.session(true)).start().await? {
            tasks.push(task);
        }
        tasks.extend(OutboundSession::new(self.session(true)).start());

        self.state
            .lock()
            .expect("p2p state poisoned")
            .tasks
            .extend(tasks);
        Ok(())
    }

    /// Persist hosts, latch the stop signal and drain every pending
    /// collection. Idempotent; safe to call from any thread.
    pub fn stop(&self) -> Result<(), Error> {
        // The only failable step.
        let result = self.ctx.hosts.stop();

        {
            let mut state = self.state.lock().expect("p2p state poisoned");
            state.running = false;
            state.manual = None;
        }

        if self.ctx.stop.stop(Error::ServiceStopped) {
            info!("network stopping");
        }
        self.ctx.connections.stop(Error::ServiceStopped);

        self.ctx.pending_connect.stop(Error::ServiceStopped);
        self.ctx.pending_handshake.stop(Error::ServiceStopped);
        self.ctx.pending_close.stop(Error::ServiceStopped);

        result
    }

    /// Stop, then wait for every session task to drain.
    pub async fn close(&self) -> Result<(), Error> {
        let result = self.stop();

        let tasks = {
            let mut state = self.state.lock().expect("p2p state poisoned");
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            let _ = task.await;
        }
        result
    }

    pub fn stopped(&self) -> bool {
        self.ctx.stop.is_stopped()
    }

    // Manual connections.

    /// Maintain a persistent connection to the endpoint, with
    /// reconnect.
    pub fn connect(&self, host: impl Into<String>, port: u16) {
        if self.stopped() {
            return;
        }
        self.dial_manual(Endpoint::new(host, port));
    }

    fn dial_manual(&self, peer: Endpoint) {
        let state = self.state.lock().expect("p2p state poisoned");
        if let Some(manual) = &state.manual {
            let _ = manual.send(peer);
        }
    }

    // Subscriptions.

    /// One notification per adopted channel with `notify` set.
    pub fn subscribe_connection(&self) -> Subscription<Arc<Channel>> {
        self.ctx.connections.subscribe()
    }

    /// Resolves once the service shuts down.
    pub fn subscribe_stop(&self) -> impl Future<Output = Error> + Send + 'static {
        let stop = self.ctx.stop.clone();
        async move { stop.wait().await }
    }

    // Host pool.

    pub fn address_count(&self) -> usize {
        self.ctx.address_count()
    }

    /// Admit an address into the pool, subject to the blacklist.
    pub fn store_address(&self, address: NetworkAddress) {
        self.ctx.store_addresses(vec![address]);
    }

    pub fn fetch_address(&self) -> Result<NetworkAddress, Error> {
        self.ctx.fetch_address()
    }

    pub fn remove_address(&self, address: &NetworkAddress) -> Result<(), Error> {
        self.ctx.hosts.remove(address)
    }

    // Queries.

    pub fn connection_count(&self) -> usize {
        self.ctx.connection_count()
    }

    pub fn connected(&self, authority: &Authority) -> bool {
        self.ctx.connected(authority)
    }

    pub fn top_block(&self) -> TopBlock {
        self.ctx.top_block()
    }

    /// Reflected in the start-height field of outbound handshakes.
    pub fn set_top_block(&self, top: TopBlock) {
        self.ctx.set_top_block(top)
    }

    fn session(&self, notify_on_connect: bool) -> Session<T> {
        Session::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.transport),
            notify_on_connect,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainCodec;
    use crate::transport::memory::MemoryNet;

    fn p2p(config: Config) -> P2p<crate::transport::memory::MemoryTransport> {
        let net = MemoryNet::new();
        let transport = net.endpoint("10.0.0.1".parse().unwrap());
        P2p::new(config, Arc::new(PlainCodec::new()), transport)
    }

    fn quiet_config() -> Config {
        Config {
            host_pool_capacity: 0,
            outbound_connections: 0,
            inbound_connections: 0,
            rng_seed: Some(42),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let p2p = p2p(quiet_config());
        p2p.start().await.unwrap();
        assert_eq!(p2p.start().await, Err(Error::OperationFailed));
        p2p.close().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let p2p = p2p(quiet_config());
        p2p.start().await.unwrap();
        p2p.run().await.unwrap();

        assert_eq!(p2p.stop(), Ok(()));
        assert_eq!(p2p.stop(), Ok(()));
        assert_eq!(p2p.connection_count(), 0);
        p2p.close().await.unwrap();
    }

    #[tokio::test]
    async fn stop_subscribers_are_notified() {
        let p2p = p2p(quiet_config());
        p2p.start().await.unwrap();

        let stopped = p2p.subscribe_stop();
        p2p.stop().unwrap();
        assert_eq!(stopped.await, Error::ServiceStopped);

        // Subscribing after the fact resolves immediately.
        assert_eq!(p2p.subscribe_stop().await, Error::ServiceStopped);
        p2p.close().await.unwrap();
    }

    #[tokio::test]
    async fn run_before_start_fails() {
        let p2p = p2p(quiet_config());
        assert_eq!(p2p.run().await, Err(Error::OperationFailed));
    }

    #[tokio::test]
    async fn seeding_required_but_unconfigured() {
        let config = Config {
            host_pool_capacity: 100,
            seeds: Vec::new(),
            outbound_connections: 0,
            inbound_connections: 0,
            rng_seed: Some(42),
            ..Config::default()
        };
        let p2p = p2p(config);
        assert_eq!(p2p.start().await, Err(Error::OperationFailed));
        p2p.close().await.unwrap();
    }

    #[test]
    fn nonce_is_never_zero() {
        let ctx = NetContext::new(
            Arc::new(Config {
                rng_seed: Some(7),
                ..Config::default()
            }),
            Arc::new(PlainCodec::new()),
            EphemeralStorage,
        );
        for _ in 0..1000 {
            assert_ne!(ctx.random_nonce(), 0);
        }
    }
}

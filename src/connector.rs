//! Single outbound dial and single listener.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Error;
use crate::pending::Stoppable;
use crate::sync::StopSignal;
use crate::transport::{Listener, Transport};
use crate::types::Authority;

/// A one-shot, stoppable dial.
///
/// The dial races `{stop, connect_timeout, transport connect}`; the
/// first completion wins and cancels the others. Registered in the
/// pending-connect collection for its lifetime so a service stop can
/// cancel in-flight dials.
pub struct Connector {
    stop: StopSignal,
    timeout: Duration,
}

impl Connector {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            stop: StopSignal::new(),
            timeout,
        })
    }

    /// Resolve and dial. Timer-first completion yields
    /// [`Error::ChannelTimeout`]; a stop yields its reason.
    pub async fn connect<T: Transport>(
        &self,
        transport: &T,
        host: &str,
        port: u16,
    ) -> Result<(T::Stream, Authority), Error> {
        if let Some(reason) = self.stop.reason() {
            return Err(reason);
        }

        tokio::select! {
            reason = self.stop.wait() => {
                debug!(host, port, "dial cancelled");
                Err(reason)
            }
            attempt = tokio::time::timeout(self.timeout, transport.connect(host, port)) => {
                match attempt {
                    Err(_elapsed) => Err(Error::ChannelTimeout),
                    Ok(result) => result,
                }
            }
        }
    }

    pub fn stop(&self, reason: Error) {
        self.stop.stop(reason);
    }
}

impl Stoppable for Connector {
    fn stop(&self, reason: Error) {
        Connector::stop(self, reason);
    }
}

/// Accept side: a bound listener raced against the service stop.
pub struct Acceptor<L> {
    listener: L,
    stop: StopSignal,
}

impl<L: Listener> Acceptor<L> {
    pub fn new(listener: L, stop: StopSignal) -> Self {
        Self { listener, stop }
    }

    pub fn local_addr(&self) -> Authority {
        self.listener.local_addr()
    }

    pub async fn accept(&mut self) -> Result<(L::Stream, Authority), Error> {
        tokio::select! {
            reason = self.stop.wait() => Err(reason),
            accepted = self.listener.accept() => accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNet;

    #[tokio::test(start_paused = true)]
    async fn dial_times_out_against_a_black_hole() {
        // No listener and no reachable fabric entry would fail fast in
        // the memory transport, so race a dial that never resolves.
        struct BlackHole;

        impl Transport for BlackHole {
            type Stream = tokio::io::DuplexStream;
            type Listener = crate::transport::memory::MemoryListener;

            async fn connect(
                &self,
                _host: &str,
                _port: u16,
            ) -> Result<(Self::Stream, Authority), Error> {
                std::future::pending().await
            }

            async fn bind(&self, _bind: Authority) -> Result<Self::Listener, Error> {
                unimplemented!("accept is not under test")
            }
        }

        let connector = Connector::new(Duration::from_millis(250));
        let result = connector.connect(&BlackHole, "10.0.0.1", 8333).await;
        assert_eq!(result.err(), Some(Error::ChannelTimeout));
    }

    #[tokio::test]
    async fn stop_cancels_the_dial() {
        let net = MemoryNet::new();
        let transport = net.endpoint("10.0.0.2".parse().unwrap());

        let connector = Connector::new(Duration::from_secs(5));
        connector.stop(Error::ServiceStopped);

        let result = connector.connect(&transport, "10.0.0.1", 8333).await;
        assert_eq!(result.err(), Some(Error::ServiceStopped));
    }

    #[tokio::test]
    async fn successful_dial_returns_the_authority() {
        let net = MemoryNet::new();
        let server = net.endpoint("10.0.0.1".parse().unwrap());
        let client = net.endpoint("10.0.0.2".parse().unwrap());

        let _listener = server.bind("10.0.0.1:8333".parse().unwrap()).await.unwrap();

        let connector = Connector::new(Duration::from_secs(5));
        let (_stream, authority) = connector
            .connect(&client, "10.0.0.1", 8333)
            .await
            .unwrap();
        assert_eq!(authority, "10.0.0.1:8333".parse().unwrap());
    }

    #[tokio::test]
    async fn acceptor_races_service_stop() {
        let net = MemoryNet::new();
        let server = net.endpoint("10.0.0.1".parse().unwrap());
        let listener = server.bind("10.0.0.1:8333".parse().unwrap()).await.unwrap();

        let stop = StopSignal::new();
        let mut acceptor = Acceptor::new(listener, stop.clone());

        stop.stop(Error::ServiceStopped);
        assert_eq!(acceptor.accept().await.err(), Some(Error::ServiceStopped));
    }
}

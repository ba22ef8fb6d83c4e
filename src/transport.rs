//! Socket plumbing interface.
//!
//! TCP accept/connect is external to the connection stack; sessions
//! consume it through [`Transport`]. [`TcpTransport`] is the production
//! implementation; [`memory::MemoryNet`] provides an in-process network
//! for deterministic tests and simulation.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::Error;
use crate::types::Authority;

/// Asynchronous dial and listen.
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Listener: Listener<Stream = Self::Stream>;

    /// Resolve `host` and dial `port`. Resolution failure is
    /// [`Error::ResolveFailed`]; a refused or failed dial is
    /// [`Error::OperationFailed`].
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<(Self::Stream, Authority), Error>> + Send;

    /// Bind a listener on the given endpoint.
    fn bind(&self, bind: Authority)
        -> impl Future<Output = Result<Self::Listener, Error>> + Send;
}

/// Accept side of a bound transport.
pub trait Listener: Send + 'static {
    type Stream;

    fn accept(&mut self) -> impl Future<Output = Result<(Self::Stream, Authority), Error>> + Send;

    fn local_addr(&self) -> Authority;
}

/// Tokio TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpAcceptListener;

    async fn connect(&self, host: &str, port: u16) -> Result<(TcpStream, Authority), Error> {
        let resolved: Vec<_> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| Error::ResolveFailed)?
            .collect();

        if resolved.is_empty() {
            return Err(Error::ResolveFailed);
        }

        for addr in resolved {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let authority = stream.peer_addr().map(Authority::from).unwrap_or(addr.into());
                    return Ok((stream, authority));
                }
                Err(e) => debug!(%addr, "connect failed: {e}"),
            }
        }
        Err(Error::OperationFailed)
    }

    async fn bind(&self, bind: Authority) -> Result<TcpAcceptListener, Error> {
        let listener = TcpListener::bind(bind.to_socket_addr())
            .await
            .map_err(|_| Error::OperationFailed)?;
        Ok(TcpAcceptListener { listener })
    }
}

pub struct TcpAcceptListener {
    listener: TcpListener,
}

impl Listener for TcpAcceptListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> Result<(TcpStream, Authority), Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|_| Error::ServiceStopped)?;
        Ok((stream, addr.into()))
    }

    fn local_addr(&self) -> Authority {
        self.listener
            .local_addr()
            .map(Authority::from)
            .unwrap_or_else(|_| Authority::unspecified())
    }
}

pub mod memory {
    //! An in-process network of duplex pipes.

    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};

    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use super::{Listener, Transport};
    use crate::error::Error;
    use crate::types::Authority;

    /// Pipe buffer; large enough that small protocol frames never block.
    const PIPE_CAPACITY: usize = 256 * 1024;

    type Accepted = (DuplexStream, Authority);

    struct NetInner {
        names: HashMap<String, Vec<Authority>>,
        listeners: HashMap<Authority, mpsc::UnboundedSender<Accepted>>,
        next_ephemeral: u16,
    }

    /// Shared fabric connecting [`MemoryTransport`] endpoints.
    pub struct MemoryNet {
        inner: Mutex<NetInner>,
    }

    impl MemoryNet {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(NetInner {
                    names: HashMap::new(),
                    listeners: HashMap::new(),
                    next_ephemeral: 50_000,
                }),
            })
        }

        /// Map a hostname to the authorities it resolves to.
        pub fn register_name(&self, name: impl Into<String>, authorities: Vec<Authority>) {
            let mut inner = self.inner.lock().expect("memory net poisoned");
            inner.names.insert(name.into(), authorities);
        }

        /// A transport endpoint whose outbound connections originate
        /// from `local_ip`.
        pub fn endpoint(self: &Arc<Self>, local_ip: IpAddr) -> MemoryTransport {
            MemoryTransport {
                net: Arc::clone(self),
                local_ip,
            }
        }

        fn resolve(&self, host: &str, port: u16) -> Result<Vec<Authority>, Error> {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(vec![Authority::new(ip, port)]);
            }
            let inner = self.inner.lock().expect("memory net poisoned");
            inner
                .names
                .get(host)
                .cloned()
                .filter(|list| !list.is_empty())
                .ok_or(Error::ResolveFailed)
        }

        fn dial(&self, target: Authority, source: Authority) -> Result<DuplexStream, Error> {
            let mut inner = self.inner.lock().expect("memory net poisoned");
            let sender = inner.listeners.get(&target).ok_or(Error::OperationFailed)?;

            let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
            if sender.send((far, source)).is_err() {
                // Listener went away; drop the stale registration.
                inner.listeners.remove(&target);
                return Err(Error::OperationFailed);
            }
            Ok(near)
        }

        fn bind(&self, mut authority: Authority) -> Result<MemoryListener, Error> {
            let mut inner = self.inner.lock().expect("memory net poisoned");
            if authority.port == 0 {
                authority.port = inner.next_ephemeral;
                inner.next_ephemeral = inner.next_ephemeral.wrapping_add(1);
            }
            if inner.listeners.contains_key(&authority) {
                return Err(Error::OperationFailed);
            }

            let (tx, rx) = mpsc::unbounded_channel();
            inner.listeners.insert(authority, tx);
            Ok(MemoryListener { rx, authority })
        }

        fn ephemeral_port(&self) -> u16 {
            let mut inner = self.inner.lock().expect("memory net poisoned");
            let port = inner.next_ephemeral;
            inner.next_ephemeral = inner.next_ephemeral.wrapping_add(1);
            port
        }
    }

    /// One node's view of the fabric.
    #[derive(Clone)]
    pub struct MemoryTransport {
        net: Arc<MemoryNet>,
        local_ip: IpAddr,
    }

    impl Transport for MemoryTransport {
        type Stream = DuplexStream;
        type Listener = MemoryListener;

        async fn connect(&self, host: &str, port: u16) -> Result<(DuplexStream, Authority), Error> {
            let targets = self.net.resolve(host, port)?;
            let source = Authority::new(self.local_ip, self.net.ephemeral_port());

            let mut last = Error::OperationFailed;
            for target in targets {
                match self.net.dial(target, source) {
                    Ok(stream) => return Ok((stream, target)),
                    Err(e) => last = e,
                }
            }
            Err(last)
        }

        async fn bind(&self, bind: Authority) -> Result<MemoryListener, Error> {
            self.net.bind(bind)
        }
    }

    pub struct MemoryListener {
        rx: mpsc::UnboundedReceiver<Accepted>,
        authority: Authority,
    }

    impl Listener for MemoryListener {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> Result<(DuplexStream, Authority), Error> {
            self.rx.recv().await.ok_or(Error::ServiceStopped)
        }

        fn local_addr(&self) -> Authority {
            self.authority
        }
    }

}

//! Socket side of a channel: frame loops and typed dispatch.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::codec::Codec;
use crate::error::Error;
use crate::message::{Message, RejectPayload, VersionPayload};
use crate::subscriber::Subscriber;
use crate::sync::StopSignal;
use crate::types::{Authority, Link, NetworkAddress};

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// One subscriber per message type the stack consumes.
///
/// Routing happens inline in the read loop, so cross-type ordering is
/// wire order and per-type delivery is FIFO.
pub struct Topics {
    pub version: Subscriber<VersionPayload>,
    pub verack: Subscriber<()>,
    pub ping: Subscriber<Option<u64>>,
    pub pong: Subscriber<u64>,
    pub address: Subscriber<Vec<NetworkAddress>>,
    pub get_address: Subscriber<()>,
    pub reject: Subscriber<RejectPayload>,
}

impl Topics {
    fn new() -> Self {
        Self {
            version: Subscriber::new(),
            verack: Subscriber::new(),
            ping: Subscriber::new(),
            pong: Subscriber::new(),
            address: Subscriber::new(),
            get_address: Subscriber::new(),
            reject: Subscriber::new(),
        }
    }

    fn route(&self, message: Message) {
        match message {
            Message::Version(payload) => self.version.relay(payload),
            Message::Verack => self.verack.relay(()),
            Message::Ping { nonce } => self.ping.relay(nonce),
            Message::Pong { nonce } => self.pong.relay(nonce),
            Message::Address(addresses) => self.address.relay(addresses),
            Message::GetAddress => self.get_address.relay(()),
            Message::Reject(payload) => self.reject.relay(payload),
        }
    }

    fn stop(&self, reason: Error) {
        self.version.stop(reason);
        self.verack.stop(reason);
        self.ping.stop(reason);
        self.pong.stop(reason);
        self.address.stop(reason);
        self.get_address.stop(reason);
        self.reject.stop(reason);
    }
}

struct WriteRequest {
    frame: Vec<u8>,
    command: &'static str,
    done: oneshot::Sender<Result<(), Error>>,
}

struct ProxyIo {
    reader: BoxRead,
    writer: BoxWrite,
    writer_rx: mpsc::UnboundedReceiver<WriteRequest>,
}

/// Frame read/write machinery around one stream.
pub struct Proxy {
    authority: Authority,
    link: Link,
    codec: Arc<dyn Codec>,
    topics: Topics,
    stop: StopSignal,
    writer_tx: mpsc::UnboundedSender<WriteRequest>,
    /// Held until `start` hands the halves to the I/O tasks.
    io: Mutex<Option<ProxyIo>>,
}

impl Proxy {
    pub fn new<S>(stream: S, authority: Authority, link: Link, codec: Arc<dyn Codec>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            authority,
            link,
            codec,
            topics: Topics::new(),
            stop: StopSignal::new(),
            writer_tx,
            io: Mutex::new(Some(ProxyIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
                writer_rx,
            })),
        })
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn stop_reason(&self) -> Option<Error> {
        self.stop.reason()
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Resolves with the stop reason once the proxy stops.
    pub async fn stopped(&self) -> Error {
        self.stop.wait().await
    }

    /// Begin the frame loops. `activity` is signalled on every decoded
    /// inbound frame.
    pub fn start(
        self: &Arc<Self>,
        activity: watch::Sender<tokio::time::Instant>,
    ) -> Result<(), Error> {
        let io = self
            .io
            .lock()
            .expect("proxy io poisoned")
            .take()
            .ok_or(Error::OperationFailed)?;

        if self.is_stopped() {
            return Err(self.stop_reason().unwrap_or(Error::ChannelStopped));
        }

        let proxy = Arc::clone(self);
        tokio::spawn(read_loop(proxy, io.reader, activity));

        let proxy = Arc::clone(self);
        tokio::spawn(write_loop(proxy, io.writer, io.writer_rx));

        Ok(())
    }

    /// Encode and enqueue a message; resolves once written. Writes are
    /// serialized per channel by the write loop.
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        if let Some(reason) = self.stop_reason() {
            return Err(reason);
        }

        let frame = self.codec.encode(&message)?;
        let command = message.command();
        let (done, receipt) = oneshot::channel();

        self.writer_tx
            .send(WriteRequest {
                frame,
                command,
                done,
            })
            .map_err(|_| self.stop_reason().unwrap_or(Error::ChannelStopped))?;

        match receipt.await {
            Ok(result) => result,
            Err(_) => Err(self.stop_reason().unwrap_or(Error::ChannelStopped)),
        }
    }

    /// Idempotent stop: cancels the loops and delivers `reason` to
    /// every live subscriber, then to the stop waiters.
    pub fn stop(&self, reason: Error) {
        if self.stop.stop(reason) {
            debug!(authority = %self.authority, %reason, "channel stopping");
            self.topics.stop(reason);
        }
    }
}

async fn read_loop(
    proxy: Arc<Proxy>,
    mut reader: BoxRead,
    activity: watch::Sender<tokio::time::Instant>,
) {
    let header_len = proxy.codec.header_len();
    let mut header = vec![0u8; header_len];

    loop {
        tokio::select! {
            _ = proxy.stop.wait() => return,
            read = reader.read_exact(&mut header) => {
                if read.is_err() {
                    // Peer closed or the socket failed.
                    proxy.stop(Error::ChannelStopped);
                    return;
                }
            }
        }

        let frame = match proxy.codec.decode_header(&header) {
            Ok(frame) => frame,
            Err(reason) => {
                proxy.stop(reason);
                return;
            }
        };

        let mut payload = vec![0u8; frame.payload_len];
        tokio::select! {
            _ = proxy.stop.wait() => return,
            read = reader.read_exact(&mut payload) => {
                if read.is_err() {
                    proxy.stop(Error::ChannelStopped);
                    return;
                }
            }
        }

        let message = match proxy.codec.decode_payload(&frame.command, &payload) {
            Ok(message) => message,
            Err(reason) => {
                debug!(
                    authority = %proxy.authority,
                    command = %frame.command,
                    "undecodable payload"
                );
                proxy.stop(reason);
                return;
            }
        };

        trace!(authority = %proxy.authority, command = message.command(), "received");
        activity.send_replace(tokio::time::Instant::now());
        proxy.topics.route(message);
    }
}

async fn write_loop(
    proxy: Arc<Proxy>,
    mut writer: BoxWrite,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
) {
    loop {
        let request = tokio::select! {
            reason = proxy.stop.wait() => {
                // Fail whatever is still queued.
                while let Ok(request) = requests.try_recv() {
                    let _ = request.done.send(Err(reason));
                }
                return;
            }
            request = requests.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let result = async {
            writer
                .write_all(&request.frame)
                .await
                .map_err(|_| Error::ChannelStopped)?;
            writer.flush().await.map_err(|_| Error::ChannelStopped)
        }
        .await;

        match result {
            Ok(()) => {
                trace!(authority = %proxy.authority, command = request.command, "sent");
                let _ = request.done.send(Ok(()));
            }
            Err(reason) => {
                let _ = request.done.send(Err(reason));
                proxy.stop(reason);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainCodec;

    fn proxy_pair() -> (Arc<Proxy>, Arc<Proxy>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let codec: Arc<dyn Codec> = Arc::new(PlainCodec::new());
        let a = Proxy::new(
            near,
            "10.0.0.2:8333".parse().unwrap(),
            Link::Outbound,
            Arc::clone(&codec),
        );
        let b = Proxy::new(far, "10.0.0.1:50000".parse().unwrap(), Link::Inbound, codec);
        (a, b)
    }

    fn activity() -> watch::Sender<tokio::time::Instant> {
        watch::channel(tokio::time::Instant::now()).0
    }

    #[tokio::test]
    async fn routes_by_message_type() {
        let (a, b) = proxy_pair();
        a.start(activity()).unwrap();
        b.start(activity()).unwrap();

        let mut pings = b.topics().ping.subscribe();
        let mut pongs = b.topics().pong.subscribe();

        a.send(Message::Ping { nonce: Some(1) }).await.unwrap();
        a.send(Message::Pong { nonce: 2 }).await.unwrap();
        a.send(Message::Ping { nonce: Some(3) }).await.unwrap();

        assert_eq!(pings.recv().await, Ok(Some(1)));
        assert_eq!(pings.recv().await, Ok(Some(3)));
        assert_eq!(pongs.recv().await, Ok(2));
    }

    #[tokio::test]
    async fn stop_reaches_subscribers_and_send() {
        let (a, _b) = proxy_pair();
        a.start(activity()).unwrap();

        let mut verack = a.topics().verack.subscribe();
        a.stop(Error::ChannelTimeout);
        a.stop(Error::BadStream);

        assert_eq!(verack.recv().await, Err(Error::ChannelTimeout));
        assert_eq!(
            a.send(Message::Verack).await,
            Err(Error::ChannelTimeout)
        );
        assert_eq!(a.stopped().await, Error::ChannelTimeout);
    }

    #[tokio::test]
    async fn peer_close_stops_channel() {
        let (a, b) = proxy_pair();
        a.start(activity()).unwrap();
        drop(b); // peer goes away

        assert_eq!(a.stopped().await, Error::ChannelStopped);
    }

    #[tokio::test]
    async fn undecodable_frame_is_bad_stream() {
        let (near, far) = tokio::io::duplex(1024);
        let codec: Arc<dyn Codec> = Arc::new(PlainCodec::new());
        let proxy = Proxy::new(
            near,
            "10.0.0.2:8333".parse().unwrap(),
            Link::Inbound,
            codec,
        );
        proxy.start(activity()).unwrap();

        use tokio::io::AsyncWriteExt;
        let mut far = far;
        far.write_all(&[0u8; 64]).await.unwrap();

        assert_eq!(proxy.stopped().await, Error::BadStream);
    }

    #[tokio::test]
    async fn double_start_fails() {
        let (a, _b) = proxy_pair();
        a.start(activity()).unwrap();
        assert_eq!(a.start(activity()), Err(Error::OperationFailed));
    }
}

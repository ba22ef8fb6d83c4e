//! Typed publish/subscribe with stop propagation.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::Error;

struct Inner<M> {
    stopped: Option<Error>,
    senders: Vec<mpsc::UnboundedSender<M>>,
}

/// Fan-out of one message type to any number of subscriptions.
///
/// Delivery is FIFO per subscription, in relay order. Stopping closes
/// every subscription with the stop reason; subscribing after stop
/// observes the reason immediately.
pub struct Subscriber<M> {
    inner: Arc<Mutex<Inner<M>>>,
}

/// One subscriber's queue. Remains subscribed until dropped.
pub struct Subscription<M> {
    rx: mpsc::UnboundedReceiver<M>,
    inner: Arc<Mutex<Inner<M>>>,
}

impl<M: Clone + Send + 'static> Subscriber<M> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stopped: None,
                senders: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock().expect("subscriber poisoned");
        if inner.stopped.is_none() {
            inner.senders.push(tx);
        }
        // On a stopped subscriber the sender drops here and the
        // subscription resolves with the stop reason at once.

        Subscription {
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Deliver a message to every live subscription.
    pub fn relay(&self, message: M) {
        let mut inner = self.inner.lock().expect("subscriber poisoned");
        if inner.stopped.is_some() {
            return;
        }
        inner
            .senders
            .retain(|sender| sender.send(message.clone()).is_ok());
    }

    /// Close all subscriptions with `reason`. Idempotent; returns true
    /// for the first caller.
    pub fn stop(&self, reason: Error) -> bool {
        let mut inner = self.inner.lock().expect("subscriber poisoned");
        if inner.stopped.is_some() {
            return false;
        }
        inner.stopped = Some(reason);
        inner.senders.clear();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().expect("subscriber poisoned").stopped.is_some()
    }

    /// Re-arm after a stop, for service-lifetime subscribers.
    pub(crate) fn reopen(&self) {
        let mut inner = self.inner.lock().expect("subscriber poisoned");
        inner.stopped = None;
    }
}

impl<M: Clone + Send + 'static> Default for Subscriber<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Subscription<M> {
    /// The next message, or the stop reason once the subscriber stops.
    ///
    /// Messages relayed before the stop are drained first, preserving
    /// arrival order.
    pub async fn recv(&mut self) -> Result<M, Error> {
        match self.rx.recv().await {
            Some(message) => Ok(message),
            None => {
                let inner = self.inner.lock().expect("subscriber poisoned");
                Err(inner.stopped.unwrap_or(Error::ServiceStopped))
            }
        }
    }
}

//! Tracked object collections with stop propagation.

use std::sync::{Arc, Mutex};

use crate::error::Error;

/// Anything a pending collection can broadcast a stop to.
pub trait Stoppable: Send + Sync {
    fn stop(&self, reason: Error);
}

struct Inner<T> {
    closed: Option<Error>,
    items: Vec<Arc<T>>,
}

/// A thread-safe set of tracked objects.
///
/// Used for in-flight dials, channels mid-handshake (searched by nonce)
/// and adopted channels (deduplicated by authority). Stopping the
/// collection broadcasts the stop to every element and refuses further
/// stores.
pub struct Pending<T> {
    /// Equality for dedup on store; `None` admits everything.
    dedup: Option<fn(&T, &T) -> bool>,
    inner: Mutex<Inner<T>>,
}

impl<T: Stoppable> Pending<T> {
    pub fn new() -> Self {
        Self {
            dedup: None,
            inner: Mutex::new(Inner {
                closed: None,
                items: Vec::new(),
            }),
        }
    }

    pub fn with_dedup(dedup: fn(&T, &T) -> bool) -> Self {
        Self {
            dedup: Some(dedup),
            ..Self::new()
        }
    }

    /// Insert unless closed or a dedup-matching element already exists.
    pub fn store(&self, item: &Arc<T>) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("pending poisoned");

        if inner.closed.is_some() {
            return Err(Error::ServiceStopped);
        }

        if let Some(eq) = self.dedup {
            if inner.items.iter().any(|existing| eq(existing, item)) {
                return Err(Error::AddressInUse);
            }
        }

        inner.items.push(Arc::clone(item));
        Ok(())
    }

    /// Whether any element matches the predicate.
    pub fn exists<F: Fn(&T) -> bool>(&self, predicate: F) -> bool {
        let inner = self.inner.lock().expect("pending poisoned");
        inner.items.iter().any(|item| predicate(item))
    }

    /// Remove by identity. Idempotent.
    pub fn remove(&self, item: &Arc<T>) {
        let mut inner = self.inner.lock().expect("pending poisoned");
        inner.items.retain(|existing| !Arc::ptr_eq(existing, item));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the collection and stop every element.
    ///
    /// The element list is snapshotted and the lock released before any
    /// element stop runs, so a stop handler that calls back into
    /// [`Pending::remove`] cannot deadlock.
    pub fn stop(&self, reason: Error) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("pending poisoned");
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(reason);
            std::mem::take(&mut inner.items)
        };

        for item in snapshot {
            item.stop(reason);
        }
    }

    /// Re-open after a stop, for service restart.
    pub(crate) fn reopen(&self) {
        let mut inner = self.inner.lock().expect("pending poisoned");
        inner.closed = None;
    }
}

impl<T: Stoppable> Default for Pending<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Tracked {
        id: u32,
        stops: AtomicUsize,
    }

    impl Tracked {
        fn new(id: u32) -> Arc<Self> {
            Arc::new(Self {
                id,
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl Stoppable for Tracked {
        fn stop(&self, _reason: Error) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn store_remove_store() {
        let pending = Pending::new();
        let item = Tracked::new(1);

        assert_eq!(pending.store(&item), Ok(()));
        pending.remove(&item);
        pending.remove(&item);
        assert_eq!(pending.store(&item), Ok(()));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn dedup_rejects_duplicates() {
        let pending = Pending::with_dedup(|a: &Tracked, b: &Tracked| a.id == b.id);
        let first = Tracked::new(7);
        let duplicate = Tracked::new(7);
        let other = Tracked::new(8);

        assert_eq!(pending.store(&first), Ok(()));
        assert_eq!(pending.store(&duplicate), Err(Error::AddressInUse));
        assert_eq!(pending.store(&other), Ok(()));
    }

    #[test]
    fn stop_broadcasts_once_and_closes() {
        let pending = Pending::new();
        let item = Tracked::new(1);
        pending.store(&item).unwrap();

        pending.stop(Error::ServiceStopped);
        pending.stop(Error::ServiceStopped);

        assert_eq!(item.stops.load(Ordering::SeqCst), 1);
        assert_eq!(pending.len(), 0);
        assert_eq!(pending.store(&item), Err(Error::ServiceStopped));
    }

    #[test]
    fn exists_matches_predicate() {
        let pending = Pending::new();
        let item = Tracked::new(3);
        pending.store(&item).unwrap();

        assert!(pending.exists(|t| t.id == 3));
        assert!(!pending.exists(|t| t.id == 4));
    }
}

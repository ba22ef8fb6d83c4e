//! Synchronization primitives shared across the stack.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::Error;

/// One-shot stop latch carrying the stop reason.
///
/// Cancellation is cooperative: `stop` flips the latch and wakes every
/// waiter; in-flight work observes the latch before doing anything
/// useful. Cloning yields a handle onto the same latch.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<Option<Error>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(None).0),
        }
    }

    /// Latch the stop reason. Returns true for the first caller only.
    pub fn stop(&self, reason: Error) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<Error> {
        *self.tx.borrow()
    }

    /// Resolves with the stop reason, immediately if already stopped.
    pub async fn wait(&self) -> Error {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return Error::ServiceStopped;
            }
        }
    }

    /// Re-arm the latch for a fresh service generation.
    pub(crate) fn reset(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum Policy {
    /// Resolve `Ok` after n successes; any failure resolves immediately.
    Count(usize),
    /// Resolve `Ok` on the first success; resolve with the last error
    /// once all n legs have failed.
    FirstSuccess(usize),
}

#[derive(Debug)]
struct JoinState {
    policy: Policy,
    successes: usize,
    failures: usize,
    resolved: bool,
}

/// Collapses N asynchronous completions into a single resolution.
///
/// The resolution fires exactly once; completions arriving after it are
/// no-ops, which is what lets a timer expiry beat a later dial success
/// (and vice versa) without double delivery.
#[derive(Debug, Clone)]
pub struct Join {
    tx: Arc<watch::Sender<Option<Result<(), Error>>>>,
    state: Arc<Mutex<JoinState>>,
}

impl Join {
    /// Requires `expected` successes; terminates early on first failure.
    pub fn count(expected: usize) -> Self {
        Self::with_policy(Policy::Count(expected))
    }

    /// Resolves on first success out of `expected` legs.
    pub fn first_success(expected: usize) -> Self {
        Self::with_policy(Policy::FirstSuccess(expected))
    }

    fn with_policy(policy: Policy) -> Self {
        Self {
            tx: Arc::new(watch::channel(None).0),
            state: Arc::new(Mutex::new(JoinState {
                policy,
                successes: 0,
                failures: 0,
                resolved: false,
            })),
        }
    }

    /// Record one successful completion.
    pub fn success(&self) {
        let resolution = {
            let mut state = self.state.lock().expect("join state poisoned");
            if state.resolved {
                return;
            }
            state.successes += 1;
            match state.policy {
                Policy::Count(expected) if state.successes >= expected => {
                    state.resolved = true;
                    Some(Ok(()))
                }
                Policy::FirstSuccess(_) => {
                    state.resolved = true;
                    Some(Ok(()))
                }
                _ => None,
            }
        };

        if let Some(result) = resolution {
            self.tx.send_replace(Some(result));
        }
    }

    /// Record one failed completion.
    pub fn failure(&self, reason: Error) {
        let resolution = {
            let mut state = self.state.lock().expect("join state poisoned");
            if state.resolved {
                return;
            }
            state.failures += 1;
            match state.policy {
                Policy::Count(_) => {
                    state.resolved = true;
                    Some(Err(reason))
                }
                Policy::FirstSuccess(expected) if state.failures >= expected => {
                    state.resolved = true;
                    Some(Err(reason))
                }
                _ => None,
            }
        };

        if let Some(result) = resolution {
            self.tx.send_replace(Some(result));
        }
    }

    /// The resolution, if it has fired.
    pub fn try_result(&self) -> Option<Result<(), Error>> {
        *self.tx.borrow()
    }

    /// Await the resolution.
    pub async fn wait(&self) -> Result<(), Error> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(result) = *rx.borrow() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(Error::ServiceStopped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_signal_first_caller_wins() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());
        assert!(signal.stop(Error::ChannelTimeout));
        assert!(!signal.stop(Error::BadStream));
        assert_eq!(signal.reason(), Some(Error::ChannelTimeout));
        assert_eq!(signal.wait().await, Error::ChannelTimeout);
    }

    #[tokio::test]
    async fn join_count_requires_all_successes() {
        let join = Join::count(2);
        join.success();
        assert_eq!(join.try_result(), None);
        join.success();
        assert_eq!(join.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn join_count_terminates_on_error() {
        let join = Join::count(2);
        join.failure(Error::ChannelTimeout);
        assert_eq!(join.wait().await, Err(Error::ChannelTimeout));

        // Late success is a no-op.
        join.success();
        assert_eq!(join.try_result(), Some(Err(Error::ChannelTimeout)));
    }

    #[tokio::test]
    async fn join_first_success_wins_over_failures() {
        let join = Join::first_success(3);
        join.failure(Error::NotFound);
        join.failure(Error::AddressBlocked);
        assert_eq!(join.try_result(), None);
        join.success();
        assert_eq!(join.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn join_first_success_reports_last_error() {
        let join = Join::first_success(2);
        join.failure(Error::NotFound);
        join.failure(Error::AddressBlocked);
        assert_eq!(join.wait().await, Err(Error::AddressBlocked));
    }
}

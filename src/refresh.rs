//! Single-flight coordination of token refreshes
//!
//! At most one refresh is outstanding at a time. The first caller to ask becomes the leader and
//! starts the refresh; everyone arriving while it runs is queued as a waiter. The leader is
//! queued too, so every caller of a cycle reads the same outcome from the same queue. Settling
//! clears the in-progress flag and drains the queue in one step under the lock, so a waiter can
//! never observe the result of a different refresh cycle.

use crate::error::ClientError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// New access token, or the error every caller of the failed cycle shares
pub type RefreshOutcome = std::result::Result<String, Arc<ClientError>>;

#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// What a caller should do after [`RefreshCoordinator::join`]
pub enum RefreshTicket {
    /// No refresh was running; the caller must start one that settles `guard`, then await
    /// `waiter` like everyone else
    Leader {
        guard: RefreshGuard,
        waiter: RefreshWaiter,
    },
    /// A refresh is already running; await its outcome
    Waiter(RefreshWaiter),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the refresh leader, or queue behind the refresh already in progress
    pub fn join(self: &Arc<Self>) -> RefreshTicket {
        let mut state = self.state.lock();
        let (tx, rx) = oneshot::channel();
        state.waiters.push(tx);
        let waiter = RefreshWaiter { rx };

        if state.in_progress {
            debug!(queued = state.waiters.len(), "Queued behind in-flight token refresh");
            RefreshTicket::Waiter(waiter)
        } else {
            state.in_progress = true;
            RefreshTicket::Leader {
                guard: RefreshGuard {
                    coordinator: Arc::clone(self),
                    settled: false,
                },
                waiter,
            }
        }
    }

    fn settle(&self, outcome: RefreshOutcome) {
        let mut state = self.state.lock();
        state.in_progress = false;
        let waiters = std::mem::take(&mut state.waiters);
        debug!(
            waiters = waiters.len(),
            success = outcome.is_ok(),
            "Token refresh settled"
        );
        for waiter in waiters {
            // A waiter whose caller went away has nobody left to tell
            let _ = waiter.send(outcome.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().waiters.len()
    }

    #[cfg(test)]
    pub(crate) fn is_refreshing(&self) -> bool {
        self.state.lock().in_progress
    }
}

/// Owned by the task performing one refresh.
///
/// Dropping it unsettled (the refresh task panicked or its runtime shut down) rejects the
/// queued callers with [`ClientError::RefreshAborted`] and clears the flag.
pub struct RefreshGuard {
    coordinator: Arc<RefreshCoordinator>,
    settled: bool,
}

impl RefreshGuard {
    pub fn finish(mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.coordinator.settle(outcome);
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator
                .settle(Err(Arc::new(ClientError::RefreshAborted)));
        }
    }
}

pub struct RefreshWaiter {
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl RefreshWaiter {
    pub async fn wait(self) -> RefreshOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Arc::new(ClientError::RefreshAborted)))
    }
}

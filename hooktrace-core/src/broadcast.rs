//! Update broadcaster
//!
//! Fan-out of [`TraceUpdate`] deltas to subscribers. Each subscriber owns the
//! receiving half of a bounded channel; delivery is `try_send`, fire-and-forget
//! and at-most-once, so one slow subscriber can never stall the mutation path
//! or the other subscribers. A subscriber whose channel is full or closed is
//! dropped on the spot; transport-level liveness probing lives in the server,
//! which releases the channel and lets the next prune observe it.
//!
//! Interest starts out undeclared, and an undeclared subscriber receives
//! every delta. This default-open behavior prevents losing the initial burst
//! of events that can arrive before a client has sent its first subscription
//! message.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::types::TraceUpdate;

/// Outbound channel capacity per subscriber.
const CHANNEL_CAPACITY: usize = 256;

pub type SubscriberId = u64;

/// What a subscriber has declared interest in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Nothing declared yet: receives everything (default open)
    Unset,
    /// Everything, explicitly
    All,
    /// A specific set of run ids
    Runs(HashSet<String>),
}

impl Interest {
    fn matches(&self, run_id: &str) -> bool {
        match self {
            Interest::Unset | Interest::All => true,
            Interest::Runs(runs) => runs.contains(run_id),
        }
    }
}

struct Subscriber {
    id: SubscriberId,
    interest: Interest,
    tx: mpsc::Sender<TraceUpdate>,
}

struct Inner {
    next_id: SubscriberId,
    subscribers: Vec<Subscriber>,
}

/// Pub/sub registry for trace deltas.
pub struct Broadcaster {
    inner: Mutex<Inner>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Register a subscriber with no declared interest yet.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<TraceUpdate>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            interest: Interest::Unset,
            tx,
        });
        (id, rx)
    }

    /// Remove a subscriber and release its channel.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock().subscribers.retain(|s| s.id != id);
    }

    /// Declare interest in one run. Replaces a wildcard or undeclared
    /// interest with an explicit set.
    pub fn subscribe_run(&self, id: SubscriberId, run_id: &str) {
        let mut inner = self.lock();
        if let Some(sub) = inner.subscribers.iter_mut().find(|s| s.id == id) {
            match &mut sub.interest {
                Interest::Runs(runs) => {
                    runs.insert(run_id.to_string());
                }
                _ => {
                    sub.interest = Interest::Runs(HashSet::from([run_id.to_string()]));
                }
            }
        }
    }

    /// Withdraw interest in one run. No-op for wildcard subscribers.
    pub fn unsubscribe_run(&self, id: SubscriberId, run_id: &str) {
        let mut inner = self.lock();
        if let Some(sub) = inner.subscribers.iter_mut().find(|s| s.id == id) {
            if let Interest::Runs(runs) = &mut sub.interest {
                runs.remove(run_id);
            }
        }
    }

    /// Declare interest in everything.
    pub fn subscribe_all(&self, id: SubscriberId) {
        let mut inner = self.lock();
        if let Some(sub) = inner.subscribers.iter_mut().find(|s| s.id == id) {
            sub.interest = Interest::All;
        }
    }

    /// Deliver one delta to every matching subscriber.
    ///
    /// Called strictly after the originating mutation has committed. Never
    /// blocks: a full or closed channel drops its subscriber.
    pub fn publish(&self, update: &TraceUpdate) {
        let run_id = update.run_id();
        let mut inner = self.lock();
        inner.subscribers.retain(|sub| {
            if !sub.interest.matches(run_id) {
                return true;
            }
            match sub.tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = sub.id, "Subscriber too slow, dropping");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = sub.id, "Subscriber gone, dropping");
                    false
                }
            }
        });
    }

    /// Drop subscribers whose receiving half has been released.
    pub fn prune_closed(&self) {
        self.lock().subscribers.retain(|s| !s.tx.is_closed());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The registry lock is never held across await points
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

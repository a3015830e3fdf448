//! Demand-based subscriptions with a separate completion signal
//!
//! A [`Subscription`] is the usual flow-control contract: the subscriber
//! requests items and may cancel. A [`CompletionSubscription`] additionally
//! lets the subscriber report that every asynchronous unit of work for every
//! delivered item has finished. That is distinct from the producer telling the
//! subscriber that no more items will arrive.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use crate::error::{FlowError, FlowResult};

/// Demand and cancellation, as seen by a subscriber.
pub trait Subscription: Send + Sync {
    /// Permit the producer to deliver `n` more items.
    fn request(&self, n: usize);

    /// Stop delivery. Already dispatched work is not interrupted.
    fn cancel(&self);
}

/// A [`Subscription`] which additionally signals completion of ALL the
/// downstream processing.
///
/// Implementations fire at most one of `complete` and `cancel`; whichever
/// comes first wins and the other becomes a no-op.
pub trait CompletionSubscription: Subscription {
    /// Invoked once processing of every delivered item has completed.
    fn complete(&self);
}

/// Receiver of items under a [`CompletionSubscription`].
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn CompletionSubscription>);

    fn on_next(&self, item: T);

    /// The producer failed; no more items will arrive.
    fn on_error(&self, error: FlowError);

    /// The producer is exhausted; no more items will arrive.
    fn on_complete(&self);
}

/// Terminal state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Active,
    Completed,
    Cancelled,
}

const ACTIVE: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

impl TerminalState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            COMPLETED => TerminalState::Completed,
            CANCELLED => TerminalState::Cancelled,
            _ => TerminalState::Active,
        }
    }
}

/// Producer-side [`CompletionSubscription`] tracking outstanding demand.
///
/// The paired [`Completion`] resolves when the subscriber completes or
/// cancels the subscription.
pub struct DemandSubscription {
    id: Uuid,
    demand: AtomicUsize,
    state: AtomicU8,
    signal: Notify,
    outcome: Mutex<Option<oneshot::Sender<FlowResult<()>>>>,
    producer_error: Mutex<Option<FlowError>>,
}

impl DemandSubscription {
    pub fn new() -> (Arc<Self>, Completion) {
        let (tx, rx) = oneshot::channel();
        let subscription = Arc::new(Self {
            id: Uuid::new_v4(),
            demand: AtomicUsize::new(0),
            state: AtomicU8::new(ACTIVE),
            signal: Notify::new(),
            outcome: Mutex::new(Some(tx)),
            producer_error: Mutex::new(None),
        });
        (subscription, Completion { rx })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TerminalState {
        TerminalState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_terminated(&self) -> bool {
        self.state() != TerminalState::Active
    }

    /// Demand not yet consumed by delivered items.
    pub fn demand(&self) -> usize {
        self.demand.load(Ordering::Acquire)
    }

    /// Consume one unit of demand if any is available.
    pub fn try_take_demand(&self) -> bool {
        self.demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok()
    }

    /// Wait for one unit of demand and consume it. Returns `false` once the
    /// subscription has terminated.
    pub async fn acquire_demand(&self) -> bool {
        loop {
            let notified = self.signal.notified();
            if self.is_terminated() {
                return false;
            }
            if self.try_take_demand() {
                return true;
            }
            notified.await;
        }
    }

    /// Wait until there is demand, without consuming it. Returns `false` once
    /// the subscription has terminated.
    pub async fn demand_available(&self) -> bool {
        loop {
            let notified = self.signal.notified();
            if self.is_terminated() {
                return false;
            }
            if self.demand() > 0 {
                return true;
            }
            notified.await;
        }
    }

    /// Resolves once the subscription has been completed or cancelled.
    pub async fn terminated(&self) {
        loop {
            let notified = self.signal.notified();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }

    /// Remember a producer failure; the completion future reports it once the
    /// subscriber has drained.
    pub fn record_producer_error(&self, error: FlowError) {
        let mut slot = self
            .producer_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(error);
    }

    fn terminate(&self, target: u8) -> bool {
        self.state
            .compare_exchange(ACTIVE, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn resolve(&self, outcome: FlowResult<()>) {
        let sender = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // the caller may have dropped the completion future; nothing to report to
            let _ = sender.send(outcome);
        }
        self.signal.notify_waiters();
    }
}

impl Subscription for DemandSubscription {
    fn request(&self, n: usize) {
        if n == 0 || self.is_terminated() {
            return;
        }
        let _ = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_add(n))
            });
        log::debug!("Subscription {} granted {} more items", self.id, n);
        self.signal.notify_waiters();
    }

    fn cancel(&self) {
        if self.terminate(CANCELLED) {
            log::warn!("Subscription {} cancelled", self.id);
            self.resolve(Err(FlowError::Cancelled));
        }
    }
}

impl CompletionSubscription for DemandSubscription {
    fn complete(&self) {
        if self.terminate(COMPLETED) {
            let producer_error = self
                .producer_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            log::info!("Subscription {} completed", self.id);
            self.resolve(producer_error.map_or(Ok(()), Err));
        }
    }
}

/// Future resolving once a pipeline has drained or been cancelled.
///
/// Cancellation resolves with [`FlowError::Cancelled`]. A producer failure
/// resolves with that failure, after the in-flight items have drained.
#[must_use = "a Completion does nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<FlowResult<()>>,
}

impl Completion {
    /// A completion that has already resolved.
    pub fn ready(outcome: FlowResult<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Bound the wait. The pipeline itself keeps running after a timeout.
    pub async fn with_timeout(self, duration: Duration) -> FlowResult<()> {
        tokio::time::timeout(duration, self).await?
    }
}

impl Future for Completion {
    type Output = FlowResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(FlowError::Disconnected)))
    }
}

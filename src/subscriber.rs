//! Subscriber engine driving an [`ItemProcessor`] under back-pressure
//!
//! [`CompletionSubscriber`] delegates every delivered item to its processor
//! without waiting for earlier items to settle, caps the number of items whose
//! processing is outstanding at `max_concurrency`, and demands `chunk_size`
//! items at a time from the producer. It completes the subscription exactly
//! once, after the producer has stopped and every dispatched item has settled.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use uuid::Uuid;

use crate::config::SubscriberConfig;
use crate::error::{FlowError, FlowResult};
use crate::metrics::{FlowMetrics, MetricsSnapshot};
use crate::processor::ItemProcessor;
use crate::subscription::{CompletionSubscription, Subscriber};

/// Lifecycle of a [`CompletionSubscriber`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The producer may still deliver items.
    Active,
    /// The producer has stopped; dispatched items are still settling.
    Draining,
    Completed,
    Cancelled,
}

const MORE_ITEMS: usize = 1 << (usize::BITS - 1);

/// Outstanding-work counter packed with the "more items may arrive" flag.
///
/// Both live in one word so that the transition to "drained" (flag clear and
/// count zero) is observed by exactly one atomic operation, whether that is
/// the last settlement or the producer's own completion.
#[derive(Debug)]
struct WorkTracker {
    state: AtomicUsize,
}

impl WorkTracker {
    fn new() -> Self {
        Self {
            state: AtomicUsize::new(MORE_ITEMS),
        }
    }

    /// Returns the outstanding count including the new item.
    fn begin(&self) -> usize {
        (self.state.fetch_add(1, Ordering::AcqRel) & !MORE_ITEMS) + 1
    }

    /// Returns true if this settlement drained the pipeline.
    fn finish(&self) -> bool {
        self.state.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Returns true if closing found nothing outstanding. Idempotent.
    fn close(&self) -> bool {
        self.state.fetch_and(!MORE_ITEMS, Ordering::AcqRel) == MORE_ITEMS
    }

    fn in_flight(&self) -> usize {
        self.state.load(Ordering::Acquire) & !MORE_ITEMS
    }

    fn more_items(&self) -> bool {
        self.state.load(Ordering::Acquire) & MORE_ITEMS != 0
    }
}

const ACTIVE: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

struct Engine<P> {
    id: Uuid,
    processor: Arc<P>,
    config: SubscriberConfig,
    tracker: WorkTracker,
    /// Items requested but not yet delivered
    pending_demand: Mutex<usize>,
    terminal: AtomicU8,
    subscription: OnceLock<Arc<dyn CompletionSubscription>>,
    metrics: FlowMetrics,
}

impl<P> Engine<P>
where
    P: ItemProcessor + 'static,
{
    fn is_terminated(&self) -> bool {
        self.terminal.load(Ordering::Acquire) != ACTIVE
    }

    /// Request another chunk if no earlier request is still outstanding and
    /// the chunk fits under the concurrency ceiling.
    fn request_more(&self) {
        if self.is_terminated() || !self.tracker.more_items() {
            return;
        }
        let Some(subscription) = self.subscription.get() else {
            return;
        };
        let chunk = self.config.chunk_size;
        {
            let mut pending = self
                .pending_demand
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *pending != 0 || self.tracker.in_flight() + chunk > self.config.max_concurrency {
                return;
            }
            *pending = chunk;
        }
        self.metrics.record_request(chunk);
        log::debug!("Subscriber {} requesting {} more items", self.id, chunk);
        subscription.request(chunk);
    }

    fn complete(&self) {
        if self
            .terminal
            .compare_exchange(ACTIVE, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::info!(
                "No more items to process for {} ({}): {}",
                self.processor.name(),
                self.id,
                self.metrics.snapshot()
            );
            if let Some(subscription) = self.subscription.get() {
                subscription.complete();
            }
        }
    }

    fn cancel(&self) {
        if self
            .terminal
            .compare_exchange(ACTIVE, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::warn!(
                "Cancelling subscription of {} ({}): {}",
                self.processor.name(),
                self.id,
                self.metrics.snapshot()
            );
            if let Some(subscription) = self.subscription.get() {
                subscription.cancel();
            }
        }
    }

    async fn prepare(self: Arc<Self>) {
        let prepared = AssertUnwindSafe(self.processor.prepare())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FlowError::from_panic(panic)));
        match prepared {
            Ok(()) => {
                log::debug!("{} ({}) prepared", self.processor.name(), self.id);
                self.request_more();
            }
            Err(e) => {
                log::error!(
                    "Preparation of {} ({}) failed: {}",
                    self.processor.name(),
                    self.id,
                    e
                );
                self.cancel();
            }
        }
    }

    /// Tops up demand from the dispatched task rather than from `on_next`, so
    /// a producer that ends right after its last item closes the tracker
    /// before another chunk is asked for.
    async fn run_item(self: Arc<Self>, ordinal: u64, item: P::Item) {
        self.request_more();
        let outcome = AssertUnwindSafe(self.processor.process(item))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FlowError::from_panic(panic)));
        self.settle(ordinal, outcome.map(|_| ()));
    }

    fn settle(&self, ordinal: u64, outcome: FlowResult<()>) {
        match outcome {
            Ok(()) => {
                self.metrics.record_success();
                log::trace!("Item #{} processed by {}", ordinal, self.processor.name());
            }
            Err(e) if e.is_validation() => {
                self.metrics.record_rejection();
                log::error!(
                    "Item #{} rejected by {} ({}): {}",
                    ordinal,
                    self.processor.name(),
                    self.id,
                    e
                );
            }
            Err(e) => {
                self.metrics.record_failure();
                log::error!(
                    "Item #{} failed in {} ({}), cancelling subscription: {}",
                    ordinal,
                    self.processor.name(),
                    self.id,
                    e
                );
                self.cancel();
            }
        }
        if self.tracker.finish() {
            self.complete();
        } else {
            self.request_more();
        }
    }

    fn producer_done(&self) {
        if self.tracker.close() {
            self.complete();
        }
    }
}

/// A [`Subscriber`] employing back-pressure and concurrency limits while
/// delegating subscribed items to an [`ItemProcessor`].
///
/// Items are processed on the ambient tokio runtime; `on_subscribe` and
/// `on_next` must be called from within one.
pub struct CompletionSubscriber<P> {
    engine: Arc<Engine<P>>,
}

impl<P> Clone for CompletionSubscriber<P> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<P> CompletionSubscriber<P>
where
    P: ItemProcessor + 'static,
{
    pub fn new(processor: P, config: SubscriberConfig) -> FlowResult<Self> {
        config.validate()?;
        Ok(Self {
            engine: Arc::new(Engine {
                id: Uuid::new_v4(),
                processor: Arc::new(processor),
                config,
                tracker: WorkTracker::new(),
                pending_demand: Mutex::new(0),
                terminal: AtomicU8::new(ACTIVE),
                subscription: OnceLock::new(),
                metrics: FlowMetrics::new(),
            }),
        })
    }

    /// Wrap `processor` with the given limits.
    pub fn wrap(processor: P, max_concurrency: usize, chunk_size: usize) -> FlowResult<Self> {
        Self::new(processor, SubscriberConfig::new(max_concurrency, chunk_size))
    }

    pub fn id(&self) -> Uuid {
        self.engine.id
    }

    pub fn config(&self) -> SubscriberConfig {
        self.engine.config
    }

    /// Items whose processing is outstanding.
    pub fn in_flight(&self) -> usize {
        self.engine.tracker.in_flight()
    }

    pub fn phase(&self) -> Phase {
        match self.engine.terminal.load(Ordering::Acquire) {
            COMPLETED => Phase::Completed,
            CANCELLED => Phase::Cancelled,
            _ if self.engine.tracker.more_items() => Phase::Active,
            _ => Phase::Draining,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics.snapshot()
    }
}

impl<P> Subscriber<P::Item> for CompletionSubscriber<P>
where
    P: ItemProcessor + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn CompletionSubscription>) {
        if let Err(duplicate) = self.engine.subscription.set(subscription) {
            log::warn!(
                "Subscriber {} is already subscribed; cancelling the new subscription",
                self.engine.id
            );
            duplicate.cancel();
            return;
        }
        log::info!(
            "Subscriber {} subscribed for {}",
            self.engine.id,
            self.engine.processor.name()
        );
        tokio::spawn(Arc::clone(&self.engine).prepare());
    }

    fn on_next(&self, item: P::Item) {
        let engine = &self.engine;
        if engine.is_terminated() {
            log::warn!(
                "Subscriber {} dropped an item delivered after termination",
                engine.id
            );
            return;
        }
        let in_flight = {
            let mut pending = engine
                .pending_demand
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match pending.checked_sub(1) {
                Some(remaining) => *pending = remaining,
                None => log::warn!(
                    "Subscriber {} received an item beyond requested demand",
                    engine.id
                ),
            }
            engine.tracker.begin()
        };
        let ordinal = engine.metrics.record_received(in_flight);
        log::trace!(
            "Dispatching item #{} to {} ({} in flight)",
            ordinal,
            engine.processor.name(),
            in_flight
        );
        tokio::spawn(Arc::clone(engine).run_item(ordinal, item));
    }

    fn on_error(&self, error: FlowError) {
        log::error!(
            "Producer failed for {} ({}): {}",
            self.engine.processor.name(),
            self.engine.id,
            error
        );
        self.engine.producer_done();
    }

    fn on_complete(&self) {
        log::info!(
            "Producer completed for {} ({})",
            self.engine.processor.name(),
            self.engine.id
        );
        self.engine.producer_done();
    }
}

//! Polling publisher bridge
//!
//! Turns a source that can only be polled into a push-based publisher. Each
//! polling loop keeps up to `max_polls_per_thread` polls outstanding, moves
//! successfully polled items through an unbounded hand-off queue, and
//! publishes them into a bounded buffer read by the subscriber under demand.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::config::PollingConfig;
use crate::error::{FlowError, FlowResult};
use crate::publisher::{Publisher, StreamPublisher};
use crate::queue::Queue;
use crate::subscription::{Completion, Subscriber};

/// A repository that must be polled for items.
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    type Item: Send + 'static;

    /// One-time initialisation, run by each polling loop before its first
    /// poll. A failure terminates that loop.
    async fn init(&self) -> FlowResult<()> {
        Ok(())
    }

    /// Poll once. `Ok(None)` means nothing was ready, which is not an error.
    async fn poll(&self) -> FlowResult<Option<Self::Item>>;
}

/// Interrupts the polling loops of a [`PollingPublisher`].
///
/// Loops only stop through [`PollingHandle::shutdown`]. Dropping the
/// publisher and all of its handles first leaves the loops polling for as
/// long as the runtime lives.
pub struct PollingHandle<T> {
    shutdown: Arc<watch::Sender<bool>>,
    buffer: Queue<T>,
}

impl<T> Clone for PollingHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shutdown: Arc::clone(&self.shutdown),
            buffer: self.buffer.clone(),
        }
    }
}

impl<T> PollingHandle<T>
where
    T: Send + 'static,
{
    /// Stop every polling loop. No further polls are issued and in-flight
    /// polls are not awaited; their items are dropped. Items already
    /// buffered are still delivered, after which the publisher completes.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.buffer.close();
        log::info!("Polling shut down with {} still buffered", self.buffer.stats());
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Publishes items obtained by polling a [`PollSource`].
pub struct PollingPublisher<S: PollSource> {
    source: Arc<S>,
    config: PollingConfig,
    buffer: Queue<S::Item>,
    shutdown: Arc<watch::Sender<bool>>,
    published: Arc<AtomicU64>,
    subscribed: AtomicBool,
}

impl<S: PollSource> PollingPublisher<S> {
    pub fn new(source: S, config: PollingConfig) -> FlowResult<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            source: Arc::new(source),
            config,
            buffer: Queue::bounded(config.buffer_capacity),
            shutdown: Arc::new(shutdown),
            published: Arc::new(AtomicU64::new(0)),
            subscribed: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> PollingHandle<S::Item> {
        PollingHandle {
            shutdown: Arc::clone(&self.shutdown),
            buffer: self.buffer.clone(),
        }
    }

    /// Items handed to the publisher buffer so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> PollingConfig {
        self.config
    }
}

impl<S: PollSource> Publisher<S::Item> for PollingPublisher<S> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<S::Item>>) -> Completion {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            log::warn!("Rejecting a second subscriber to a polling publisher");
            return Completion::ready(Err(FlowError::AlreadySubscribed));
        }
        let completion = StreamPublisher::from_stream(self.buffer.dequeue()).subscribe(subscriber);
        for index in 0..self.config.polling_threads {
            let polling_loop = PollingLoop {
                index,
                source: Arc::clone(&self.source),
                gate: Arc::new(Semaphore::new(self.config.max_polls_per_thread)),
                handoff: Queue::unbounded(),
                buffer: self.buffer.clone(),
                shutdown: ShutdownSignal {
                    index,
                    receiver: self.shutdown.subscribe(),
                    orphaned: false,
                },
                published: Arc::clone(&self.published),
            };
            tokio::spawn(polling_loop.run());
        }
        log::info!(
            "Polling publisher subscribed with {} loops of {} polls each",
            self.config.polling_threads,
            self.config.max_polls_per_thread
        );
        completion
    }
}

struct PollingLoop<S: PollSource> {
    index: usize,
    source: Arc<S>,
    /// Admission control: one permit per outstanding poll
    gate: Arc<Semaphore>,
    handoff: Queue<S::Item>,
    buffer: Queue<S::Item>,
    shutdown: ShutdownSignal,
    published: Arc<AtomicU64>,
}

/// A polling loop's view of [`PollingHandle::shutdown`].
struct ShutdownSignal {
    index: usize,
    receiver: watch::Receiver<bool>,
    orphaned: bool,
}

impl ShutdownSignal {
    /// Resolves once shutdown is requested. Never resolves after the
    /// publisher and every handle are dropped without a shutdown.
    async fn interrupted(&mut self) {
        while !*self.receiver.borrow_and_update() {
            if self.orphaned || self.receiver.changed().await.is_err() {
                if !self.orphaned {
                    self.orphaned = true;
                    log::warn!(
                        "Polling loop {} lost its publisher without a shutdown; it keeps polling until the runtime stops",
                        self.index
                    );
                }
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl<S: PollSource> PollingLoop<S> {
    async fn run(mut self) {
        let initialised = AssertUnwindSafe(self.source.init())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FlowError::from_panic(panic)));
        if let Err(e) = initialised {
            log::error!("Polling loop {} failed to initialise, exiting: {}", self.index, e);
            return;
        }

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.interrupted() => break,
                permit = Arc::clone(&self.gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            self.issue_poll(permit);
            if !self.publish_ready().await {
                break;
            }
        }
        log::warn!("Polling loop {} has exited due to interruption", self.index);
    }

    fn issue_poll(&self, permit: OwnedSemaphorePermit) {
        let source = Arc::clone(&self.source);
        let handoff = self.handoff.clone();
        let index = self.index;
        tokio::spawn(async move {
            let polled = AssertUnwindSafe(source.poll())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(FlowError::from_panic(panic)));
            match polled {
                Ok(Some(item)) => {
                    if let Err(e) = handoff.try_enqueue(item) {
                        log::warn!("Polling loop {} dropped a polled item: {}", index, e);
                    }
                }
                Ok(None) => log::trace!("Polling loop {} found nothing ready", index),
                Err(e) => log::error!("Exception polling in loop {}: {}", index, e),
            }
            drop(permit);
        });
    }

    /// Publish everything in the hand-off queue. Returns false when interrupted.
    async fn publish_ready(&mut self) -> bool {
        for item in self.handoff.drain().await {
            let published = tokio::select! {
                biased;
                _ = self.shutdown.interrupted() => return false,
                published = self.buffer.enqueue(item) => published,
            };
            match published {
                Ok(()) => {
                    let total = self.published.fetch_add(1, Ordering::Relaxed) + 1;
                    log::trace!("Polling loop {} published item (total {})", self.index, total);
                }
                Err(e) => {
                    log::warn!("Polling loop {} cannot publish: {}", self.index, e);
                    return false;
                }
            }
        }
        true
    }
}

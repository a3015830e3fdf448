//! Publishers delivering items under a completion-aware subscription

use futures_core::Stream;
use futures_util::stream::{BoxStream, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{FlowError, FlowResult};
use crate::subscription::{Completion, CompletionSubscription, DemandSubscription, Subscriber};

/// A boxed, heap-allocated stream feeding a publisher
pub type FlowStream<O> = BoxStream<'static, O>;

/// A source of items for [`Subscriber`]s.
///
/// The returned [`Completion`] resolves once the subscriber has completed or
/// cancelled its subscription.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Completion;
}

/// Publishes the items of a stream to a single subscriber, never delivering
/// more than the subscriber has requested.
///
/// At most one item is read ahead of demand, so that the end of a finite
/// stream is signalled as soon as the last item has been delivered.
pub struct StreamPublisher<T> {
    source: Mutex<Option<FlowStream<FlowResult<T>>>>,
}

impl<T> StreamPublisher<T>
where
    T: Send + 'static,
{
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::from_try_stream(stream.map(Ok))
    }

    /// An `Err` item stops the stream and is reported to the subscriber via
    /// `on_error`.
    pub fn from_try_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = FlowResult<T>> + Send + 'static,
    {
        Self {
            source: Mutex::new(Some(stream.boxed())),
        }
    }

    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Send + 'static,
        <I as IntoIterator>::IntoIter: Send,
    {
        Self::from_stream(futures_util::stream::iter(items))
    }
}

impl<T> Publisher<T> for StreamPublisher<T>
where
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Completion {
        let source = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(stream) = source else {
            log::warn!("Rejecting a second subscriber to a single-use stream publisher");
            return Completion::ready(Err(FlowError::AlreadySubscribed));
        };
        let (subscription, completion) = DemandSubscription::new();
        log::info!("Stream publisher subscribed ({})", subscription.id());
        let shared: Arc<dyn CompletionSubscription> = subscription.clone();
        subscriber.on_subscribe(shared);
        tokio::spawn(drive(stream, subscription, subscriber));
        completion
    }
}

async fn drive<T>(
    mut stream: FlowStream<FlowResult<T>>,
    subscription: Arc<DemandSubscription>,
    subscriber: Arc<dyn Subscriber<T>>,
) where
    T: Send + 'static,
{
    // nothing is read from the source before the first request
    if !subscription.demand_available().await {
        return;
    }
    let mut delivered = 0u64;
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = subscription.terminated() => break,
        };
        match next {
            Some(Ok(item)) => {
                if !subscription.acquire_demand().await {
                    break;
                }
                delivered += 1;
                subscriber.on_next(item);
            }
            Some(Err(e)) => {
                subscription.record_producer_error(e.clone());
                subscriber.on_error(e);
                break;
            }
            None => {
                log::debug!(
                    "Stream exhausted after {} items ({})",
                    delivered,
                    subscription.id()
                );
                subscriber.on_complete();
                break;
            }
        }
    }
}

use async_trait::async_trait;
use rs2_flow::processor::{processor_fn, ItemProcessor};
use rs2_flow::subscription::{CompletionSubscription, Subscriber, Subscription};
use rs2_flow::{CompletionSubscriber, FlowError, FlowResult, Phase, SubscriberConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

// ================================
// Test fixtures
// ================================

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Records every call made on it by the subscriber under test.
#[derive(Default)]
struct MockSubscription {
    requests: Mutex<Vec<usize>>,
    cancels: AtomicUsize,
    completes: AtomicUsize,
}

impl MockSubscription {
    fn requests(&self) -> Vec<usize> {
        self.requests.lock().unwrap().clone()
    }

    fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }
}

impl Subscription for MockSubscription {
    fn request(&self, n: usize) {
        self.requests.lock().unwrap().push(n);
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

impl CompletionSubscription for MockSubscription {
    fn complete(&self) {
        self.completes.fetch_add(1, Ordering::SeqCst);
    }
}

type Gate = oneshot::Receiver<FlowResult<()>>;

/// Each item carries the outcome of its own processing, settled by the test.
struct Gated {
    prepare_error: Option<FlowError>,
}

#[async_trait]
impl ItemProcessor for Gated {
    type Item = Gate;
    type Output = ();

    async fn prepare(&self) -> FlowResult<()> {
        match &self.prepare_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn process(&self, gate: Gate) -> FlowResult<()> {
        gate.await.unwrap_or(Err(FlowError::Disconnected))
    }

    fn name(&self) -> &str {
        "gated"
    }
}

fn subscribe(max_concurrency: usize, chunk_size: usize) -> (CompletionSubscriber<Gated>, Arc<MockSubscription>) {
    let subscriber = CompletionSubscriber::wrap(Gated { prepare_error: None }, max_concurrency, chunk_size).unwrap();
    let subscription = Arc::new(MockSubscription::default());
    subscriber.on_subscribe(subscription.clone());
    (subscriber, subscription)
}

fn deliver(subscriber: &CompletionSubscriber<Gated>) -> oneshot::Sender<FlowResult<()>> {
    let (tx, rx) = oneshot::channel();
    subscriber.on_next(rx);
    tx
}

// ================================
// Demand and concurrency
// ================================

#[tokio::test]
async fn test_single_concurrency_processes_one_item_at_a_time() {
    let (subscriber, subscription) = subscribe(1, 1);
    assert!(eventually(|| subscription.requests() == vec![1]).await);

    let first = deliver(&subscriber);
    assert_eq!(subscriber.in_flight(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(subscription.requests(), vec![1], "no demand while the item is in flight");

    first.send(Ok(())).unwrap();
    assert!(eventually(|| subscription.requests() == vec![1, 1]).await);

    let second = deliver(&subscriber);
    second.send(Ok(())).unwrap();
    assert!(eventually(|| subscription.requests() == vec![1, 1, 1]).await);

    let third = deliver(&subscriber);
    subscriber.on_complete();
    assert_eq!(subscriber.phase(), Phase::Draining);
    assert_eq!(subscription.completes(), 0);

    third.send(Ok(())).unwrap();
    assert!(eventually(|| subscription.completes() == 1).await);
    assert_eq!(subscriber.phase(), Phase::Completed);
    assert_eq!(subscription.cancels(), 0);
    assert_eq!(subscription.requests(), vec![1, 1, 1]);

    let metrics = subscriber.metrics();
    assert_eq!(metrics.received, 3);
    assert_eq!(metrics.succeeded, 3);
    assert_eq!(metrics.peak_in_flight, 1);
}

#[tokio::test]
async fn test_chunked_demand_never_exceeds_concurrency() {
    let (subscriber, subscription) = subscribe(4, 2);
    assert!(eventually(|| subscription.requests() == vec![2]).await);

    let a = deliver(&subscriber);
    assert_eq!(subscription.requests(), vec![2], "previous chunk not yet delivered");
    let b = deliver(&subscriber);
    // the next chunk is asked for once the dispatched items start
    assert!(eventually(|| subscription.requests() == vec![2, 2]).await);

    let c = deliver(&subscriber);
    let d = deliver(&subscriber);
    assert_eq!(subscriber.in_flight(), 4);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(subscription.requests(), vec![2, 2], "ceiling reached");

    a.send(Ok(())).unwrap();
    assert!(eventually(|| subscriber.in_flight() == 3).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(subscription.requests(), vec![2, 2], "a chunk of two does not fit yet");

    b.send(Ok(())).unwrap();
    assert!(eventually(|| subscription.requests() == vec![2, 2, 2]).await);

    subscriber.on_complete();
    c.send(Ok(())).unwrap();
    d.send(Ok(())).unwrap();
    assert!(eventually(|| subscription.completes() == 1).await);
    assert_eq!(subscriber.metrics().peak_in_flight, 4);
}

#[tokio::test]
async fn test_end_right_after_a_full_chunk_asks_for_nothing_more() {
    let (subscriber, subscription) = subscribe(10, 2);
    assert!(eventually(|| subscription.requests() == vec![2]).await);

    let a = deliver(&subscriber);
    let b = deliver(&subscriber);
    subscriber.on_complete();
    assert_eq!(subscriber.phase(), Phase::Draining);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(subscription.requests(), vec![2]);

    a.send(Ok(())).unwrap();
    b.send(Ok(())).unwrap();
    assert!(eventually(|| subscription.completes() == 1).await);
    assert_eq!(subscription.requests(), vec![2]);
    assert_eq!(subscriber.metrics().requested, 2);
}

#[tokio::test]
async fn test_items_are_dispatched_without_waiting_for_earlier_ones() {
    let (subscriber, subscription) = subscribe(3, 1);
    assert!(eventually(|| subscription.requests().len() == 1).await);

    let first = deliver(&subscriber);
    assert!(eventually(|| subscription.requests().len() == 2).await);
    let second = deliver(&subscriber);
    assert_eq!(subscriber.in_flight(), 2);

    // settle out of order
    second.send(Ok(())).unwrap();
    assert!(eventually(|| subscriber.in_flight() == 1).await);
    first.send(Ok(())).unwrap();
    assert!(eventually(|| subscriber.in_flight() == 0).await);
}

// ================================
// Completion and cancellation
// ================================

#[tokio::test]
async fn test_completes_immediately_when_nothing_is_in_flight() {
    let (subscriber, subscription) = subscribe(2, 1);
    assert!(eventually(|| subscription.requests().len() == 1).await);

    subscriber.on_complete();
    assert_eq!(subscription.completes(), 1);
    assert_eq!(subscriber.phase(), Phase::Completed);

    // repeated producer signals are harmless
    subscriber.on_complete();
    assert_eq!(subscription.completes(), 1);
}

#[tokio::test]
async fn test_prepare_failure_cancels_without_requesting() {
    let subscriber = CompletionSubscriber::wrap(
        Gated {
            prepare_error: Some(FlowError::Prepare("no connection".into())),
        },
        10,
        1,
    )
    .unwrap();
    let subscription = Arc::new(MockSubscription::default());
    subscriber.on_subscribe(subscription.clone());

    assert!(eventually(|| subscription.cancels() == 1).await);
    assert!(subscription.requests().is_empty());
    assert_eq!(subscriber.phase(), Phase::Cancelled);
}

#[tokio::test]
async fn test_systemic_failure_cancels_subscription() {
    let (subscriber, subscription) = subscribe(10, 1);
    assert!(eventually(|| subscription.requests().len() == 1).await);

    let ok = deliver(&subscriber);
    assert!(eventually(|| subscription.requests().len() == 2).await);
    let broken = deliver(&subscriber);
    broken.send(Err(FlowError::Processing("database down".into()))).unwrap();
    assert!(eventually(|| subscription.cancels() == 1).await);
    assert_eq!(subscriber.phase(), Phase::Cancelled);

    // late settlement and producer completion never complete a cancelled subscription
    ok.send(Ok(())).unwrap();
    subscriber.on_complete();
    assert!(eventually(|| subscriber.in_flight() == 0).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(subscription.completes(), 0);
    assert_eq!(subscription.cancels(), 1);
    assert_eq!(subscriber.metrics().failed, 1);
}

#[tokio::test]
async fn test_validation_failure_does_not_cancel() {
    let (subscriber, subscription) = subscribe(10, 1);
    assert!(eventually(|| subscription.requests().len() == 1).await);

    let rejected = deliver(&subscriber);
    rejected.send(Err(FlowError::Validation("malformed".into()))).unwrap();
    assert!(eventually(|| subscription.requests().len() == 2).await);
    let accepted = deliver(&subscriber);
    accepted.send(Ok(())).unwrap();
    subscriber.on_complete();

    assert!(eventually(|| subscription.completes() == 1).await);
    assert_eq!(subscription.cancels(), 0);
    let metrics = subscriber.metrics();
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.succeeded, 1);
}

#[tokio::test]
async fn test_panicking_processor_is_a_systemic_failure() {
    let processor = processor_fn(|n: i32| async move {
        if n == 2 {
            panic!("processor bug");
        }
        Ok::<(), FlowError>(())
    });
    let subscriber = CompletionSubscriber::wrap(processor, 5, 1).unwrap();
    let subscription = Arc::new(MockSubscription::default());
    subscriber.on_subscribe(subscription.clone());
    assert!(eventually(|| subscription.requests().len() == 1).await);

    subscriber.on_next(1);
    assert!(eventually(|| subscription.requests().len() >= 2).await);
    subscriber.on_next(2);
    assert!(eventually(|| subscription.cancels() == 1).await);
    assert_eq!(subscription.completes(), 0);
}

#[tokio::test]
async fn test_producer_error_still_drains_in_flight_items() {
    let (subscriber, subscription) = subscribe(10, 1);
    assert!(eventually(|| subscription.requests().len() == 1).await);

    let pending = deliver(&subscriber);
    subscriber.on_error(FlowError::Producer("stream reset".into()));
    assert_eq!(subscriber.phase(), Phase::Draining);
    assert_eq!(subscription.completes(), 0);

    pending.send(Ok(())).unwrap();
    assert!(eventually(|| subscription.completes() == 1).await);
    assert_eq!(subscription.cancels(), 0);
}

#[tokio::test]
async fn test_items_after_termination_are_dropped() {
    let (subscriber, subscription) = subscribe(10, 1);
    assert!(eventually(|| subscription.requests().len() == 1).await);
    subscriber.on_complete();
    assert_eq!(subscription.completes(), 1);

    let _late = deliver(&subscriber);
    assert_eq!(subscriber.in_flight(), 0);
    assert_eq!(subscriber.metrics().received, 0);
}

#[tokio::test]
async fn test_second_subscription_is_cancelled() {
    let (subscriber, first) = subscribe(10, 1);
    let second = Arc::new(MockSubscription::default());
    subscriber.on_subscribe(second.clone());

    assert_eq!(second.cancels(), 1);
    assert!(eventually(|| first.requests().len() == 1).await);
    assert_eq!(first.cancels(), 0);
    assert!(second.requests().is_empty());
}

#[tokio::test]
async fn test_invalid_limits_are_rejected() {
    let err = CompletionSubscriber::wrap(Gated { prepare_error: None }, 0, 1).err();
    assert!(matches!(err, Some(FlowError::InvalidConfiguration(_))));

    let err = CompletionSubscriber::new(Gated { prepare_error: None }, SubscriberConfig::new(2, 3)).err();
    assert!(matches!(err, Some(FlowError::InvalidConfiguration(_))));
}

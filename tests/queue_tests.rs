use futures_util::StreamExt;
use rs2_flow::queue::{Queue, QueueError};
use std::time::Duration;

#[tokio::test]
async fn test_bounded_queue_basic() {
    let queue = Queue::bounded(2);

    assert!(queue.enqueue(1).await.is_ok());
    assert!(queue.enqueue(2).await.is_ok());

    // Full queue rejects without waiting
    assert!(matches!(queue.try_enqueue(3), Err(QueueError::QueueFull)));

    let mut stream = queue.dequeue();
    assert_eq!(stream.next().await, Some(1));
    assert_eq!(stream.next().await, Some(2));

    assert!(queue.enqueue(3).await.is_ok());
    assert_eq!(stream.next().await, Some(3));
}

#[tokio::test]
async fn test_queue_close() {
    let queue = Queue::bounded(5);

    queue.enqueue(1).await.unwrap();
    queue.enqueue(2).await.unwrap();

    queue.close();
    assert!(queue.is_closed());

    assert!(matches!(queue.enqueue(3).await, Err(QueueError::QueueClosed)));
    assert!(matches!(queue.try_enqueue(3), Err(QueueError::QueueClosed)));

    // Existing items are still delivered, then the stream ends
    let mut stream = queue.dequeue();
    assert_eq!(stream.next().await, Some(1));
    assert_eq!(stream.next().await, Some(2));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn test_close_wakes_waiting_consumer() {
    let queue: Queue<u32> = Queue::bounded(4);
    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.dequeue().collect::<Vec<_>>().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.close();

    let items = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .expect("consumer should finish once the queue is closed")
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn test_queue_stats() {
    let queue = Queue::bounded(10);

    queue.enqueue(1).await.unwrap();
    queue.enqueue(2).await.unwrap();

    let stats = queue.stats();
    assert_eq!(stats.length, 2);
    assert_eq!(stats.capacity, Some(10));
    assert_eq!(stats.utilization, 0.2);
    assert!(!stats.is_closed);
    assert_eq!(stats.to_string(), "Queue(2/10, 20.0%)");
}

#[tokio::test]
async fn test_unbounded_queue() {
    let queue = Queue::unbounded();
    assert_eq!(queue.capacity(), None);

    for i in 0..1000 {
        queue.try_enqueue(i).unwrap();
    }

    let items: Vec<_> = queue.dequeue().take(1000).collect().await;
    assert_eq!(items, (0..1000).collect::<Vec<_>>());
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_concurrent_access() {
    let queue = Queue::bounded(8);
    let producer_queue = queue.clone();

    let producer = tokio::spawn(async move {
        for i in 0..50 {
            producer_queue.enqueue(i).await.unwrap();
        }
    });
    let consumer = tokio::spawn(async move { queue.dequeue().take(50).collect::<Vec<_>>().await });

    let (_, items) = tokio::join!(producer, consumer);
    let items = items.unwrap();
    assert_eq!(items.len(), 50);
    for i in 0..50 {
        assert!(items.contains(&i));
    }
}

#[tokio::test]
async fn test_drain_takes_only_ready_items() {
    let queue = Queue::unbounded();
    for i in 0..8 {
        queue.enqueue(i).await.unwrap();
    }

    let drained = queue.drain().await;
    assert_eq!(drained, (0..8).collect::<Vec<_>>());
    assert!(queue.is_empty());
    assert!(queue.drain().await.is_empty());
}

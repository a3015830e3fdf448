//! Concurrent queue with a Stream interface
//!
//! Used as the buffer between polling loops and the publisher (bounded), and
//! as the hand-off of polled items inside a polling loop (unbounded).

use async_stream::stream;
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

/// Error types for Queue operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    /// Queue has been closed
    #[error("Queue is closed")]
    QueueClosed,
    /// Queue is full (for bounded queues)
    #[error("Queue is full")]
    QueueFull,
    /// Channel disconnected
    #[error("Queue channel disconnected")]
    ChannelDisconnected,
}

enum QueueSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

enum QueueReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> QueueReceiver<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<T> {
        match self {
            QueueReceiver::Bounded(rx) => rx.try_recv().ok(),
            QueueReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Internal queue state shared by all handles
struct QueueState<T> {
    sender: QueueSender<T>,
    capacity: Option<usize>,
    closed: AtomicBool,
    item_count: AtomicUsize,
    close_notify: Notify,
}

/// Concurrent queue with Stream interface
pub struct Queue<T> {
    state: Arc<QueueState<T>>,
    receiver: Arc<Mutex<QueueReceiver<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            receiver: Arc::clone(&self.receiver),
        }
    }
}

enum Next<T> {
    Item(T),
    Closed,
    Disconnected,
}

impl<T> Queue<T>
where
    T: Send + 'static,
{
    /// Create a new bounded queue with the given capacity
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self::with_channel(
            QueueSender::Bounded(sender),
            QueueReceiver::Bounded(receiver),
            Some(capacity),
        )
    }

    /// Create a new unbounded queue
    pub fn unbounded() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self::with_channel(
            QueueSender::Unbounded(sender),
            QueueReceiver::Unbounded(receiver),
            None,
        )
    }

    fn with_channel(sender: QueueSender<T>, receiver: QueueReceiver<T>, capacity: Option<usize>) -> Self {
        Self {
            state: Arc::new(QueueState {
                sender,
                capacity,
                closed: AtomicBool::new(false),
                item_count: AtomicUsize::new(0),
                close_notify: Notify::new(),
            }),
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Enqueue an item into the queue (waiting if full)
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::QueueClosed);
        }
        let sent = match &self.state.sender {
            QueueSender::Bounded(tx) => tx.send(item).await.is_ok(),
            QueueSender::Unbounded(tx) => tx.send(item).is_ok(),
        };
        if sent {
            self.state.item_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(QueueError::ChannelDisconnected)
        }
    }

    /// Try to enqueue an item without waiting
    pub fn try_enqueue(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::QueueClosed);
        }
        let sent = match &self.state.sender {
            QueueSender::Bounded(tx) => tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => QueueError::ChannelDisconnected,
            }),
            QueueSender::Unbounded(tx) => tx.send(item).map_err(|_| QueueError::ChannelDisconnected),
        };
        sent.map(|_| {
            self.state.item_count.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Stream of dequeued items. After [`Queue::close`], the items already
    /// queued are still yielded and then the stream ends.
    pub fn dequeue(&self) -> BoxStream<'static, T> {
        let receiver = Arc::clone(&self.receiver);
        let state = Arc::clone(&self.state);

        let stream = stream! {
            loop {
                let next = {
                    let mut rx = receiver.lock().await;
                    let closed = state.close_notify.notified();
                    if state.closed.load(Ordering::Acquire) {
                        match rx.try_recv() {
                            Some(item) => Next::Item(item),
                            None => Next::Closed,
                        }
                    } else {
                        tokio::select! {
                            item = rx.recv() => match item {
                                Some(item) => Next::Item(item),
                                None => Next::Disconnected,
                            },
                            _ = closed => continue,
                        }
                    }
                };

                match next {
                    Next::Item(item) => {
                        state.item_count.fetch_sub(1, Ordering::Relaxed);
                        yield item;
                    }
                    Next::Closed | Next::Disconnected => break,
                }
            }
        };

        Box::pin(stream)
    }

    /// Close the queue, preventing further enqueues but allowing existing items to be consumed
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Get the capacity of the queue (None for unbounded)
    pub fn capacity(&self) -> Option<usize> {
        self.state.capacity
    }

    /// Current number of queued items (may be slightly stale under contention)
    pub fn len(&self) -> usize {
        self.state.item_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain all items available right now, without waiting
    pub async fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        let mut rx = self.receiver.lock().await;

        while let Some(item) = rx.try_recv() {
            self.state.item_count.fetch_sub(1, Ordering::Relaxed);
            items.push(item);
        }

        items
    }

    /// Get queue statistics for monitoring
    pub fn stats(&self) -> QueueStats {
        let length = self.len();
        let capacity = self.capacity();
        let utilization = match capacity {
            Some(cap) if cap > 0 => length as f64 / cap as f64,
            _ => 0.0,
        };

        QueueStats {
            length,
            capacity,
            utilization,
            is_closed: self.is_closed(),
        }
    }
}

/// Queue statistics for monitoring and debugging
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub length: usize,
    pub capacity: Option<usize>,
    pub utilization: f64, // 0.0 to 1.0 for bounded queues
    pub is_closed: bool,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.capacity {
            Some(cap) => write!(
                f,
                "Queue({}/{}, {:.1}%{})",
                self.length,
                cap,
                self.utilization * 100.0,
                if self.is_closed { ", closed" } else { "" }
            ),
            None => write!(
                f,
                "Queue({}, unbounded{})",
                self.length,
                if self.is_closed { ", closed" } else { "" }
            ),
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.state.capacity)
            .field("length", &self.state.item_count.load(Ordering::Relaxed))
            .field("is_closed", &self.state.closed.load(Ordering::Acquire))
            .finish()
    }
}

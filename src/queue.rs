//! Bounded per-channel delivery queue.
//!
//! Enqueue never waits: a full queue rejects immediately so that the caller
//! can apply backpressure. Dequeue suspends the consuming worker until an
//! item arrives or the queue is closed.

use crate::core::{ChannelId, Delivery};
use crate::error::EngineError;

/// A delivery that could not be queued, handed back to the caller.
#[derive(Debug)]
pub enum EnqueueError {
    Full(Delivery),
    Closed(Delivery),
}

impl EnqueueError {
    pub fn into_delivery(self) -> Delivery {
        match self {
            EnqueueError::Full(d) | EnqueueError::Closed(d) => d,
        }
    }

    pub fn delivery(&self) -> &Delivery {
        match self {
            EnqueueError::Full(d) | EnqueueError::Closed(d) => d,
        }
    }

    /// The engine-level error the caller should see.
    pub fn to_engine_error(&self) -> EngineError {
        match self {
            EnqueueError::Full(d) => EngineError::QueueFull(d.channel_id.clone()),
            EnqueueError::Closed(_) => EngineError::ShutdownInProgress,
        }
    }
}

/// FIFO of pending deliveries for one channel.
#[derive(Debug)]
pub struct DeliveryQueue {
    channel_id: ChannelId,
    capacity: usize,
    tx: async_channel::Sender<Delivery>,
    rx: async_channel::Receiver<Delivery>,
}

impl DeliveryQueue {
    /// Creates a queue holding at most `capacity` deliveries (minimum 1).
    pub fn new(channel_id: ChannelId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            channel_id,
            capacity,
            tx,
            rx,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Appends a delivery without waiting.
    pub fn enqueue(&self, delivery: Delivery) -> Result<(), EnqueueError> {
        match self.tx.try_send(delivery) {
            Ok(()) => {
                self.record_backlog();
                Ok(())
            }
            Err(async_channel::TrySendError::Full(d)) => Err(EnqueueError::Full(d)),
            Err(async_channel::TrySendError::Closed(d)) => Err(EnqueueError::Closed(d)),
        }
    }

    /// Waits for the next delivery. Returns `None` once the queue is closed
    /// and empty.
    pub async fn dequeue(&self) -> Option<Delivery> {
        let delivery = self.rx.recv().await.ok();
        if delivery.is_some() {
            self.record_backlog();
        }
        delivery
    }

    /// Takes the next delivery if one is immediately available.
    pub fn try_dequeue(&self) -> Option<Delivery> {
        let delivery = self.rx.try_recv().ok();
        if delivery.is_some() {
            self.record_backlog();
        }
        delivery
    }

    /// Number of deliveries currently waiting.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    /// Stops accepting new deliveries. Queued items can still be dequeued.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn record_backlog(&self) {
        metrics::gauge!("delivery_queue_backlog", "channel" => self.channel_id.0.clone())
            .set(self.backlog() as f64);
    }
}

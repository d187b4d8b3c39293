//! Channel senders with scripted behaviour for integration tests.

use async_trait::async_trait;
use notifyd::{ChannelSender, Delivery, SendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Returns scripted results in order, then succeeds.
#[derive(Default)]
pub struct ScriptedSender {
    script: Mutex<VecDeque<Result<(), SendError>>>,
    calls: AtomicUsize,
}

impl ScriptedSender {
    pub fn new(script: impl IntoIterator<Item = Result<(), SendError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// `n` transient failures followed by success.
    pub fn transient_times(n: usize) -> Self {
        Self::new((0..n).map(|i| Err(SendError::Transient(format!("HTTP 503 (#{})", i + 1)))))
    }

    /// Fails transiently forever.
    pub fn always_transient() -> Self {
        Self::transient_times(10_000)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, _delivery: &Delivery) -> Result<(), SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// Records every payload it receives, in order.
#[derive(Default)]
pub struct RecordingSender {
    received: Mutex<Vec<Vec<u8>>>,
    attempts: Mutex<Vec<u32>>,
    delay: Option<Duration>,
}

impl RecordingSender {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn payloads(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, delivery: &Delivery) -> Result<(), SendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.received
            .lock()
            .push(delivery.notification.payload.clone());
        self.attempts.lock().push(delivery.attempt);
        Ok(())
    }
}

/// Blocks every send until a permit is released.
pub struct BlockingSender {
    gate: Semaphore,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl Default for BlockingSender {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }
}

impl BlockingSender {
    /// Lets `n` blocked or future sends complete.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for BlockingSender {
    fn kind(&self) -> &'static str {
        "blocking"
    }

    async fn send(&self, _delivery: &Delivery) -> Result<(), SendError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(SendError::Transient("gate closed".into())),
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

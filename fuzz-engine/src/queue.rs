//! Bounded dispatch queue between the payload script and consumer workers
//!
//! The queue is the only path from script-generated payloads to the wire.
//! Its bound is what gives the attack backpressure: a script that outruns
//! the connection blocks inside `put` instead of buffering without limit.

use crate::error::{AttackError, AttackResult};
use crate::message::MessageRecord;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default queue bound when the operator does not configure one
pub const DEFAULT_CAPACITY: usize = 64;

/// Bounded FIFO queue of pending outbound records
///
/// Clones share the same channel, so one producer and several consumer
/// workers can hold their own handle. `take` hands each record to exactly
/// one worker.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<MessageRecord>,
    rx: Arc<Mutex<mpsc::Receiver<MessageRecord>>>,
    capacity: usize,
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity,
        }
    }

    /// Enqueue a record, waiting for space when the queue is full
    ///
    /// Cancellation wins over a pending slot: a `put` blocked on a full
    /// queue returns [`AttackError::QueueInterrupted`] as soon as the token
    /// fires, so shutdown never waits on a stalled consumer.
    pub async fn put(&self, record: MessageRecord, cancel: &CancellationToken) -> AttackResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttackError::QueueInterrupted),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(record);
                    Ok(())
                }
                Err(_) => Err(AttackError::QueueInterrupted),
            },
        }
    }

    /// Dequeue the oldest record, waiting when the queue is empty
    ///
    /// Returns `None` once the token fires, which is the workers' signal
    /// to exit their loop.
    pub async fn take(&self, cancel: &CancellationToken) -> Option<MessageRecord> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            guard = self.rx.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            record = rx.recv() => record,
        }
    }

    /// Discard everything still queued, returning how many records were dropped
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("drained {} undispatched records from queue", discarded);
        }
        discarded
    }

    /// Number of records currently waiting in the queue
    pub fn pending(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    /// Configured queue bound
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

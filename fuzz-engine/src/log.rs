//! Shared message log with live streaming support
//!
//! The log is the single record of everything that crossed the captured
//! connection. Appends come from transport callbacks and consumer workers
//! while the operator reads snapshots or tails a live stream, so the log
//! must stay readable mid-attack without blocking writers for long.

use crate::error::AttackResult;
use crate::message::{Direction, MessageRecord};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Broadcast buffer for live log tailing
const STREAM_BUFFER: usize = 1024;

/// Append-only log of messages observed on the captured connection
#[derive(Debug)]
pub struct MessageLog {
    records: RwLock<Vec<MessageRecord>>,
    updates: broadcast::Sender<MessageRecord>,
}

impl MessageLog {
    /// Create an empty log
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(STREAM_BUFFER);
        Self {
            records: RwLock::new(Vec::new()),
            updates,
        }
    }

    /// Append a record and notify live subscribers
    pub fn append(&self, record: MessageRecord) {
        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            records.push(record.clone());
        }
        // Nobody listening is fine; the vector above is the system of record.
        let _ = self.updates.send(record);
    }

    /// Number of records in the log
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when no records have been appended since the last clear
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every record, in append order
    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Copy of every record matching the given direction, in append order
    pub fn filtered(&self, direction: Direction) -> Vec<MessageRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|record| record.direction == direction)
            .cloned()
            .collect()
    }

    /// Drop all records, keeping live subscriptions intact
    pub fn clear(&self) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let dropped = records.len();
        records.clear();
        if dropped > 0 {
            debug!("cleared {} records from message log", dropped);
        }
    }

    /// Subscribe to records as they are appended
    pub fn subscribe(&self) -> broadcast::Receiver<MessageRecord> {
        self.updates.subscribe()
    }

    /// Subscribe as a `Stream` of appended records
    pub fn stream(&self) -> BroadcastStream<MessageRecord> {
        BroadcastStream::new(self.updates.subscribe())
    }

    /// Serialize the current snapshot as pretty-printed JSON
    pub fn export_json(&self) -> AttackResult<String> {
        let records = self.snapshot();
        Ok(serde_json::to_string_pretty(&records)?)
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

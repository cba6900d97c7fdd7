//! Consumer pool draining the dispatch queue onto the wire
//!
//! Workers compete for queued records and push them through the shared
//! connection. One worker preserves strict send order; more workers trade
//! ordering for throughput, which is the operator's call.

use crate::connection::Connection;
use crate::error::{AttackError, AttackResult};
use crate::queue::DispatchQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool of worker tasks feeding the connection from the dispatch queue
pub struct ConsumerPool {
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerPool {
    /// Spawn `count` workers (at least one) against the given queue
    pub(crate) fn spawn(
        count: usize,
        queue: DispatchQueue,
        connection: Arc<Connection>,
        cancel: CancellationToken,
    ) -> Self {
        let count = count.max(1);
        let workers = (0..count)
            .map(|worker_id| {
                let queue = queue.clone();
                let connection = Arc::clone(&connection);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    Self::worker_loop(worker_id, queue, connection, cancel).await;
                })
            })
            .collect();
        Self { workers }
    }

    /// Number of workers in the pool
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True when the pool holds no workers
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    async fn worker_loop(
        worker_id: usize,
        queue: DispatchQueue,
        connection: Arc<Connection>,
        cancel: CancellationToken,
    ) {
        debug!("consumer worker {} started", worker_id);
        let mut dispatched = 0u64;
        let mut failed = 0u64;

        while let Some(record) = queue.take(&cancel).await {
            // Failed sends are already logged and surfaced by the
            // connection; the worker just keeps draining.
            match connection.send(record).await {
                Ok(()) => dispatched += 1,
                Err(_) => failed += 1,
            }
        }

        info!(
            "consumer worker {} exiting: {} dispatched, {} failed",
            worker_id, dispatched, failed
        );
    }

    /// Wait for every worker to exit, aborting stragglers after `grace`
    ///
    /// Workers normally exit as soon as their cancellation token fires. A
    /// worker stuck inside a transport send past the grace period gets
    /// aborted so halt cannot hang; that case is reported as
    /// [`AttackError::ShutdownTimeout`].
    pub async fn shutdown(mut self, grace: Duration) -> AttackResult<()> {
        let deadline = Instant::now() + grace;
        let mut aborted = 0usize;

        for (worker_id, mut handle) in self.workers.drain(..).enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("consumer worker {} join failed: {}", worker_id, join_err);
                }
                Err(_) => {
                    warn!(
                        "consumer worker {} did not stop within grace period, aborting",
                        worker_id
                    );
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            Err(AttackError::shutdown_timeout(grace.as_millis() as u64))
        } else {
            Ok(())
        }
    }
}

//! Connection abstraction over the captured message stream
//!
//! The engine never talks to a socket directly. A [`Connector`] owns the
//! details of standing up (or duplicating) the underlying stream and hands
//! back a [`Transport`] for outbound sends, while inbound traffic flows
//! through the [`InboundSink`] the engine registered at creation time.

use crate::error::{AttackError, AttackResult};
use crate::log::MessageLog;
use crate::message::{Direction, MessageRecord, Payload};
use crate::queue::DispatchQueue;
use crate::session::SessionEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound half of a captured connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Push one payload onto the wire
    async fn send(&self, payload: Payload) -> AttackResult<()>;
}

/// Factory for capturing a connection and wiring up its inbound callback
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish the connection, registering `sink` for inbound delivery
    async fn connect(&self, sink: InboundSink) -> AttackResult<Arc<dyn Transport>>;
}

/// Callback handle a transport uses to report observed traffic
///
/// Cheap to clone; every clone feeds the same log.
#[derive(Debug, Clone)]
pub struct InboundSink {
    connection_id: Uuid,
    log: Arc<MessageLog>,
    running: Arc<AtomicBool>,
}

impl InboundSink {
    pub(crate) fn new(connection_id: Uuid, log: Arc<MessageLog>, running: Arc<AtomicBool>) -> Self {
        Self {
            connection_id,
            log,
            running,
        }
    }

    /// Connection this sink reports for
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Record traffic observed on the underlying stream
    ///
    /// Server-to-client messages are logged whether or not an attack is
    /// running; the operator always wants to see what the server said.
    /// Observed client-to-server traffic is only interesting mid-attack,
    /// so it is dropped while the session is idle. Transports must not
    /// report the engine's own sends back through this path.
    pub fn deliver(&self, payload: Payload, direction: Direction) {
        if !direction.is_inbound() && !self.running.load(Ordering::Acquire) {
            debug!(
                "dropping observed outbound message on idle connection {}",
                self.connection_id
            );
            return;
        }
        let record = match direction {
            Direction::ServerToClient => MessageRecord::inbound(self.connection_id, payload),
            Direction::ClientToServer => MessageRecord::outbound(self.connection_id, payload),
        };
        self.log.append(record);
    }
}

/// A live captured connection bound to one attack session
///
/// Owns the outbound transport plus the dispatch queue feeding it. All
/// sends are logged, including failed ones, so the operator can line up
/// what was attempted against what the server answered.
pub struct Connection {
    id: Uuid,
    transport: Arc<dyn Transport>,
    running: Arc<AtomicBool>,
    queue: DispatchQueue,
    log: Arc<MessageLog>,
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
    send_timeout: Option<Duration>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        transport: Arc<dyn Transport>,
        running: Arc<AtomicBool>,
        queue: DispatchQueue,
        log: Arc<MessageLog>,
        cancel: CancellationToken,
        events: broadcast::Sender<SessionEvent>,
        send_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            transport,
            running,
            queue,
            log,
            cancel,
            events,
            send_timeout,
        }
    }

    /// Connection identifier stamped on every record
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue an outbound record for dispatch by the consumer pool
    ///
    /// Returns `Ok(false)` when the session is idle: the payload is
    /// silently dropped rather than queued, matching the arm/halt gate.
    /// Blocks when the queue is full and bails with
    /// [`AttackError::QueueInterrupted`] if a halt lands first.
    pub async fn enqueue_outbound(
        &self,
        payload: Payload,
        annotation: Option<String>,
    ) -> AttackResult<bool> {
        if !self.running.load(Ordering::Acquire) {
            debug!("connection {} is idle, dropping outbound payload", self.id);
            return Ok(false);
        }
        let mut record = MessageRecord::outbound(self.id, payload);
        if let Some(annotation) = annotation {
            record = record.with_annotation(annotation);
        }
        self.queue.put(record, &self.cancel).await?;
        Ok(true)
    }

    /// Send one record over the transport and log the outcome
    ///
    /// A failed send still lands in the log, annotated with the failure
    /// reason, and raises [`SessionEvent::SendFailed`] so the operator
    /// sees it without tailing logs.
    pub async fn send(&self, record: MessageRecord) -> AttackResult<()> {
        match self.transport_send(record.payload.clone()).await {
            Ok(()) => {
                self.log.append(record);
                Ok(())
            }
            Err(err) => {
                let reason = match err {
                    AttackError::TransportSend { reason } => reason,
                    other => other.to_string(),
                };
                warn!("send failed on connection {}: {}", self.id, reason);
                self.log
                    .append(record.with_annotation(format!("send failed: {}", reason)));
                let _ = self.events.send(SessionEvent::SendFailed {
                    reason: reason.clone(),
                });
                Err(AttackError::TransportSend { reason })
            }
        }
    }

    async fn transport_send(&self, payload: Payload) -> AttackResult<()> {
        match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.send(payload))
                .await
                .unwrap_or_else(|_| {
                    Err(AttackError::transport_send(&format!(
                        "timed out after {}ms",
                        limit.as_millis()
                    )))
                }),
            None => self.transport.send(payload).await,
        }
    }
}

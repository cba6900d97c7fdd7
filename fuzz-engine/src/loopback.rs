//! Loopback transport for demos and tests
//!
//! Echoes every sent payload back as a server-to-client message after a
//! configurable latency, optionally failing sends after a threshold to
//! exercise error paths. Also lets a test inject unsolicited server
//! messages, standing in for a chatty peer.

use crate::connection::{Connector, InboundSink, Transport};
use crate::error::{AttackError, AttackResult};
use crate::message::{Direction, Payload};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Connector producing echo transports
pub struct LoopbackConnector {
    latency: Duration,
    fail_after: Option<usize>,
    last_sink: Mutex<Option<InboundSink>>,
}

impl LoopbackConnector {
    /// Echo transport with the given round-trip latency
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail_after: None,
            last_sink: Mutex::new(None),
        }
    }

    /// Make sends fail once more than `count` payloads have gone out
    pub fn with_fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Deliver an unsolicited server-to-client payload
    ///
    /// Returns false if no connection has been captured yet.
    pub fn inject(&self, payload: Payload) -> bool {
        let sink = self.last_sink.lock().unwrap_or_else(|e| e.into_inner());
        match sink.as_ref() {
            Some(sink) => {
                sink.deliver(payload, Direction::ServerToClient);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, sink: InboundSink) -> AttackResult<Arc<dyn Transport>> {
        debug!("loopback connector capturing connection {}", sink.connection_id());
        *self.last_sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink.clone());
        Ok(Arc::new(LoopbackTransport {
            sink,
            latency: self.latency,
            fail_after: self.fail_after,
            sent: AtomicUsize::new(0),
        }))
    }
}

/// Transport half of the loopback pair
pub struct LoopbackTransport {
    sink: InboundSink,
    latency: Duration,
    fail_after: Option<usize>,
    sent: AtomicUsize,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, payload: Payload) -> AttackResult<()> {
        let sent = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.fail_after {
            if sent > limit {
                return Err(AttackError::transport_send(&format!(
                    "injected fault after {} sends",
                    limit
                )));
            }
        }

        // Echo on a separate task so the send itself returns immediately,
        // like a real socket write would.
        let sink = self.sink.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            sink.deliver(payload, Direction::ServerToClient);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MessageLog;
    use std::sync::atomic::AtomicBool;
    use uuid::Uuid;

    fn sink_with_log() -> (InboundSink, Arc<MessageLog>) {
        let log = Arc::new(MessageLog::new());
        let sink = InboundSink::new(
            Uuid::new_v4(),
            Arc::clone(&log),
            Arc::new(AtomicBool::new(true)),
        );
        (sink, log)
    }

    #[tokio::test]
    async fn sends_are_echoed_back_as_inbound() {
        let connector = LoopbackConnector::new(Duration::from_millis(5));
        let (sink, log) = sink_with_log();
        let transport = connector.connect(sink).await.unwrap();

        transport.send(Payload::from("ping")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while log.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("echo should arrive");

        let snapshot = log.snapshot();
        assert_eq!(snapshot[0].direction, Direction::ServerToClient);
        assert_eq!(snapshot[0].payload, Payload::from("ping"));
    }

    #[tokio::test]
    async fn fail_after_threshold_rejects_sends() {
        let connector = LoopbackConnector::new(Duration::ZERO).with_fail_after(1);
        let (sink, _log) = sink_with_log();
        let transport = connector.connect(sink).await.unwrap();

        transport.send(Payload::from("ok")).await.unwrap();
        let err = transport.send(Payload::from("rejected")).await.unwrap_err();
        assert!(matches!(err, AttackError::TransportSend { .. }));
    }

    #[tokio::test]
    async fn inject_delivers_unsolicited_inbound() {
        let connector = LoopbackConnector::new(Duration::ZERO);
        assert!(!connector.inject(Payload::from("too early")));

        let (sink, log) = sink_with_log();
        let _transport = connector.connect(sink).await.unwrap();

        assert!(connector.inject(Payload::from("server push")));
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].payload, Payload::from("server push"));
    }
}

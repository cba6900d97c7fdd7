//! Integration tests for the arm/halt attack lifecycle
//!
//! These drive a full session (script, queue, consumer pool, log) against
//! loopback and purpose-built gated transports, covering ordering,
//! idempotent transitions, backpressure and halt-under-load behavior.

use async_trait::async_trait;
use fuzz_engine::{
    AttackConfig, AttackError, AttackResult, AttackSession, Connector, Direction, InboundSink,
    LoopbackConnector, Payload, SessionEvent, Transport,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

fn quick_config() -> AttackConfig {
    AttackConfig {
        shutdown_grace: Duration::from_millis(500),
        ..AttackConfig::default()
    }
}

fn outbound_payloads(session: &AttackSession) -> Vec<Payload> {
    session
        .log()
        .filtered(Direction::ClientToServer)
        .into_iter()
        .map(|record| record.payload)
        .collect()
}

async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    mut matcher: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if matcher(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Transport whose sends block until the test releases permits
struct GatedTransport {
    permits: Arc<Semaphore>,
    sent: Arc<Mutex<Vec<Payload>>>,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send(&self, payload: Payload) -> AttackResult<()> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AttackError::transport_send("gate closed"))?;
        permit.forget();
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }
}

struct GatedConnector {
    permits: Arc<Semaphore>,
    sent: Arc<Mutex<Vec<Payload>>>,
}

impl GatedConnector {
    fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Connector for GatedConnector {
    async fn connect(&self, _sink: InboundSink) -> AttackResult<Arc<dyn Transport>> {
        Ok(Arc::new(GatedTransport {
            permits: Arc::clone(&self.permits),
            sent: Arc::clone(&self.sent),
        }))
    }
}

/// Connector that always fails, for exercising arm rollback
struct RefusingConnector;

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, _sink: InboundSink) -> AttackResult<Arc<dyn Transport>> {
        Err(AttackError::connection_creation("connection refused"))
    }
}

#[tokio::test]
async fn sent_payloads_keep_script_order_with_single_consumer() {
    let connector = Arc::new(LoopbackConnector::new(Duration::ZERO));
    let session = AttackSession::new(quick_config(), connector);

    session
        .arm(
            Payload::from("seed"),
            "for i in 0..10 { send(\"m-\" + i); }",
        )
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        session.log().filtered(Direction::ClientToServer).len() == 10
    })
    .await;

    session.halt().await.unwrap();

    let sent = outbound_payloads(&session);
    let expected: Vec<Payload> = (0..10).map(|i| Payload::from(format!("m-{}", i))).collect();
    assert_eq!(sent, expected);
}

#[tokio::test]
async fn second_arm_is_rejected_and_leaves_run_untouched() {
    let connector = Arc::new(LoopbackConnector::new(Duration::ZERO));
    let session = AttackSession::new(quick_config(), connector);

    session
        .arm(Payload::from("seed"), "sleep_ms(30000);")
        .await
        .unwrap();
    assert!(session.is_running());

    let log_len_before = session.log().len();
    let first_connection = session.connection_id();

    let err = session
        .arm(Payload::from("other"), "send(seed_payload);")
        .await
        .unwrap_err();
    assert!(matches!(err, AttackError::AlreadyRunning));

    // The running attack is unaffected by the rejected arm.
    assert!(session.is_running());
    assert_eq!(session.log().len(), log_len_before);
    assert_eq!(session.connection_id(), first_connection);

    session.halt().await.unwrap();
}

#[tokio::test]
async fn halt_is_idempotent() {
    let connector = Arc::new(LoopbackConnector::new(Duration::ZERO));
    let session = AttackSession::new(quick_config(), connector);

    // Halting an idle session is already a no-op.
    session.halt().await.unwrap();

    session
        .arm(Payload::from("seed"), "send(seed_payload);")
        .await
        .unwrap();
    session.halt().await.unwrap();
    session.halt().await.unwrap();
    assert!(!session.is_running());
}

#[tokio::test]
async fn halt_stops_outbound_sends() {
    let connector = Arc::new(LoopbackConnector::new(Duration::ZERO));
    let session = AttackSession::new(quick_config(), connector);

    session
        .arm(Payload::from("seed"), "loop { send(\"spray\"); }")
        .await
        .unwrap();

    wait_until(Duration::from_secs(5), || {
        session.log().filtered(Direction::ClientToServer).len() >= 5
    })
    .await;

    session.halt().await.unwrap();
    let frozen = session.log().filtered(Direction::ClientToServer).len();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        session.log().filtered(Direction::ClientToServer).len(),
        frozen,
        "no outbound sends may land after halt returns"
    );
}

#[tokio::test]
async fn inbound_messages_are_logged_while_idle() {
    let connector = Arc::new(LoopbackConnector::new(Duration::ZERO));
    let session = AttackSession::new(quick_config(), Arc::clone(&connector) as Arc<dyn Connector>);
    let mut events = session.subscribe_events();

    session
        .arm(Payload::from("seed"), "send(seed_payload);")
        .await
        .unwrap();
    wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, SessionEvent::ScriptCompleted)
    })
    .await;
    session.halt().await.unwrap();

    let inbound_before = session.log().filtered(Direction::ServerToClient).len();
    assert!(connector.inject(Payload::from("late server push")));

    let inbound = session.log().filtered(Direction::ServerToClient);
    assert_eq!(inbound.len(), inbound_before + 1);
    assert_eq!(
        inbound.last().unwrap().payload,
        Payload::from("late server push")
    );
}

#[tokio::test]
async fn script_error_surfaces_and_session_recovers() {
    let connector = Arc::new(LoopbackConnector::new(Duration::ZERO));
    let session = AttackSession::new(quick_config(), connector);
    let mut events = session.subscribe_events();

    session
        .arm(
            Payload::from("seed"),
            "send(\"a\"); send(\"b\"); send(\"c\"); throw \"boom\";",
        )
        .await
        .unwrap();

    let failed = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, SessionEvent::ScriptFailed { .. })
    })
    .await;
    match failed {
        SessionEvent::ScriptFailed { message } => assert!(message.contains("boom")),
        other => panic!("unexpected event: {:?}", other),
    }

    // Script death does not halt the attack; the operator does.
    assert!(session.is_running());

    wait_until(Duration::from_secs(5), || {
        session.log().filtered(Direction::ClientToServer).len() == 3
    })
    .await;

    session.halt().await.unwrap();

    // The session arms again cleanly after the failure.
    session
        .arm(Payload::from("seed"), "send(seed_payload);")
        .await
        .unwrap();
    session.halt().await.unwrap();
}

#[tokio::test]
async fn full_queue_applies_backpressure_to_script() {
    let connector = Arc::new(GatedConnector::new());
    let permits = Arc::clone(&connector.permits);
    let sent = Arc::clone(&connector.sent);

    let config = AttackConfig {
        consumer_count: 1,
        queue_capacity: 2,
        shutdown_grace: Duration::from_millis(500),
        send_timeout: None,
    };
    let session = AttackSession::new(config, connector);
    let mut events = session.subscribe_events();

    session
        .arm(
            Payload::from("seed"),
            "for i in 0..5 { send(\"p-\" + i); }",
        )
        .await
        .unwrap();

    // Worker holds p-0 in a blocked send, p-1 and p-2 fill the queue, the
    // script is stuck offering p-3.
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.pending_sends().await != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue never filled");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut completed_early = false;
    loop {
        match events.try_recv() {
            Ok(SessionEvent::ScriptCompleted) => completed_early = true,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert!(
        !completed_early,
        "script must still be blocked on the full queue"
    );
    assert_eq!(session.pending_sends().await, 2);

    // Open the gate; everything flows out in order and the script finishes.
    permits.add_permits(5);
    wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, SessionEvent::ScriptCompleted)
    })
    .await;
    wait_until(Duration::from_secs(5), || sent.lock().unwrap().len() == 5).await;

    let expected: Vec<Payload> = (0..5).map(|i| Payload::from(format!("p-{}", i))).collect();
    assert_eq!(*sent.lock().unwrap(), expected);

    session.halt().await.unwrap();
}

#[tokio::test]
async fn halt_unblocks_script_and_discards_queued_payloads() {
    let connector = Arc::new(GatedConnector::new());

    let config = AttackConfig {
        consumer_count: 1,
        queue_capacity: 2,
        shutdown_grace: Duration::from_millis(200),
        send_timeout: None,
    };
    let session = AttackSession::new(config, connector);
    let mut events = session.subscribe_events();

    session
        .arm(Payload::from("seed"), "loop { send(\"x\"); }")
        .await
        .unwrap();

    // Wait until the queue is full and the script is blocked in send.
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.pending_sends().await != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue never filled");

    // Halt must return promptly even though the gate never opens: the
    // blocked put is interrupted and the stuck worker is abandoned after
    // the grace period.
    tokio::time::timeout(Duration::from_secs(5), session.halt())
        .await
        .expect("halt must not hang on a stalled transport")
        .unwrap();
    assert!(!session.is_running());

    let halted = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, SessionEvent::Halted { .. })
    })
    .await;
    match halted {
        SessionEvent::Halted { discarded } => assert_eq!(discarded, 2),
        other => panic!("unexpected event: {:?}", other),
    }

    session.halt().await.unwrap();
}

#[tokio::test]
async fn failed_connection_capture_rolls_back_arm() {
    let session = AttackSession::new(quick_config(), Arc::new(RefusingConnector));

    let err = session
        .arm(Payload::from("seed"), "send(seed_payload);")
        .await
        .unwrap_err();
    match err {
        AttackError::ConnectionCreation { reason } => assert!(reason.contains("refused")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!session.is_running());
    assert!(session.log().is_empty());
}

#[tokio::test]
async fn send_failures_are_annotated_and_attack_continues() {
    let connector = Arc::new(LoopbackConnector::new(Duration::ZERO).with_fail_after(2));
    let session = AttackSession::new(quick_config(), connector);
    let mut events = session.subscribe_events();

    session
        .arm(
            Payload::from("seed"),
            "send(\"ok-1\"); send(\"ok-2\"); send(\"fails\");",
        )
        .await
        .unwrap();

    // The failed-send event and script completion can land in either
    // order, depending on how far the consumer lags the script.
    let mut saw_send_failed = false;
    let mut saw_completed = false;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(saw_send_failed && saw_completed) {
            match events.recv().await {
                Ok(SessionEvent::SendFailed { .. }) => saw_send_failed = true,
                Ok(SessionEvent::ScriptCompleted) => saw_completed = true,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("send failure and completion should both be reported");

    wait_until(Duration::from_secs(5), || {
        session.log().filtered(Direction::ClientToServer).len() == 3
    })
    .await;
    session.halt().await.unwrap();

    let outbound = session.log().filtered(Direction::ClientToServer);
    assert!(outbound[0].annotation.is_none());
    assert!(outbound[1].annotation.is_none());
    let annotation = outbound[2].annotation.as_deref().unwrap();
    assert!(annotation.contains("send failed"));
}

//! Attack session lifecycle coordinator
//!
//! An [`AttackSession`] owns one captured connection slot, the shared
//! message log and the arm/halt state machine. Arming captures the
//! connection, starts the consumer pool and launches the payload script;
//! halting tears the run down again while leaving the log for review.
//! Both transitions are idempotent-safe for an operator mashing buttons:
//! a second arm fails with [`AttackError::AlreadyRunning`], a second halt
//! is a no-op.

use crate::connection::{Connection, Connector, InboundSink};
use crate::consumer::ConsumerPool;
use crate::error::{AttackError, AttackResult};
use crate::log::MessageLog;
use crate::message::Payload;
use crate::queue::{DispatchQueue, DEFAULT_CAPACITY};
use crate::script;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Event buffer for operator-facing session notifications
const EVENT_BUFFER: usize = 256;

/// Tunables for a single attack session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Worker tasks draining the dispatch queue; one preserves send order
    pub consumer_count: usize,
    /// Bound of the dispatch queue between script and workers
    pub queue_capacity: usize,
    /// How long halt waits for workers and the script before detaching them
    pub shutdown_grace: Duration,
    /// Per-send timeout applied at the connection boundary
    pub send_timeout: Option<Duration>,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            consumer_count: 1,
            queue_capacity: DEFAULT_CAPACITY,
            shutdown_grace: Duration::from_secs(5),
            send_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Operator-facing lifecycle notifications for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Attack armed: connection captured, script running
    Armed,
    /// Attack halted; `discarded` counts queued payloads never sent
    Halted { discarded: usize },
    /// The payload script ran to completion on its own
    ScriptCompleted,
    /// The payload script died with a runtime error
    ScriptFailed { message: String },
    /// A single outbound send failed; the attack keeps running
    SendFailed { reason: String },
}

/// Machinery belonging to one armed run, torn down on halt
struct ActiveRun {
    cancel: CancellationToken,
    queue: DispatchQueue,
    pool: ConsumerPool,
    script: JoinHandle<()>,
}

/// One operator attack session over a captured connection
pub struct AttackSession {
    id: Uuid,
    config: AttackConfig,
    connector: Arc<dyn Connector>,
    log: Arc<MessageLog>,
    running: Arc<AtomicBool>,
    events: broadcast::Sender<SessionEvent>,
    active: Mutex<Option<ActiveRun>>,
    // Kept past halt so late server messages still reach the log.
    link: StdMutex<Option<Arc<Connection>>>,
    created_at: DateTime<Utc>,
}

impl AttackSession {
    /// Create an idle session that will capture connections via `connector`
    pub fn new(config: AttackConfig, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            id: Uuid::new_v4(),
            config,
            connector,
            log: Arc::new(MessageLog::new()),
            running: Arc::new(AtomicBool::new(false)),
            events,
            active: Mutex::new(None),
            link: StdMutex::new(None),
            created_at: Utc::now(),
        }
    }

    /// Session identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the session was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Session configuration
    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    /// True while an attack is armed
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shared message log for this session
    pub fn log(&self) -> Arc<MessageLog> {
        Arc::clone(&self.log)
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Identifier of the currently captured connection, if any
    pub fn connection_id(&self) -> Option<Uuid> {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|connection| connection.id())
    }

    /// Records queued for dispatch but not yet sent
    pub async fn pending_sends(&self) -> usize {
        match self.active.lock().await.as_ref() {
            Some(run) => run.queue.pending(),
            None => 0,
        }
    }

    /// Arm the attack: capture the connection and launch the script
    ///
    /// The previous run's log is cleared first; a syntax error in the
    /// script or a connection failure rolls the session back to idle
    /// without leaving any workers behind.
    pub async fn arm(&self, seed: Payload, script_source: &str) -> AttackResult<()> {
        let mut active = self.active.lock().await;
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AttackError::AlreadyRunning);
        }

        match self.start_run(seed, script_source).await {
            Ok(run) => {
                *active = Some(run);
                let _ = self.events.send(SessionEvent::Armed);
                info!("attack session {} armed", self.id);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                error!("failed to arm attack session {}: {}", self.id, err);
                Err(err)
            }
        }
    }

    async fn start_run(&self, seed: Payload, script_source: &str) -> AttackResult<ActiveRun> {
        script::validate(script_source)?;

        // A fresh run starts from an empty log.
        self.log.clear();

        let connection_id = Uuid::new_v4();
        let sink = InboundSink::new(
            connection_id,
            Arc::clone(&self.log),
            Arc::clone(&self.running),
        );
        let transport = match self.connector.connect(sink).await {
            Ok(transport) => transport,
            Err(err @ AttackError::ConnectionCreation { .. }) => return Err(err),
            Err(other) => {
                return Err(AttackError::ConnectionCreation {
                    reason: other.to_string(),
                })
            }
        };
        debug!(
            "attack session {} captured connection {}",
            self.id, connection_id
        );

        let cancel = CancellationToken::new();
        let queue = DispatchQueue::new(self.config.queue_capacity);
        let connection = Arc::new(Connection::new(
            connection_id,
            transport,
            Arc::clone(&self.running),
            queue.clone(),
            Arc::clone(&self.log),
            cancel.clone(),
            self.events.clone(),
            self.config.send_timeout,
        ));
        let pool = ConsumerPool::spawn(
            self.config.consumer_count,
            queue.clone(),
            Arc::clone(&connection),
            cancel.clone(),
        );
        let script = script::spawn(
            script_source.to_string(),
            seed,
            Arc::clone(&connection),
            cancel.clone(),
            self.log.subscribe(),
            self.events.clone(),
        );

        *self.link.lock().unwrap_or_else(|e| e.into_inner()) = Some(connection);

        Ok(ActiveRun {
            cancel,
            queue,
            pool,
            script,
        })
    }

    /// Halt the attack: stop the script, drain the workers, discard the queue
    ///
    /// The log is left intact for review. Halting an idle session is a
    /// no-op so the operator can always press the button twice.
    pub async fn halt(&self) -> AttackResult<()> {
        let mut active = self.active.lock().await;
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("halt on idle attack session {} ignored", self.id);
            return Ok(());
        }

        let mut discarded = 0;
        if let Some(run) = active.take() {
            run.cancel.cancel();

            if let Err(err) = run.pool.shutdown(self.config.shutdown_grace).await {
                warn!("attack session {} consumer shutdown: {}", self.id, err);
            }

            match tokio::time::timeout(self.config.shutdown_grace, run.script).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!(
                        "attack session {} script task join failed: {}",
                        self.id, join_err
                    );
                }
                Err(_) => {
                    warn!(
                        "attack session {} script still busy after grace period, detaching",
                        self.id
                    );
                }
            }

            discarded = run.queue.drain().await;
        }

        let _ = self.events.send(SessionEvent::Halted { discarded });
        info!(
            "attack session {} halted, {} queued payloads discarded",
            self.id, discarded
        );
        Ok(())
    }

    /// Drop the captured connection and clear the log, ready for a new run
    pub async fn reset(&self) -> AttackResult<()> {
        let _active = self.active.lock().await;
        if self.running.load(Ordering::Acquire) {
            return Err(AttackError::StillRunning);
        }
        *self.link.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.log.clear();
        debug!("attack session {} reset", self.id);
        Ok(())
    }
}

impl Drop for AttackSession {
    fn drop(&mut self) {
        // Stop any still-running workers when the session itself goes away.
        if let Some(run) = self.active.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

//! Embedded payload script runtime
//!
//! Attack payloads are authored as small [rhai](https://rhai.rs) scripts.
//! A script runs once per armed attack on a blocking thread, with a seed
//! payload in scope and a handful of host functions for talking to the
//! captured connection:
//!
//! - `seed_payload` - the payload the operator captured, text or blob
//! - `send(payload)` / `send_annotated(payload, note)` - queue an outbound
//!   payload, blocking while the dispatch queue is full
//! - `recv(timeout_ms)` - next server-to-client payload, or `()` on timeout
//! - `sleep_ms(duration_ms)` - pacing helper
//!
//! Host functions observe the attack's cancellation token, so a halt lands
//! mid-`send`, mid-`recv` or mid-`sleep_ms` instead of waiting for the
//! script to finish. Between host calls the engine's progress hook stops
//! the script at the next evaluation step.

use crate::connection::Connection;
use crate::error::{AttackError, AttackResult};
use crate::message::{Direction, MessageRecord, Payload};
use crate::session::SessionEvent;
use rhai::{Blob, Dynamic, Engine, EvalAltResult, Position, Scope};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Compile-check a script without running it
///
/// Arming fails fast on syntax errors; runtime errors only surface once
/// the script executes.
pub fn validate(script: &str) -> AttackResult<()> {
    Engine::new()
        .compile(script)
        .map(|_| ())
        .map_err(|err| AttackError::ScriptCompile {
            message: err.to_string(),
        })
}

/// Spawn the script runner for an armed attack
///
/// The script itself runs on a blocking thread; the returned task
/// supervises it and reports the outcome on the session event channel.
pub(crate) fn spawn(
    script: String,
    seed: Payload,
    connection: Arc<Connection>,
    cancel: CancellationToken,
    inbound: broadcast::Receiver<MessageRecord>,
    events: broadcast::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let io = ScriptIo {
            connection,
            cancel,
            handle: Handle::current(),
            inbound: Arc::new(Mutex::new(inbound)),
        };
        let outcome = tokio::task::spawn_blocking(move || run_blocking(&script, seed, io)).await;
        match outcome {
            Ok(Ok(())) => {
                info!("payload script completed");
                let _ = events.send(SessionEvent::ScriptCompleted);
            }
            Ok(Err(ScriptFailure::Halted)) => {
                debug!("payload script terminated by halt");
            }
            Ok(Err(ScriptFailure::Failed(message))) => {
                error!("payload script failed: {}", message);
                let _ = events.send(SessionEvent::ScriptFailed { message });
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    "script thread panicked".to_string()
                } else {
                    join_err.to_string()
                };
                error!("payload script task failed: {}", message);
                let _ = events.send(SessionEvent::ScriptFailed { message });
            }
        }
    })
}

/// How a script run ended, when it did not simply return
enum ScriptFailure {
    /// Stopped by the attack's cancellation token
    Halted,
    /// Died on its own: runtime error, explicit `throw`, bad host call
    Failed(String),
}

fn run_blocking(script: &str, seed: Payload, io: ScriptIo) -> Result<(), ScriptFailure> {
    let mut engine = Engine::new();

    let cancel = io.cancel.clone();
    engine.on_progress(move |_| {
        if cancel.is_cancelled() {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
    register_host_functions(&mut engine, &io);

    let mut scope = Scope::new();
    scope.push_constant_dynamic("seed_payload", payload_to_dynamic(seed));

    match engine.run_with_scope(&mut scope, script) {
        Ok(()) => Ok(()),
        Err(err) => match *err {
            EvalAltResult::ErrorTerminated(..) => Err(ScriptFailure::Halted),
            other => Err(ScriptFailure::Failed(other.to_string())),
        },
    }
}

fn register_host_functions(engine: &mut Engine, io: &ScriptIo) {
    let send_io = io.clone();
    engine.register_fn("send", move |payload: &str| {
        send_io.send(Payload::from(payload), None)
    });
    let send_blob_io = io.clone();
    engine.register_fn("send", move |payload: Blob| {
        send_blob_io.send(Payload::Binary(payload), None)
    });
    let annotated_io = io.clone();
    engine.register_fn("send_annotated", move |payload: &str, note: &str| {
        annotated_io.send(Payload::from(payload), Some(note.to_string()))
    });
    let annotated_blob_io = io.clone();
    engine.register_fn("send_annotated", move |payload: Blob, note: &str| {
        annotated_blob_io.send(Payload::Binary(payload), Some(note.to_string()))
    });
    let recv_io = io.clone();
    engine.register_fn("recv", move |timeout_ms: i64| recv_io.recv(timeout_ms));
    let sleep_io = io.clone();
    engine.register_fn("sleep_ms", move |duration_ms: i64| {
        sleep_io.sleep_ms(duration_ms)
    });
}

/// Host-side bridge between the script thread and the async engine
#[derive(Clone)]
struct ScriptIo {
    connection: Arc<Connection>,
    cancel: CancellationToken,
    handle: Handle,
    inbound: Arc<Mutex<broadcast::Receiver<MessageRecord>>>,
}

enum RecvOutcome {
    Halted,
    TimedOut,
    Message(MessageRecord),
}

impl ScriptIo {
    fn send(&self, payload: Payload, annotation: Option<String>) -> Result<(), Box<EvalAltResult>> {
        if self.cancel.is_cancelled() {
            return Err(terminated());
        }
        let enqueued = self
            .handle
            .block_on(self.connection.enqueue_outbound(payload, annotation));
        match enqueued {
            Ok(_accepted) => Ok(()),
            Err(AttackError::QueueInterrupted) => Err(terminated()),
            Err(err) => Err(format!("send failed: {}", err).into()),
        }
    }

    fn recv(&self, timeout_ms: i64) -> Result<Dynamic, Box<EvalAltResult>> {
        if self.cancel.is_cancelled() {
            return Err(terminated());
        }
        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
        let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = self.handle.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => RecvOutcome::Halted,
                _ = tokio::time::sleep(timeout) => RecvOutcome::TimedOut,
                record = next_inbound(&mut inbound) => match record {
                    Some(record) => RecvOutcome::Message(record),
                    None => RecvOutcome::TimedOut,
                },
            }
        });
        match outcome {
            RecvOutcome::Halted => Err(terminated()),
            RecvOutcome::TimedOut => Ok(Dynamic::UNIT),
            RecvOutcome::Message(record) => Ok(payload_to_dynamic(record.payload)),
        }
    }

    fn sleep_ms(&self, duration_ms: i64) -> Result<(), Box<EvalAltResult>> {
        if self.cancel.is_cancelled() {
            return Err(terminated());
        }
        let duration = Duration::from_millis(duration_ms.max(0) as u64);
        let halted = self.handle.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => true,
                _ = tokio::time::sleep(duration) => false,
            }
        });
        if halted {
            Err(terminated())
        } else {
            Ok(())
        }
    }
}

/// Next server-to-client record on the live log stream
async fn next_inbound(rx: &mut broadcast::Receiver<MessageRecord>) -> Option<MessageRecord> {
    loop {
        match rx.recv().await {
            Ok(record) if record.direction == Direction::ServerToClient => return Some(record),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("script recv lagged behind log stream by {} records", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn payload_to_dynamic(payload: Payload) -> Dynamic {
    match payload {
        Payload::Text(text) => Dynamic::from(text),
        Payload::Binary(bytes) => Dynamic::from_blob(bytes),
    }
}

fn terminated() -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_well_formed_script() {
        assert!(validate("let x = 1; send(`probe-${x}`);").is_ok());
    }

    #[test]
    fn validate_rejects_syntax_errors() {
        let err = validate("let x = ;").unwrap_err();
        match err {
            AttackError::ScriptCompile { message } => assert!(!message.is_empty()),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn validate_does_not_execute_the_script() {
        // `nope` is not a registered function, but validation only parses.
        assert!(validate("nope();").is_ok());
    }

    #[test]
    fn text_payload_becomes_string_dynamic() {
        let dynamic = payload_to_dynamic(Payload::from("hello"));
        assert_eq!(dynamic.try_cast::<String>(), Some("hello".to_string()));
    }

    #[test]
    fn binary_payload_becomes_blob_dynamic() {
        let dynamic = payload_to_dynamic(Payload::from(vec![0xde, 0xad]));
        assert_eq!(dynamic.try_cast::<Blob>(), Some(vec![0xde, 0xad]));
    }
}

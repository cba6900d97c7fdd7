//! Sockfuzz CLI - scripted replay attacks from the command line
//!
//! Wires the fuzz engine to a loopback capture so an operator can try a
//! payload script without a live target: the simulated server echoes every
//! payload back after a configurable latency and can be told to start
//! rejecting sends, which exercises the same paths a flaky real peer would.

pub mod logging;

use anyhow::{bail, Context};
use clap::Parser;
use fuzz_engine::{
    AttackConfig, AttackSession, Connector, Direction, LoopbackConnector, MessageRecord, Payload,
    SessionEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Longest payload preview printed per log line
const PREVIEW_LIMIT: usize = 48;

/// Sockfuzz - scripted replay attacks over a captured message stream
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the payload script to run
    pub script: PathBuf,

    /// Seed payload as a literal string
    #[arg(long)]
    pub seed: Option<String>,

    /// Read the seed payload from a file instead
    #[arg(long, conflicts_with = "seed")]
    pub seed_file: Option<PathBuf>,

    /// Treat the seed file as raw bytes instead of UTF-8 text
    #[arg(long, requires = "seed_file")]
    pub binary: bool,

    /// Consumer workers draining the dispatch queue
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Dispatch queue capacity between script and workers
    #[arg(long, default_value_t = 64)]
    pub queue_capacity: usize,

    /// Simulated server round-trip latency in milliseconds
    #[arg(long, default_value_t = 25)]
    pub echo_latency_ms: u64,

    /// Make the simulated server reject sends after this many payloads
    #[arg(long)]
    pub fail_after: Option<usize>,

    /// Halt the attack after this many seconds even if the script is still busy
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Write the full message log as JSON to this file on exit
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// How an attack run came to an end
enum RunOutcome {
    Completed,
    Failed(String),
    DurationElapsed,
    Interrupted,
}

/// Build the seed payload from the CLI arguments
pub fn resolve_seed(args: &Args) -> anyhow::Result<Payload> {
    if let Some(text) = &args.seed {
        return Ok(Payload::from(text.clone()));
    }
    if let Some(path) = &args.seed_file {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        if args.binary {
            return Ok(Payload::from(bytes));
        }
        let text = String::from_utf8(bytes).with_context(|| {
            format!(
                "seed file {} is not valid UTF-8 (use --binary)",
                path.display()
            )
        })?;
        return Ok(Payload::from(text));
    }
    bail!("a seed payload is required: pass --seed or --seed-file")
}

/// Run one attack from the parsed arguments until it finishes or is stopped
pub async fn run(args: Args) -> anyhow::Result<()> {
    if !logging::levels::is_valid_level(&args.log_level) {
        bail!(
            "invalid log level '{}', valid levels: {}",
            args.log_level,
            logging::levels::valid_levels().join(", ")
        );
    }

    let script_source = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read script {}", args.script.display()))?;
    let seed = resolve_seed(&args)?;

    let latency = Duration::from_millis(args.echo_latency_ms);
    let mut connector = LoopbackConnector::new(latency);
    if let Some(limit) = args.fail_after {
        connector = connector.with_fail_after(limit);
    }
    let connector: Arc<dyn Connector> = Arc::new(connector);

    let config = AttackConfig {
        consumer_count: args.workers,
        queue_capacity: args.queue_capacity,
        ..AttackConfig::default()
    };
    let session = AttackSession::new(config, connector);

    // Subscribe before arming so the printer sees the run from the start.
    let printer = spawn_printer(session.log().subscribe(), session.subscribe_events());
    let mut events = session.subscribe_events();

    let started = chrono::Utc::now();
    session
        .arm(seed, &script_source)
        .await
        .context("failed to arm the attack")?;
    info!("attack session {} armed", session.id());

    let outcome = wait_for_outcome(&mut events, args.duration_secs.map(Duration::from_secs)).await;
    match &outcome {
        RunOutcome::Completed => {
            // Let queued payloads and their echoes land before halting.
            wait_for_drain(&session, Duration::from_secs(10)).await;
            tokio::time::sleep(latency + Duration::from_millis(50)).await;
        }
        RunOutcome::Failed(message) => warn!("script failed: {}", message),
        RunOutcome::DurationElapsed => info!("configured duration elapsed, halting"),
        RunOutcome::Interrupted => info!("interrupted, halting"),
    }

    session.halt().await.context("failed to halt the attack")?;
    let discarded = wait_for_halted(&mut events).await;
    printer.abort();

    print_summary(&session, discarded, started);

    if let Some(path) = &args.export {
        let json = session.log().export_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write export {}", path.display()))?;
        println!("💾 Log exported to {}", path.display());
    }

    Ok(())
}

/// Wait for the script to finish, the duration to elapse or an interrupt
async fn wait_for_outcome(
    events: &mut broadcast::Receiver<SessionEvent>,
    duration: Option<Duration>,
) -> RunOutcome {
    let deadline = async {
        match duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::ScriptCompleted) => return RunOutcome::Completed,
                Ok(SessionEvent::ScriptFailed { message }) => return RunOutcome::Failed(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return RunOutcome::Interrupted,
            },
            _ = &mut deadline => return RunOutcome::DurationElapsed,
            signal = &mut interrupt => {
                if let Err(err) = signal {
                    warn!("ctrl-c handler failed: {}", err);
                }
                return RunOutcome::Interrupted;
            }
        }
    }
}

/// Poll until the dispatch queue is empty or the limit passes
async fn wait_for_drain(session: &AttackSession, limit: Duration) {
    let drained = tokio::time::timeout(limit, async {
        while session.pending_sends().await > 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("dispatch queue still busy after {:?}, halting anyway", limit);
    }
}

/// Pull the discarded-payload count out of the halt notification
async fn wait_for_halted(events: &mut broadcast::Receiver<SessionEvent>) -> usize {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Halted { discarded }) => return discarded,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return 0,
            }
        }
    })
    .await
    .unwrap_or(0)
}

/// Mirror log records and lifecycle events to stdout as they happen
fn spawn_printer(
    mut records: broadcast::Receiver<MessageRecord>,
    mut events: broadcast::Receiver<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                record = records.recv() => match record {
                    Ok(record) => println!("{}", format_record(&record)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("printer lagging, {} records not shown", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("printer lagging, {} events not shown", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Armed => println!("⚡ attack armed"),
        SessionEvent::Halted { discarded } => {
            println!("🛑 attack halted, {} queued payloads discarded", discarded)
        }
        SessionEvent::ScriptCompleted => println!("✅ script completed"),
        SessionEvent::ScriptFailed { message } => println!("❌ script failed: {}", message),
        SessionEvent::SendFailed { reason } => println!("⚠️  send failed: {}", reason),
    }
}

fn format_record(record: &MessageRecord) -> String {
    let mut line = format!(
        "[{}] {} {} {}B {}",
        record.timestamp.format("%H:%M:%S%.3f"),
        record.direction,
        record.payload.kind(),
        record.payload.len(),
        preview(&record.payload)
    );
    if let Some(annotation) = &record.annotation {
        line.push_str(&format!(" ({})", annotation));
    }
    line
}

/// Short printable form of a payload, truncated and escaped
fn preview(payload: &Payload) -> String {
    match payload {
        Payload::Text(text) => {
            let mut shown: String = text
                .chars()
                .take(PREVIEW_LIMIT)
                .flat_map(char::escape_debug)
                .collect();
            if text.chars().count() > PREVIEW_LIMIT {
                shown.push_str("...");
            }
            format!("\"{}\"", shown)
        }
        Payload::Binary(bytes) => {
            let shown: Vec<String> = bytes.iter().take(16).map(|b| format!("{:02x}", b)).collect();
            let mut hex = shown.join(" ");
            if bytes.len() > 16 {
                hex.push_str(" ...");
            }
            format!("[{}]", hex)
        }
    }
}

fn print_summary(session: &AttackSession, discarded: usize, started: chrono::DateTime<chrono::Utc>) {
    let log = session.log();
    let outbound = log.filtered(Direction::ClientToServer);
    let inbound = log.filtered(Direction::ServerToClient);
    let failed = outbound
        .iter()
        .filter(|record| {
            record
                .annotation
                .as_deref()
                .map_or(false, |annotation| annotation.starts_with("send failed"))
        })
        .count();
    let elapsed = (chrono::Utc::now() - started).num_milliseconds() as f64 / 1000.0;

    println!();
    println!("📊 Attack summary");
    println!("   sent:      {} ({} failed)", outbound.len(), failed);
    println!("   received:  {}", inbound.len());
    println!("   discarded: {}", discarded);
    println!("   duration:  {:.1}s", elapsed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use uuid::Uuid;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(args).unwrap()
    }

    #[test]
    fn resolve_seed_prefers_the_literal() {
        let args = parse(&["sockfuzz", "probe.rhai", "--seed", "hello"]);
        let seed = resolve_seed(&args).unwrap();
        assert_eq!(seed, Payload::from("hello"));
    }

    #[test]
    fn resolve_seed_reads_text_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"captured frame").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = parse(&["sockfuzz", "probe.rhai", "--seed-file", &path]);
        let seed = resolve_seed(&args).unwrap();
        assert_eq!(seed, Payload::from("captured frame"));
    }

    #[test]
    fn resolve_seed_reads_binary_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x00, 0xff, 0x10]).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = parse(&["sockfuzz", "probe.rhai", "--seed-file", &path, "--binary"]);
        let seed = resolve_seed(&args).unwrap();
        assert_eq!(seed, Payload::from(vec![0x00, 0xff, 0x10]));
    }

    #[test]
    fn resolve_seed_rejects_non_utf8_without_binary_flag() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xff, 0xfe]).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = parse(&["sockfuzz", "probe.rhai", "--seed-file", &path]);
        let err = resolve_seed(&args).unwrap_err();
        assert!(err.to_string().contains("--binary"));
    }

    #[test]
    fn resolve_seed_requires_some_seed() {
        let args = parse(&["sockfuzz", "probe.rhai"]);
        let err = resolve_seed(&args).unwrap_err();
        assert!(err.to_string().contains("--seed"));
    }

    #[test]
    fn preview_truncates_long_text() {
        let text = "x".repeat(PREVIEW_LIMIT + 10);
        let shown = preview(&Payload::from(text));
        assert!(shown.ends_with("...\""));
        assert!(shown.len() < PREVIEW_LIMIT + 10);
    }

    #[test]
    fn preview_escapes_control_characters() {
        let shown = preview(&Payload::from("a\nb"));
        assert_eq!(shown, "\"a\\nb\"");
    }

    #[test]
    fn preview_renders_binary_as_hex() {
        let shown = preview(&Payload::from(vec![0xde, 0xad]));
        assert_eq!(shown, "[de ad]");
    }

    #[test]
    fn format_record_includes_the_annotation() {
        let record = MessageRecord::outbound(Uuid::new_v4(), Payload::from("probe"))
            .with_annotation("attempt 1");
        let line = format_record(&record);
        assert!(line.contains("client->server"));
        assert!(line.contains("\"probe\""));
        assert!(line.contains("(attempt 1)"));
    }
}

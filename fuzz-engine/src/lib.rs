//! Fuzz Engine - Core infrastructure for scripted replay attacks
//!
//! This crate provides the building blocks for fuzzing a live, captured
//! bidirectional message stream: a scripted payload generator, a bounded
//! dispatch queue, a consumer pool pushing payloads onto the wire, and a
//! concurrently readable log of everything sent and received.

pub mod connection;
pub mod consumer;
pub mod error;
pub mod log;
pub mod loopback;
pub mod message;
pub mod queue;
pub mod registry;
pub mod script;
pub mod session;


// Re-export the types most hosts need at the crate root
pub use message::{Direction, MessageRecord, Payload};

pub use error::{AttackError, AttackResult, ErrorSeverity};

pub use log::MessageLog;

pub use queue::{DispatchQueue, DEFAULT_CAPACITY};

pub use connection::{Connection, Connector, InboundSink, Transport};

pub use consumer::ConsumerPool;

pub use session::{AttackConfig, AttackSession, SessionEvent};

pub use registry::SessionRegistry;

pub use loopback::{LoopbackConnector, LoopbackTransport};

//! Core message types shared across the fuzz engine
//!
//! Every payload that crosses the captured connection, in either direction,
//! is recorded as a [`MessageRecord`] so the operator can review the full
//! exchange after (or during) an attack run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Direction of a message relative to the captured client
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the attack toward the server
    ClientToServer,
    /// Received from the server
    ServerToClient,
}

impl Direction {
    /// True for messages received from the server
    pub fn is_inbound(&self) -> bool {
        matches!(self, Direction::ServerToClient)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// A single message payload, either text or raw bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    /// True when the payload carries no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The payload text, if this is a text payload
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    /// Short label describing the payload kind
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Binary(_) => "binary",
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// A message observed on the captured connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub direction: Direction,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    /// Operator-facing note, e.g. a script label or a send failure reason
    pub annotation: Option<String>,
}

impl MessageRecord {
    /// Create a record for a message we are about to send
    pub fn outbound(connection_id: Uuid, payload: Payload) -> Self {
        Self::new(connection_id, Direction::ClientToServer, payload)
    }

    /// Create a record for a message received from the server
    pub fn inbound(connection_id: Uuid, payload: Payload) -> Self {
        Self::new(connection_id, Direction::ServerToClient, payload)
    }

    fn new(connection_id: Uuid, direction: Direction, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            direction,
            payload,
            timestamp: Utc::now(),
            annotation: None,
        }
    }

    /// Attach an operator-facing annotation
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    /// True for messages sent by the attack
    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::ClientToServer
    }
}

//! Error types for the fuzz engine

use thiserror::Error;

/// Main error type for fuzz engine operations
#[derive(Debug, Error, Clone, serde::Serialize, serde::Deserialize)]
pub enum AttackError {
    #[error("Attack already running")]
    AlreadyRunning,

    #[error("Attack still running")]
    StillRunning,

    #[error("Connection creation failed: {reason}")]
    ConnectionCreation { reason: String },

    #[error("Script compilation failed: {message}")]
    ScriptCompile { message: String },

    #[error("Script execution failed: {message}")]
    ScriptExecution { message: String },

    #[error("Transport send failed: {reason}")]
    TransportSend { reason: String },

    #[error("Queue operation interrupted by shutdown")]
    QueueInterrupted,

    #[error("Consumer shutdown exceeded grace period of {timeout_ms}ms")]
    ShutdownTimeout { timeout_ms: u64 },

    #[error("Serialization error: {error}")]
    Serialization { error: String },
}

impl AttackError {
    /// Create a connection creation error
    pub fn connection_creation(reason: &str) -> Self {
        Self::ConnectionCreation {
            reason: reason.to_string(),
        }
    }

    /// Create a script compilation error
    pub fn script_compile(message: &str) -> Self {
        Self::ScriptCompile {
            message: message.to_string(),
        }
    }

    /// Create a script execution error
    pub fn script_execution(message: &str) -> Self {
        Self::ScriptExecution {
            message: message.to_string(),
        }
    }

    /// Create a transport send error
    pub fn transport_send(reason: &str) -> Self {
        Self::TransportSend {
            reason: reason.to_string(),
        }
    }

    /// Create a shutdown timeout error
    pub fn shutdown_timeout(timeout_ms: u64) -> Self {
        Self::ShutdownTimeout { timeout_ms }
    }

    /// Check if the error is recoverable (the operation can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Recoverable errors - can be retried
            AttackError::ConnectionCreation { .. } => true,
            AttackError::TransportSend { .. } => true,
            AttackError::ShutdownTimeout { .. } => true,

            // Non-recoverable errors - require operator action first
            AttackError::AlreadyRunning => false,
            AttackError::StillRunning => false,
            AttackError::ScriptCompile { .. } => false,
            AttackError::ScriptExecution { .. } => false,
            AttackError::QueueInterrupted => false,
            AttackError::Serialization { .. } => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AttackError::ConnectionCreation { .. } => ErrorSeverity::High,
            AttackError::ShutdownTimeout { .. } => ErrorSeverity::High,
            AttackError::ScriptCompile { .. } => ErrorSeverity::Medium,
            AttackError::ScriptExecution { .. } => ErrorSeverity::Medium,
            AttackError::TransportSend { .. } => ErrorSeverity::Medium,
            AttackError::AlreadyRunning => ErrorSeverity::Low,
            AttackError::StillRunning => ErrorSeverity::Low,
            AttackError::QueueInterrupted => ErrorSeverity::Low,
            AttackError::Serialization { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<serde_json::Error> for AttackError {
    fn from(error: serde_json::Error) -> Self {
        AttackError::Serialization {
            error: error.to_string(),
        }
    }
}

/// Result type for fuzz engine operations
pub type AttackResult<T> = Result<T, AttackError>;

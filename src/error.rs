//! Error types for switchyard
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - A classification into retryable and fatal conditions
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for switchyard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionLost = 303,
    PeerUnreachable = 305,
    PeerSaturated = 306,

    // Protocol errors (4xx)
    ProtocolViolation = 400,
    ProtocolMalformed = 401,
    FrameTooLarge = 402,
    ReplayRejected = 403,

    // Request errors (5xx)
    RequestTimeout = 500,
    RetriesExhausted = 501,
    UnknownCorrelation = 502,
    DuplicateCorrelation = 503,
    BatchTimeout = 504,
    BufferGap = 505,
    RegistryEmpty = 506,
    WorkFailed = 507,

    // Internal errors (9xx)
    InternalError = 900,
    ChannelClosed = 901,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Request errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for switchyard
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON payload error
    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Could not establish a connection
    #[error("Failed to connect to {addr}: {message}")]
    ConnectionFailed { addr: String, message: String },

    /// An established connection went away
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// No live connection for an addressed peer
    #[error("Peer {identity} is not connected")]
    PeerUnreachable { identity: String },

    /// Peer is connected but its outbound queue is full
    #[error("Peer {identity} is not keeping up, outbound queue full")]
    PeerSaturated { identity: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Caller broke the strict send/receive alternation
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// Malformed message on the wire
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Frame exceeded the size limit
    #[error("Frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Replay service refused the query
    #[error("Replay query rejected: {reason}")]
    ReplayRejected { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────

    /// A single request attempt got no reply in time
    #[error("No reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Every allowed attempt timed out
    #[error("No reply after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// Response arrived for a correlation id nobody is waiting on
    #[error("Unknown correlation id: {correlation_id}")]
    UnknownCorrelation { correlation_id: String },

    /// Correlation id is already being tracked
    #[error("Correlation id already pending: {correlation_id}")]
    DuplicateCorrelation { correlation_id: String },

    /// Bulk completion deadline passed
    #[error("Batch incomplete: {resolved} of {expected} resolved before deadline")]
    BatchTimeout { expected: usize, resolved: usize },

    /// Replay start precedes the retained window
    #[error("Replay gap: requested seq {requested}, oldest retained is {first_available}")]
    BufferGap { requested: u64, first_available: u64 },

    /// Dispatch found no registered workers within the wait
    #[error("No workers registered after waiting {waited_ms}ms")]
    RegistryEmpty { waited_ms: u64 },

    /// Worker reported a failure for a request
    #[error("Worker {worker} failed request {correlation_id}: {message}")]
    WorkFailed {
        correlation_id: String,
        worker: String,
        message: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// A component task is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Error::PeerUnreachable { .. } => ErrorCode::PeerUnreachable,
            Error::PeerSaturated { .. } => ErrorCode::PeerSaturated,

            Error::ProtocolViolation { .. } => ErrorCode::ProtocolViolation,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Error::ReplayRejected { .. } => ErrorCode::ReplayRejected,

            Error::Timeout { .. } => ErrorCode::RequestTimeout,
            Error::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Error::UnknownCorrelation { .. } => ErrorCode::UnknownCorrelation,
            Error::DuplicateCorrelation { .. } => ErrorCode::DuplicateCorrelation,
            Error::BatchTimeout { .. } => ErrorCode::BatchTimeout,
            Error::BufferGap { .. } => ErrorCode::BufferGap,
            Error::RegistryEmpty { .. } => ErrorCode::RegistryEmpty,
            Error::WorkFailed { .. } => ErrorCode::WorkFailed,

            Error::ChannelClosed(_) => ErrorCode::ChannelClosed,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    ///
    /// A single attempt timing out is retryable; running out of attempts is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionLost { .. }
                | Error::Timeout { .. }
                | Error::RegistryEmpty { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (the caller has a bug or setup is broken)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::ProtocolViolation { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'switchyard config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'switchyard config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::ConnectionFailed { .. } => Some(
                "Check that the service is running and the address in your configuration is correct."
            ),
            Error::PeerUnreachable { .. } => Some(
                "The worker disconnected. Restart it so it registers again."
            ),
            Error::PeerSaturated { .. } => Some(
                "The worker stopped reading its requests. Check that it is alive and not stuck."
            ),

            Error::ProtocolViolation { .. } => Some(
                "Wait for the reply to the outstanding request before sending another one."
            ),
            Error::ReplayRejected { .. } => Some(
                "A replay query must be a single 8-byte big-endian start sequence."
            ),

            Error::RetriesExhausted { .. } => Some(
                "The server never answered. Raise 'channel.timeout_ms' or 'channel.max_retries' if it is just slow."
            ),
            Error::BufferGap { .. } => Some(
                "Events older than the replay window are gone. Raise 'broadcast.capacity' to retain more."
            ),
            Error::RegistryEmpty { .. } => Some(
                "Start at least one worker with 'switchyard worker' before dispatching."
            ),
            Error::BatchTimeout { .. } => Some(
                "Some workers did not report back in time. Check worker logs or raise the deadline."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: impl fmt::Display, message: impl fmt::Display) -> Self {
        Error::ConnectionFailed {
            addr: addr.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a connection lost error
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Error::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create a malformed message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    /// Create a closed channel error naming the component
    pub fn channel_closed(component: impl Into<String>) -> Self {
        Error::ChannelClosed(component.into())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

//! Error types shared across the relay core
//!
//! Every fallible core operation returns one of these kinds. Nothing is
//! recovered automatically inside the core; protocol front-ends translate
//! kinds to their own wire semantics.

/// Why a session or path member was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The publisher feeding the path went away
    SourceGone,
    /// A configuration reload replaced or removed the path
    Reconfigured,
    /// The remote peer closed or was superseded
    ClientGone,
    /// A deadline expired before the operation completed
    Timeout,
}

impl TerminateReason {
    /// Stable lowercase label used in logs and API error bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminateReason::SourceGone => "sourceGone",
            TerminateReason::Reconfigured => "reconfigured",
            TerminateReason::ClientGone => "clientGone",
            TerminateReason::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for relay core operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// No configured path pattern matches the requested name
    NotFound(String),
    /// Authentication or authorization failed
    ///
    /// `challenge` is true only when no credentials were supplied at all;
    /// HTTP front-ends use it to decide whether to send `WWW-Authenticate`.
    Auth { challenge: bool },
    /// A second publisher attempted to bind to a path
    AlreadyPublishing(String),
    /// Reader attach while the path has no publisher and waiting was not requested
    NotReady(String),
    /// A path mailbox is saturated
    Busy(String),
    /// The session or path was torn down
    Terminated(TerminateReason),
    /// Malformed SDP, malformed ICE fragment, or a missing required header
    Protocol(String),
    /// A configuration document failed validation; the previous generation
    /// stays in force
    Validation(String),
    /// Bug or resource exhaustion; carries a stable error code for logs
    Internal(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::NotFound(name) => write!(f, "path not found: {}", name),
            RelayError::Auth { .. } => write!(f, "authentication failed"),
            RelayError::AlreadyPublishing(name) => {
                write!(f, "another publisher is already bound to path {}", name)
            }
            RelayError::NotReady(name) => write!(f, "path {} is not ready", name),
            RelayError::Busy(name) => write!(f, "path {} is busy", name),
            RelayError::Terminated(reason) => write!(f, "terminated: {}", reason),
            RelayError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            RelayError::Validation(msg) => write!(f, "invalid configuration: {}", msg),
            RelayError::Internal(code) => write!(f, "internal error: {}", code),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Internal(format!("io: {}", e))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, RelayError>;

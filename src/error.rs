use crate::types::SessionPhase;
use std::fmt;
use thiserror::Error;

/// Steps of the initialization handshake, in protocol order
///
/// Used to identify exactly where a failed handshake aborted, so callers can
/// diagnose the device without a packet capture. A failed handshake is never
/// resumed mid-sequence; the only recovery is a fresh connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    /// Waiting for the bike to acknowledge `<EQ_>`
    InitAck,
    /// Waiting for the `EP` credential frame
    Password,
    /// Waiting for the `ER` resistance range frame (`MIN-MAX`)
    ResistanceRange,
    /// Waiting for the `ED` wheel diameter frame (inches ×100)
    WheelDiameter,
    /// Waiting for the `EA` MAC address frame
    MacAddress,
    /// Waiting for the optional `EM` memory frame or the end marker
    Memory,
    /// Waiting for the `Ez` end-of-init marker
    EndOfInit,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitAck => write!(f, "init acknowledgment"),
            Self::Password => write!(f, "password"),
            Self::ResistanceRange => write!(f, "resistance range"),
            Self::WheelDiameter => write!(f, "wheel diameter"),
            Self::MacAddress => write!(f, "MAC address"),
            Self::Memory => write!(f, "memory"),
            Self::EndOfInit => write!(f, "end-of-init"),
        }
    }
}

/// Errors establishing the TCP connection to the bike
///
/// Connection failures never change an already-established session and are
/// never retried internally; retry/backoff policy belongs to the caller.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// No route to the bike, or the address could not be resolved
    #[error("bike unreachable at {host}: {reason}")]
    Unreachable {
        /// Address that was dialed
        host: String,
        /// Underlying failure description
        reason: String,
    },

    /// The bike actively refused the connection
    #[error("connection refused by {host}")]
    Refused {
        /// Address that was dialed
        host: String,
    },

    /// The connect attempt did not complete within the timeout
    #[error("connect to {host} timed out after {timeout_ms}ms")]
    TimedOut {
        /// Address that was dialed
        host: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
}

/// Errors during the initialization handshake
///
/// Any of these aborts the handshake, closes the socket and returns the
/// session to `Disconnected`. A credential mismatch is deliberately *not*
/// represented here: some firmware revisions omit or alter the password
/// field, so the client logs the mismatch and continues.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// `initialize` was called without a preceding successful `connect`
    #[error("handshake requires a freshly connected session")]
    NotConnected,

    /// The expected frame for a step did not arrive within the timeout
    #[error("timed out waiting for {step} frame")]
    Timeout {
        /// Step that was waiting
        step: HandshakeStep,
    },

    /// A frame arrived but was not the one the step expects, or failed to parse
    #[error("malformed or out-of-order frame at {step} step: {frame:?}")]
    Malformed {
        /// Step that was waiting
        step: HandshakeStep,
        /// Raw frame text that was rejected
        frame: String,
    },

    /// Socket I/O failed mid-handshake; the session moves to `Error`
    #[error("I/O failure during {step} step: {source}")]
    Io {
        /// Step that was active
        step: HandshakeStep,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Errors issuing control commands (level, pause, resume, clear)
#[derive(Error, Debug)]
pub enum CommandError {
    /// The session is not in a phase where commands are legal
    #[error("session not connected (phase: {phase})")]
    NotConnected {
        /// Phase the session was in
        phase: SessionPhase,
    },

    /// The requested level cannot be represented on the wire even after clamping
    #[error("level {requested} is out of range (device supports {min}..={max})")]
    LevelOutOfRange {
        /// Level the caller asked for
        requested: i32,
        /// Device minimum display level
        min: u8,
        /// Device maximum display level
        max: u8,
    },

    /// The liveness counter saturated; the session is lost
    #[error("connection lost after {misses} consecutive unanswered requests")]
    ConnectionLost {
        /// Consecutive sends without a parseable response
        misses: u32,
    },

    /// Socket I/O failed; the session moves to `Error`
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the sport-data polling operation
///
/// A malformed or absent telemetry frame is *not* an error: `poll` returns
/// `Ok(None)` and counts the miss toward liveness. Only phase misuse,
/// liveness saturation and socket failures surface here.
#[derive(Error, Debug)]
pub enum PollError {
    /// `poll` is only valid while the session is `Idle` or `Sporting`
    #[error("poll is not valid in phase {phase}")]
    InvalidPhase {
        /// Phase the session was in
        phase: SessionPhase,
    },

    /// The liveness counter saturated; the session is lost
    #[error("connection lost after {misses} consecutive unanswered requests")]
    ConnectionLost {
        /// Consecutive sends without a parseable response
        misses: u32,
    },

    /// Socket I/O failed; the session moves to `Error`
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for callers that drive a whole session
#[derive(Error, Debug)]
pub enum BikeError {
    /// Connection establishment failed
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Initialization handshake failed
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A control command failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Polling failed fatally
    #[error(transparent)]
    Poll(#[from] PollError),

    /// The background worker has shut down and can no longer accept requests
    #[error("bike worker is no longer running")]
    WorkerGone,
}

impl BikeError {
    /// Check if this error means the session is gone and a fresh connect is needed
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::Handshake(_)
                | Self::Command(CommandError::ConnectionLost { .. } | CommandError::Io(_))
                | Self::Poll(PollError::ConnectionLost { .. } | PollError::Io(_))
                | Self::WorkerGone
        )
    }
}

/// Result type for bike operations
pub type Result<T, E = BikeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        let lost = BikeError::from(PollError::ConnectionLost { misses: 30 });
        assert!(lost.is_fatal());

        let range = BikeError::from(CommandError::LevelOutOfRange {
            requested: -3,
            min: 1,
            max: 20,
        });
        assert!(!range.is_fatal());

        let phase = BikeError::from(PollError::InvalidPhase {
            phase: SessionPhase::Disconnected,
        });
        assert!(!phase.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let error = HandshakeError::Malformed {
            step: HandshakeStep::ResistanceRange,
            frame: "<EP_SUPERWIGH>".to_string(),
        };
        let text = format!("{error}");
        assert!(text.contains("resistance range"));
        assert!(text.contains("EP_SUPERWIGH"));
    }
}

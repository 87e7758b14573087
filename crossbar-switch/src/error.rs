//! Switch error types.

use std::io;

use thiserror::Error;

/// Errors surfaced by the switch and its connection machinery.
///
/// The enum is `Clone` so one terminal error can be delivered to every dial
/// request waiting on the same connection; I/O errors are carried as their
/// rendered message for that reason.
#[derive(Debug, Clone, Error)]
pub enum SwitchError {
    /// A dial named the local peer.
    #[error("cannot dial to self")]
    DialSelf,

    /// No transport is registered that could carry a dial.
    #[error("no transports registered")]
    NoTransports,

    /// Every available transport failed to dial the peer.
    #[error("all transports failed dialing {peer}")]
    AllTransportsFailed {
        /// Base58 id of the peer that could not be reached.
        peer: String,
    },

    /// Protocol negotiation failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The encryption handshake failed.
    #[error("encryption failed: {0}")]
    Crypto(String),

    /// The private-network protector rejected the connection.
    #[error("connection protection failed: {0}")]
    Protector(String),

    /// A muxer operation failed.
    #[error("muxer error: {0}")]
    Muxer(String),

    /// The remote closed the stream in the middle of an exchange.
    #[error("unexpected end of stream")]
    UnexpectedEnd,

    /// An event was fed to a connection state it is not legal in.
    #[error("invalid transition: {event} while {state}")]
    InvalidTransition {
        /// State the connection was in.
        state: &'static str,
        /// Event that was rejected.
        event: &'static str,
    },

    /// A lifecycle operation was requested from an incompatible state.
    #[error("switch is {state}, cannot {op}")]
    Lifecycle {
        /// Current lifecycle state.
        state: &'static str,
        /// The operation that was refused.
        op: &'static str,
    },

    /// The dial was aborted before completing.
    #[error("dial aborted")]
    Aborted,

    /// No usable connection to the peer exists.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// I/O error, rendered.
    #[error("i/o error: {0}")]
    Io(String),
}

impl SwitchError {
    /// Stable identifier of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            SwitchError::DialSelf => "DIAL_SELF",
            SwitchError::NoTransports => "NO_TRANSPORTS_REGISTERED",
            SwitchError::AllTransportsFailed { .. } => "ALL_TRANSPORTS_FAILED",
            SwitchError::Negotiation(_) => "NEGOTIATION_FAILED",
            SwitchError::Crypto(_) => "ENCRYPTION_FAILED",
            SwitchError::Protector(_) => "PROTECTION_FAILED",
            SwitchError::Muxer(_) => "MUXER_FAILED",
            SwitchError::UnexpectedEnd => "UNEXPECTED_END",
            SwitchError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SwitchError::Lifecycle { .. } => "INVALID_LIFECYCLE_STATE",
            SwitchError::Aborted => "DIAL_ABORTED",
            SwitchError::NotConnected(_) => "NOT_CONNECTED",
            SwitchError::Io(_) => "IO_ERROR",
        }
    }

    /// Classify a lower-layer error, mapping end-of-stream conditions to
    /// [`SwitchError::UnexpectedEnd`].
    pub fn maybe_unexpected_end(err: SwitchError) -> SwitchError {
        match &err {
            SwitchError::Io(msg) if msg.contains("unexpected end of file") => {
                SwitchError::UnexpectedEnd
            }
            SwitchError::Io(msg) if msg.contains("early eof") => SwitchError::UnexpectedEnd,
            _ => err,
        }
    }

    /// Whether a shutdown error is the benign sentinel some muxers report
    /// when ended deliberately.
    pub fn is_benign_shutdown(&self) -> bool {
        matches!(self, SwitchError::Muxer(msg) if msg == "Fatal error: OK")
    }
}

impl From<io::Error> for SwitchError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return SwitchError::UnexpectedEnd;
        }
        SwitchError::Io(e.to_string())
    }
}

/// Result type for switch operations.
pub type SwitchResult<T> = Result<T, SwitchError>;

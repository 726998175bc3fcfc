//! Error taxonomy for the Calypso secure-session core.
//!
//! Every failure surfaced by this crate is exactly one [`ErrorKind`]. A
//! [`CalypsoError`] additionally carries the [`AuditEntry`] trail
//! accumulated so far during the `process_commands`/`process_cancel` call
//! that failed, attaching a partial response to
//! `ReaderBrokenCommunication`/`CardBrokenCommunication`.

use std::fmt;

use crate::apdu::StatusWord;

/// Kinds of errors this crate can raise.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    /// Invalid range/null at the API boundary.
    #[error("illegal argument")]
    IllegalArgument,

    /// Operation not allowed in the current state.
    #[error("improper state")]
    ImproperState,

    /// Feature not available on this card.
    #[error("unsupported operation")]
    UnsupportedOperation,

    /// Modifying command would overflow the session buffer and
    /// multiple-session mode is disabled.
    #[error("session buffer overflow")]
    SessionBufferOverflow,

    /// Communication with the card reader failed.
    #[error("reader I/O error")]
    ReaderIo,

    /// Communication with the card itself failed.
    #[error("card I/O error")]
    CardIo,

    /// Card returned a status word not matching the command's table.
    #[error("unexpected command status")]
    UnexpectedCommandStatus,

    /// Number of responses did not match the number of requests.
    #[error("inconsistent data")]
    InconsistentData,

    /// File not found during selection.
    #[error("select file failed")]
    SelectFile,

    /// The computed (KIF, KVC) pair is not in the authorised set.
    #[error("unauthorized key")]
    UnauthorizedKey,

    /// Card's session MAC did not validate.
    #[error("invalid card session MAC")]
    InvalidCardSessionMac,

    /// Card's SV MAC did not validate.
    #[error("invalid card SV MAC")]
    InvalidCardSvMac,

    /// Certificate chain invalid in PKI mode.
    #[error("invalid certificate")]
    InvalidCertificate,

    /// Crypto provider I/O failure during final verification.
    #[error("card signature not verifiable")]
    CardSignatureNotVerifiable,

    /// Crypto provider logic failure.
    #[error("crypto error")]
    Crypto,

    /// Crypto provider I/O failure.
    #[error("crypto I/O error")]
    CryptoIo,

    /// A value needed to build an anticipated response was missing from
    /// the card image.
    #[error("anticipation failure")]
    AnticipationFailure,

    /// Status word not present in any status table.
    #[error("unknown status word")]
    UnknownStatus,
}

/// One entry of the append-only audit trail.
///
/// Recorded for every APDU exchanged during a `process_commands`/
/// `process_cancel` call, in strict order, and never mutated after it is
/// pushed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuditEntry {
    /// Human-readable name of the command this exchange belongs to.
    pub command_ref: &'static str,
    /// Raw bytes sent to the card (or SAM).
    pub request_bytes: Vec<u8>,
    /// Raw bytes received in response, if any arrived before failure.
    pub response_bytes: Vec<u8>,
    /// Status word extracted from `response_bytes`, if a full response
    /// was received.
    pub status_word: Option<StatusWord>,
    /// Whether this exchange was considered successful by the command's
    /// status table.
    pub successful: bool,
}

impl AuditEntry {
    pub(crate) fn new(command_ref: &'static str, request_bytes: Vec<u8>) -> Self {
        Self {
            command_ref,
            request_bytes,
            response_bytes: Vec::new(),
            status_word: None,
            successful: false,
        }
    }
}

/// A failure raised by the Calypso core, carrying the audit trail
/// accumulated up to the point of failure.
#[derive(Debug)]
pub struct CalypsoError {
    kind: ErrorKind,
    description: Option<String>,
    audit_trail: Vec<AuditEntry>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CalypsoError {
    /// Create a new error of the given kind with no extra description.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            description: None,
            audit_trail: Vec::new(),
            source: None,
        }
    }

    /// Create a new error of the given kind with a human-readable
    /// description.
    pub fn with_description(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: Some(description.into()),
            audit_trail: Vec::new(),
            source: None,
        }
    }

    /// Attach a source error (e.g. from the crypto provider or transport).
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach the audit trail accumulated so far. Called once, by
    /// `process_commands`/`process_cancel`, right before returning `Err`.
    pub fn with_audit_trail(mut self, audit_trail: Vec<AuditEntry>) -> Self {
        self.audit_trail = audit_trail;
        self
    }

    /// The kind of error this is.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The audit trail accumulated up to the point of failure.
    pub fn audit_trail(&self) -> &[AuditEntry] {
        &self.audit_trail
    }
}

impl fmt::Display for CalypsoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.kind, description),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for CalypsoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for CalypsoError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CalypsoError>;

/// Create and return a [`CalypsoError`] of a given kind with a formatted
/// description.
macro_rules! fail {
    ($kind:expr, $msg:expr) => {
        return Err($crate::error::CalypsoError::with_description($kind, $msg))
    };
    ($kind:expr, $fmt:expr, $($arg:tt)+) => {
        return Err($crate::error::CalypsoError::with_description($kind, format!($fmt, $($arg)+)))
    };
}

/// Check a condition, failing with the given error kind/message otherwise.
macro_rules! ensure {
    ($cond:expr, $kind:expr, $msg:expr) => {
        if !$cond {
            fail!($kind, $msg);
        }
    };
    ($cond:expr, $kind:expr, $fmt:expr, $($arg:tt)+) => {
        if !$cond {
            fail!($kind, $fmt, $($arg)+);
        }
    };
}

pub(crate) use ensure;
pub(crate) use fail;

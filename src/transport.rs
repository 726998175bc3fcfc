//! Reader transport interface.
//!
//! The physical card/SAM reader is out of scope: this module only
//! defines the narrow request/response contract the session state
//! machine and transaction manager drive it through (request in,
//! structured response or a distinguished I/O failure out).

use crate::apdu::StatusWord;
use crate::types::ChannelControl;

/// One APDU exchange's response: the raw bytes (including the trailing
/// status word) and the status word extracted for convenience.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApduResponse {
    /// Full response bytes, including the trailing 2-byte status word.
    pub bytes: Vec<u8>,
    /// Status word extracted from `bytes`.
    pub status_word: StatusWord,
}

/// A batch of APDUs to transmit in order.
#[derive(Clone, Debug, Default)]
pub struct CardRequest {
    /// The APDUs to send, in order.
    pub apdus: Vec<Vec<u8>>,
    /// Stop transmitting (and return what was received so far) as soon
    /// as one APDU's status word falls outside its command's status
    /// table, rather than sending the rest of the batch.
    pub stop_on_unexpected_sw: bool,
}

/// The responses to a [`CardRequest`], one per transmitted APDU.
#[derive(Clone, Debug, Default)]
pub struct CardResponse {
    /// Responses received, in request order. May be shorter than the
    /// request's `apdus` if `stop_on_unexpected_sw` stopped transmission
    /// early, or if communication broke mid-batch.
    pub apdus: Vec<ApduResponse>,
}

/// Failure transmitting a [`CardRequest`].
#[derive(Debug)]
pub enum TransportError {
    /// Communication with the card reader itself failed (e.g. USB/NFC
    /// driver error). May carry whatever responses arrived before the
    /// failure.
    ReaderBrokenCommunication {
        /// Responses received before the reader failed, if any.
        partial_response: Option<CardResponse>,
        /// Underlying I/O error.
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// Communication with the card broke (e.g. tear/out-of-field). May
    /// carry whatever responses arrived before the failure.
    CardBrokenCommunication {
        /// Responses received before the card went silent, if any.
        partial_response: Option<CardResponse>,
        /// Underlying I/O error.
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// The reader itself reported a status word outside any command's
    /// expectations (distinct from the core's own status-table check,
    /// which happens after a `CardResponse` is successfully obtained).
    UnexpectedStatusWord {
        /// The response that carried the unexpected status word.
        response: CardResponse,
    },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ReaderBrokenCommunication { .. } => write!(f, "reader communication broken"),
            TransportError::CardBrokenCommunication { .. } => write!(f, "card communication broken"),
            TransportError::UnexpectedStatusWord { .. } => write!(f, "reader reported an unexpected status word"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::ReaderBrokenCommunication { source, .. }
            | TransportError::CardBrokenCommunication { source, .. } => Some(source.as_ref()),
            TransportError::UnexpectedStatusWord { .. } => None,
        }
    }
}

/// The reader transport this crate drives, out of scope for this crate's
/// own implementation but consumed by the session state
/// machine and transaction manager.
pub trait ReaderTransport {
    /// Transmit `request`'s APDUs in order, returning their responses.
    fn transmit(
        &mut self,
        request: CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, TransportError>;
}

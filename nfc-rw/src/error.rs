// nfc-rw-rs/nfc-rw/src/error.rs

use thiserror::Error;

use crate::types::Protocol;

/// 共通エラー型
///
/// Returned synchronously by every API entry point. The asynchronous outcome
/// of an accepted operation is reported through [`crate::events::RwEvent`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An operation is already in flight on this engine.
    #[error("engine busy: another operation is in progress")]
    Busy,

    /// No tag is selected, or the engine was deactivated.
    #[error("tag not activated")]
    NotActivated,

    /// The request is not allowed in the tag's current state.
    #[error("request refused: {0}")]
    Refused(String),

    /// The request does not fit the tag (too large, read-only, ...).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// NDEF detection has not completed successfully.
    #[error("ndef message not initialized")]
    NotInitialized,

    /// `select` was called without an event callback.
    #[error("select requires an event callback")]
    NoCallback,

    /// No engine exists for this protocol.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(Protocol),

    /// A family-specific call was made on a tag of another family.
    #[error("wrong protocol: expected {expected}, active {actual}")]
    WrongProtocol {
        /// Protocol the call was meant for.
        expected: Protocol,
        /// Protocol of the selected tag.
        actual: Protocol,
    },

    // 送信失敗は再送しない (何も送られていないため)
    /// The transport failed to send a frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// No scratch buffer could be obtained for the operation.
    #[error("no buffers available")]
    NoBuffers,

    /// A frame is shorter than its command requires.
    #[error("invalid packet length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Minimum length required.
        expected: usize,
        /// Length received.
        actual: usize,
    },

    /// An argument is out of range for the tag.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Tag memory holds inconsistent NDEF or TLV data.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// The tag answered with an error flag.
    #[error("tag error: code={code:#04x}")]
    TagError {
        /// Error code byte from the tag.
        code: u8,
    },

    /// No response before the timer expired.
    #[error("operation timed out")]
    Timeout,

    /// Generic failure with a reason.
    #[error("operation failed: {0}")]
    Failed(String),
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for `Error::Refused` with a formatted reason.
    pub fn refused(reason: impl Into<String>) -> Self {
        Error::Refused(reason.into())
    }

    /// Shorthand for `Error::Rejected` with a formatted reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::Rejected(reason.into())
    }

    /// Shorthand for `Error::Failed` with a formatted reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Error::Failed(reason.into())
    }
}

//! Error types for every stage of the telemetry cycle.
//!
//! Each stage owns a small error enum. [`CycleError`] wraps them so a cycle
//! can report a single failure, and [`ErrorFlags`] folds failures into the
//! bitmask that the next outbound payload carries back to the backend.

use thiserror::Error;

/// Errors raised by the token scanner.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum ParseError {
    /// The counting pass found more tokens than the caller's limit.
    #[error("more than {limit} tokens")]
    TooManyTokens {
        /// The token limit that was exceeded.
        limit: usize,
    },
    /// The fill pass produced a different number of tokens than the count pass.
    #[error("count pass found {counted} tokens, fill pass {filled}")]
    ParseMismatch {
        /// Tokens found by the counting pass.
        counted: usize,
        /// Tokens produced by the fill pass.
        filled: usize,
    },
    /// The top-level value is not an object.
    #[error("top-level value is not an object")]
    UnexpectedRoot,
    /// A byte that cannot appear at this position.
    #[error("unexpected byte at offset {offset}")]
    Invalid {
        /// Offset of the offending byte.
        offset: usize,
    },
    /// The input ended inside a value.
    #[error("input ended inside a value")]
    Incomplete,
    /// Containers are nested deeper than the scanner follows.
    #[error("nesting deeper than {limit} levels")]
    TooDeep {
        /// The nesting limit.
        limit: usize,
    },
    /// The input cannot be addressed by 16 bit token offsets.
    #[error("input longer than {limit} bytes")]
    InputTooLong {
        /// The longest accepted input.
        limit: usize,
    },
}

/// Errors raised while verifying an inbound response.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum VerifyError {
    /// The response could not be tokenized.
    #[error("malformed response: {0}")]
    Malformed(#[from] ParseError),
    /// An envelope key appears more than once at the top level.
    #[error("envelope key appears more than once")]
    DuplicateField,
    /// The protocol version is missing or below the accepted minimum.
    #[error("protocol version mismatch")]
    ProtocolMismatch,
    /// The signature is missing, not valid base64, or of the wrong length.
    #[error("signature could not be decoded")]
    SignatureDecodeError,
    /// The payload is missing or is not an object.
    #[error("payload missing or not an object")]
    MissingPayload,
    /// Hashing the payload would exceed the free memory.
    #[error("{needed} bytes needed for verification, {available} available")]
    InsufficientMemory {
        /// The memory budget estimate.
        needed: usize,
        /// The probe's reading.
        available: usize,
    },
    /// The recomputed hash differs from the claimed signature.
    #[error("signature does not match payload")]
    SignatureInvalid,
    /// The signed message does not fit the staging buffer.
    #[error("signed message exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Capacity of the staging buffer.
        limit: usize,
    },
}

/// Errors raised while building an outbound envelope.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum BuildError {
    /// An intermediate field would overflow its fixed-size buffer.
    #[error("envelope buffer too small")]
    BufferTooSmall,
    /// A payload key contains a quote, backslash or control byte.
    #[error("payload key cannot be written verbatim")]
    InvalidKey,
    /// A fixed-point reading is NaN or infinite, or too large to format.
    #[error("fixed-point reading is not representable")]
    NonFinite,
    /// A fixed-point reading asks for more decimals than supported.
    #[error("{0} decimal places requested")]
    TooManyDecimals(u8),
}

/// Errors raised when constructing a [`DeviceIdentity`](crate::identity::DeviceIdentity).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum IdentityError {
    /// The identity does not have the fixed width.
    #[error("identity is {found} bytes, expected {expected}")]
    WrongLength {
        /// The fixed identity width.
        expected: usize,
        /// The length that was supplied.
        found: usize,
    },
    /// The identity contains a byte outside printable ASCII.
    #[error("identity byte at offset {offset} is not printable ASCII")]
    InvalidByte {
        /// Offset of the offending byte.
        offset: usize,
    },
}

/// Failures of the transport collaborator, as seen by the cycle.
///
/// The collaborator's own error values are opaque and are not carried.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum TransportError {
    /// The POST request could not be sent.
    #[error("POST request failed")]
    Post,
    /// The backend answered with a status other than 200.
    #[error("HTTP status {0}")]
    Status(u16),
    /// The announced response does not fit the response buffer.
    #[error("response of {length} bytes exceeds {limit}")]
    ResponseTooLong {
        /// The announced response length.
        length: usize,
        /// Capacity of the response buffer.
        limit: usize,
    },
    /// Reading a response chunk failed.
    #[error("reading response failed")]
    Read,
    /// A chunk read returned no bytes before the response was complete.
    #[error("response stalled at offset {offset}")]
    Stalled {
        /// Bytes received so far.
        offset: usize,
    },
}

/// A failed telemetry cycle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum CycleError {
    /// The outbound envelope could not be built.
    #[error("build: {0}")]
    Build(#[from] BuildError),
    /// The exchange with the backend failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// The response was rejected.
    #[error("verify: {0}")]
    Verify(#[from] VerifyError),
}

bitflags::bitflags! {
    /// Failures accumulated since the last successfully delivered report.
    ///
    /// The bits are sent to the backend under
    /// [`KEY_ERROR_FLAGS`](crate::consts::KEY_ERROR_FLAGS) and cleared once
    /// the report carrying them has been accepted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorFlags: u16 {
        /// The request could not be sent or the response could not be read.
        const TRANSPORT = 1 << 0;
        /// The backend answered with a non-200 status.
        const HTTP_STATUS = 1 << 1;
        /// The response was too long to buffer.
        const RESPONSE_TOO_LONG = 1 << 2;
        /// The response was not a well-formed envelope.
        const MALFORMED = 1 << 3;
        /// The response carried an unsupported protocol version.
        const PROTOCOL = 1 << 4;
        /// The response signature could not be decoded.
        const SIGNATURE_DECODE = 1 << 5;
        /// Verification was skipped for lack of memory.
        const INSUFFICIENT_MEMORY = 1 << 6;
        /// The response signature did not match.
        const SIGNATURE_INVALID = 1 << 7;
        /// The outbound envelope could not be built.
        const BUILD = 1 << 8;
    }
}

impl From<&CycleError> for ErrorFlags {
    fn from(err: &CycleError) -> Self {
        match err {
            CycleError::Build(_) => ErrorFlags::BUILD,
            CycleError::Transport(TransportError::Status(_)) => ErrorFlags::HTTP_STATUS,
            CycleError::Transport(TransportError::ResponseTooLong { .. }) => {
                ErrorFlags::RESPONSE_TOO_LONG
            }
            CycleError::Transport(_) => ErrorFlags::TRANSPORT,
            CycleError::Verify(VerifyError::ProtocolMismatch) => ErrorFlags::PROTOCOL,
            CycleError::Verify(VerifyError::SignatureDecodeError) => ErrorFlags::SIGNATURE_DECODE,
            CycleError::Verify(VerifyError::InsufficientMemory { .. }) => {
                ErrorFlags::INSUFFICIENT_MEMORY
            }
            CycleError::Verify(VerifyError::SignatureInvalid) => ErrorFlags::SIGNATURE_INVALID,
            CycleError::Verify(_) => ErrorFlags::MALFORMED,
        }
    }
}

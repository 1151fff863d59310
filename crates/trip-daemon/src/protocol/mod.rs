//! The verifier's byte-level protocol surface.
//!
//! Transport is out of scope: the verifier consumes frames of bytes and
//! emits frames of bytes. This module defines the framing codec, the
//! message envelope, and the challenge triple
//! (request/challenge/response) wire formats.

mod framing;
mod messages;

use thiserror::Error;
use trip_core::codec::CodecError;

pub use framing::{FrameCodec, MAX_FRAME_SIZE};
pub use messages::{
    Frame, LivenessChallenge, LivenessResponse, VerificationRequest, WireError,
};

/// Errors from frame-level I/O.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying transport error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame exceeds the protocol cap.
    #[error("frame too large: {size} bytes exceeds {max}")]
    FrameTooLarge {
        /// Declared or actual frame size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// Frame payload is not a canonical message encoding.
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
}

/// Protocol error codes carried in error frames.
///
/// Every fallible operation maps onto exactly one of these wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ErrorCode {
    /// Input was not a canonical encoding.
    MalformedEncoding = 1,
    /// A signature failed verification.
    InvalidSignature = 2,
    /// Breadcrumb index was not the next expected value.
    IndexGap = 3,
    /// Timestamp regressed.
    TimestampRegress = 4,
    /// Predecessor-hash linkage broke.
    BrokenLink = 5,
    /// Adjacent breadcrumbs shared a cell.
    DuplicateCell = 6,
    /// Collection interval under the hard floor.
    IntervalTooShort = 7,
    /// Per-cell occupancy cap exceeded.
    CellCapExceeded = 8,
    /// A nonce was presented twice.
    NonceReuse = 9,
    /// Response nonce did not echo the challenge.
    NonceMismatch = 10,
    /// Response head hash did not match the stored head.
    HeadHashMismatch = 11,
    /// The attester missed the response deadline.
    ChallengeTimeout = 12,
    /// The relying party withdrew the challenge.
    Cancelled = 13,
    /// Worker pool or challenge slots saturated.
    ResourceExhausted = 14,
    /// Token bucket empty.
    RateLimited = 15,
    /// Identity is not served by this verifier's registry.
    UntrustedIdentity = 16,
    /// Persistence failure.
    IoFault = 17,
    /// Request parameters outside protocol bounds.
    InvalidRequest = 18,
}

impl ErrorCode {
    /// Wire value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self as u64
    }

    /// Parses a wire value.
    #[must_use]
    pub const fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            1 => Self::MalformedEncoding,
            2 => Self::InvalidSignature,
            3 => Self::IndexGap,
            4 => Self::TimestampRegress,
            5 => Self::BrokenLink,
            6 => Self::DuplicateCell,
            7 => Self::IntervalTooShort,
            8 => Self::CellCapExceeded,
            9 => Self::NonceReuse,
            10 => Self::NonceMismatch,
            11 => Self::HeadHashMismatch,
            12 => Self::ChallengeTimeout,
            13 => Self::Cancelled,
            14 => Self::ResourceExhausted,
            15 => Self::RateLimited,
            16 => Self::UntrustedIdentity,
            17 => Self::IoFault,
            18 => Self::InvalidRequest,
            _ => return None,
        })
    }
}

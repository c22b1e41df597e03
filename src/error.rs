//! The error type returned by every fallible engine operation.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PeerId};

/// This enum contains all error messages this library can return. Most API
/// functions will generally return a [`Result<(), NetcodeError>`].
///
/// Errors split into two families, mirroring the engine's propagation policy:
/// recoverable conditions (late, duplicate or orphaned input, a single
/// malformed message) that callers log and move past, and integrity faults
/// ([`NetcodeError::MismatchedChecksum`]) that indicate state divergence and
/// are surfaced as typed events rather than silently absorbed.
///
/// [`Result<(), NetcodeError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq)]
pub enum NetcodeError {
    /// An input arrived for a frame that the aggregator has already closed.
    /// The input is dropped; the frame it targeted is unaffected.
    LateInput {
        /// The peer that sent the input.
        peer: PeerId,
        /// The frame the input targeted.
        frame: Frame,
        /// The most recent frame already constructed.
        closed: Frame,
    },
    /// An input for this (peer, frame) pair was already buffered; the first
    /// one wins.
    DuplicateInput {
        /// The peer that sent the input.
        peer: PeerId,
        /// The frame the input targeted.
        frame: Frame,
    },
    /// The peer is not registered (never added, or already removed).
    UnknownPeer {
        /// The unknown peer id.
        peer: PeerId,
    },
    /// The peer id is already registered.
    DuplicatePeer {
        /// The conflicting peer id.
        peer: PeerId,
    },
    /// A frame index fell outside a queue's retained range `[first, last]`.
    OutOfRange {
        /// The requested frame.
        frame: Frame,
        /// The lowest retained frame.
        first: Frame,
        /// The highest retained frame.
        last: Frame,
    },
    /// The predictive timeline is already the maximum allowed distance ahead
    /// of the authoritative one; the tick is refused until the server catches
    /// up.
    PredictionThreshold {
        /// The predictive frame at which the tick was refused.
        frame: Frame,
    },
    /// The server's checksum for a frame does not match the locally computed
    /// one: the two simulations have diverged. The engine does not attempt
    /// resynchronization.
    MismatchedChecksum {
        /// The frame both checksums describe.
        frame: Frame,
        /// The locally computed checksum.
        local: u64,
        /// The checksum the server attached.
        remote: u64,
    },
    /// Serialization or deserialization of simulation data failed.
    Serialization {
        /// A description of what failed to serialize or deserialize.
        context: String,
    },
    /// A wire message was malformed (unknown tag, truncated body, length
    /// mismatch). The message is discarded; the connection continues.
    Protocol {
        /// A description of the violation.
        context: String,
    },
    /// You made an invalid request, usually by using wrong parameters for
    /// function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The session has not been initialized with a state snapshot yet.
    NotInitialized,
    /// The session has terminated; no further operations are accepted.
    Terminated,
}

impl Display for NetcodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetcodeError::LateInput {
                peer,
                frame,
                closed,
            } => {
                write!(
                    f,
                    "input from peer {} for frame {} arrived late (frame {} already closed)",
                    peer, frame, closed
                )
            }
            NetcodeError::DuplicateInput { peer, frame } => {
                write!(f, "duplicate input from peer {} for frame {}", peer, frame)
            }
            NetcodeError::UnknownPeer { peer } => {
                write!(f, "peer {} is not registered", peer)
            }
            NetcodeError::DuplicatePeer { peer } => {
                write!(f, "peer {} is already registered", peer)
            }
            NetcodeError::OutOfRange { frame, first, last } => {
                write!(
                    f,
                    "frame {} is outside the retained range [{}, {}]",
                    frame, first, last
                )
            }
            NetcodeError::PredictionThreshold { frame } => {
                write!(
                    f,
                    "prediction threshold reached at frame {}, cannot speculate further ahead",
                    frame
                )
            }
            NetcodeError::MismatchedChecksum {
                frame,
                local,
                remote,
            } => {
                write!(
                    f,
                    "checksum mismatch at frame {}: local {:#018x}, remote {:#018x}",
                    frame, local, remote
                )
            }
            NetcodeError::Serialization { context } => {
                write!(f, "serialization error: {}", context)
            }
            NetcodeError::Protocol { context } => {
                write!(f, "protocol violation: {}", context)
            }
            NetcodeError::InvalidRequest { info } => {
                write!(f, "invalid request: {}", info)
            }
            NetcodeError::NotInitialized => {
                write!(f, "the session has not been initialized yet")
            }
            NetcodeError::Terminated => {
                write!(f, "the session has terminated")
            }
        }
    }
}

impl Error for NetcodeError {}

// #########
// # TESTS #
// #########

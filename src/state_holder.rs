//! Ownership wrapper around one simulation instance.
//!
//! A [`StateHolder`] is the only thing in the engine that touches a
//! [`Simulation`] directly: it steps it, serializes it and checksums it, with
//! the serialization and checksum cached until the next step. Three distinct
//! holders exist in a running system - the server's authoritative state, the
//! client's authoritative mirror and the client's predictive state - and they
//! are never aliased: the predictive instance must be freely rewindable
//! without corrupting the authoritative one.

use crate::error::NetcodeError;
use crate::{checksum, codec, Frame, SimUpdateInput, Simulation, UpdateOutput};

/// Owns exactly one simulation instance and provides update / serialize /
/// checksum with caching.
#[derive(Debug)]
pub struct StateHolder<S: Simulation> {
    state: S,
    frame: Frame,
    serialized: Option<Vec<u8>>,
    checksum: Option<u64>,
}

impl<S: Simulation> StateHolder<S> {
    /// Wraps a freshly constructed state at [`Frame::PRE_SIM`].
    #[must_use]
    pub fn new(state: S) -> Self {
        Self {
            state,
            frame: Frame::PRE_SIM,
            serialized: None,
            checksum: None,
        }
    }

    /// Deserializes a snapshot taken at `frame` into a new holder.
    pub fn from_snapshot(frame: Frame, bytes: &[u8]) -> Result<Self, NetcodeError> {
        let state = codec::decode_value(bytes)?;
        Ok(Self {
            state,
            frame,
            serialized: Some(bytes.to_vec()),
            checksum: None,
        })
    }

    /// Replaces the held state with a snapshot taken at `frame`.
    ///
    /// This is the rollback primitive: the predictive holder is reset from an
    /// authoritative snapshot before being re-stepped forward.
    pub fn reset_from_snapshot(&mut self, frame: Frame, bytes: &[u8]) -> Result<(), NetcodeError> {
        self.state = codec::decode_value(bytes)?;
        self.frame = frame;
        self.serialized = Some(bytes.to_vec());
        self.checksum = None;
        Ok(())
    }

    /// Advances the state by exactly one frame.
    ///
    /// Increments the frame counter, invalidates the cached serialization and
    /// checksum, and invokes the deterministic step. A step error is contained
    /// here: it is logged and a neutral [`UpdateOutput`] is substituted, so a
    /// single buggy simulation frame cannot crash the tick loop or sibling
    /// connections.
    pub fn update(&mut self, input: &SimUpdateInput<S>) -> UpdateOutput {
        self.frame += 1;
        self.serialized = None;
        self.checksum = None;
        match self.state.update(input) {
            Ok(output) => output,
            Err(error) => {
                tracing::error!(
                    frame = self.frame.as_i64(),
                    %error,
                    "simulation step failed, substituting neutral output"
                );
                UpdateOutput::default()
            }
        }
    }

    /// The frame the held state is at ([`Frame::PRE_SIM`] before any step).
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Read access to the held state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// The canonical serialization of the current state, computed lazily and
    /// cached until the next [`StateHolder::update`].
    pub fn serialized_state(&mut self) -> Result<&[u8], NetcodeError> {
        if self.serialized.is_none() {
            self.serialized = Some(codec::encode(&self.state)?);
        }
        // The cache was just filled above; a miss here is unreachable.
        self.serialized
            .as_deref()
            .ok_or_else(|| NetcodeError::Serialization {
                context: "serialization cache unexpectedly empty".to_owned(),
            })
    }

    /// The checksum of the canonical serialization, computed lazily and
    /// cached until the next [`StateHolder::update`].
    pub fn checksum(&mut self) -> Result<u64, NetcodeError> {
        if let Some(checksum) = self.checksum {
            return Ok(checksum);
        }
        let checksum = checksum::state_checksum(self.serialized_state()?);
        self.checksum = Some(checksum);
        Ok(checksum)
    }

    /// The current frame together with an owned copy of the canonical
    /// serialization (the payload of an `Initialize` message, or a rollback
    /// baseline).
    pub fn snapshot(&mut self) -> Result<(Frame, Vec<u8>), NetcodeError> {
        let frame = self.frame;
        let bytes = self.serialized_state()?.to_vec();
        Ok((frame, bytes))
    }
}

// #########
// # TESTS #
// #########

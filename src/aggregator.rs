//! Server-side aggregation of scattered input arrivals into canonical
//! per-frame batches.
//!
//! Inputs reach the server out of order, duplicated, late or not at all; the
//! simulation needs exactly one ordered [`UpdateInput`](crate::UpdateInput)
//! per frame. The [`InputAggregator`] is the funnel between the two: it
//! buffers early arrivals, rejects late and duplicate ones, substitutes the
//! neutral default for missing ones, and surfaces peer removal exactly once
//! as a `terminated` entry.
//!
//! Peers are iterated in ascending-id order when a batch is constructed, so
//! the batch - and therefore the resulting state checksum - is independent of
//! network arrival order. This ordering is a precondition for determinism,
//! not a cosmetic choice.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use smallvec::SmallVec;
use web_time::{Duration, Instant};

use crate::error::NetcodeError;
use crate::{Frame, InputEntry, InputVec, PeerId, SimUpdateInput, Simulation, UpdateInput};

/// A buffered input together with its arrival timestamp (kept for delay
/// feedback to the sending peer).
#[derive(Debug, Clone, Copy)]
struct BufferedInput<I> {
    input: I,
    arrived: Instant,
}

/// One constructed frame: the canonical input batch plus the bookkeeping the
/// server needs to answer the peers that fed it.
#[derive(Debug, Clone)]
pub struct AggregatedFrame<S: Simulation> {
    /// The frame this batch advances the simulation to.
    pub frame: Frame,
    /// The canonical per-frame input, entries ordered by ascending peer id.
    pub input: SimUpdateInput<S>,
    /// For each peer whose real input made it into the batch, how long that
    /// input sat buffered before it was consumed. This is the `SetDelay`
    /// feedback that drives the peer's clock pacing.
    pub slack: SmallVec<[(PeerId, Duration); 4]>,
    /// Peers whose input never arrived and were substituted with the default.
    pub missed: SmallVec<[PeerId; 4]>,
}

/// Converts asynchronous, possibly-late per-peer input arrivals into one
/// canonical ordered batch per frame.
///
/// [`InputAggregator::construct_batch`] is the sole frame-advancing operation
/// on the server side; everything else only feeds buffers.
#[derive(Debug)]
pub struct InputAggregator<S: Simulation> {
    /// Registered peers, keyed (and therefore iterated) by ascending id.
    peers: BTreeMap<PeerId, BTreeMap<i64, BufferedInput<S::ClientInput>>>,
    /// Peers removed since the last batch; each surfaces exactly once as a
    /// `terminated` entry in the next constructed batch.
    pending_termination: BTreeSet<PeerId>,
    /// The most recently constructed frame; starts at [`Frame::PRE_SIM`].
    frame: Frame,
}

impl<S: Simulation> Default for InputAggregator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Simulation> InputAggregator<S> {
    /// Creates an aggregator with no peers, positioned before frame 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            pending_termination: BTreeSet::new(),
            frame: Frame::PRE_SIM,
        }
    }

    /// The most recently constructed frame ([`Frame::PRE_SIM`] before the
    /// first batch).
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Number of currently registered peers (pending terminations excluded).
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Registers a new peer, participating from the next constructed frame
    /// onward.
    ///
    /// Fails with [`NetcodeError::DuplicatePeer`] if the id is registered or
    /// still awaiting its termination entry.
    pub fn add_peer(&mut self, id: PeerId) -> Result<(), NetcodeError> {
        if self.peers.contains_key(&id) || self.pending_termination.contains(&id) {
            return Err(NetcodeError::DuplicatePeer { peer: id });
        }
        self.peers.insert(id, BTreeMap::new());
        Ok(())
    }

    /// Buffers a peer's input for a future frame.
    ///
    /// Late inputs (at or before the last constructed frame) are rejected
    /// with [`NetcodeError::LateInput`]; inputs from unknown peers with
    /// [`NetcodeError::UnknownPeer`]; repeats for the same (peer, frame) with
    /// [`NetcodeError::DuplicateInput`] - the first one wins. All three are
    /// soft conditions: the caller logs and the consuming frame is
    /// unaffected.
    pub fn add_input(
        &mut self,
        id: PeerId,
        frame: Frame,
        input: S::ClientInput,
    ) -> Result<(), NetcodeError> {
        if frame <= self.frame {
            return Err(NetcodeError::LateInput {
                peer: id,
                frame,
                closed: self.frame,
            });
        }
        let buffer = self
            .peers
            .get_mut(&id)
            .ok_or(NetcodeError::UnknownPeer { peer: id })?;
        match buffer.entry(frame.as_i64()) {
            std::collections::btree_map::Entry::Occupied(_) => {
                Err(NetcodeError::DuplicateInput { peer: id, frame })
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(BufferedInput {
                    input,
                    arrived: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Marks a peer for termination.
    ///
    /// The peer is not removed immediately: its removal is surfaced exactly
    /// once, as a `terminated` entry in the next constructed batch, after
    /// which the peer is fully forgotten.
    pub fn remove_peer(&mut self, id: PeerId) -> Result<(), NetcodeError> {
        if self.peers.remove(&id).is_none() {
            return Err(NetcodeError::UnknownPeer { peer: id });
        }
        self.pending_termination.insert(id);
        Ok(())
    }

    /// Constructs the canonical batch for the next frame and advances the
    /// frame counter atomically with it.
    ///
    /// For every registered peer the buffered input for the new frame is
    /// consumed if present, else the neutral default is substituted (a missed
    /// input, reported in [`AggregatedFrame::missed`]); then one `terminated`
    /// entry is appended per pending-termination peer.
    pub fn construct_batch(&mut self, server_input: S::ServerInput) -> AggregatedFrame<S> {
        self.frame += 1;
        let now = Instant::now();

        let mut inputs: InputVec<S::ClientInput> = InputVec::new();
        let mut slack: SmallVec<[(PeerId, Duration); 4]> = SmallVec::new();
        let mut missed: SmallVec<[PeerId; 4]> = SmallVec::new();

        for (&id, buffer) in &mut self.peers {
            match buffer.remove(&self.frame.as_i64()) {
                Some(buffered) => {
                    slack.push((id, now.saturating_duration_since(buffered.arrived)));
                    inputs.push(InputEntry {
                        peer: id,
                        input: buffered.input,
                        terminated: false,
                    });
                }
                None => {
                    tracing::warn!(
                        peer = id.as_i64(),
                        frame = self.frame.as_i64(),
                        "missed input, substituting default"
                    );
                    missed.push(id);
                    inputs.push(InputEntry {
                        peer: id,
                        input: S::ClientInput::default(),
                        terminated: false,
                    });
                }
            }
        }

        for &id in &self.pending_termination {
            inputs.push(InputEntry {
                peer: id,
                input: S::ClientInput::default(),
                terminated: true,
            });
        }
        self.pending_termination.clear();

        AggregatedFrame {
            frame: self.frame,
            input: UpdateInput {
                server_input,
                inputs,
            },
            slack,
            missed,
        }
    }
}

// #########
// # TESTS #
// #########

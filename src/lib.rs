//! # Bastion Netcode
//!
//! Bastion Netcode is a server-authoritative rollback networking engine written
//! in 100% safe Rust. A single server runs the authoritative simulation; every
//! client runs the same deterministic simulation speculatively ahead of the
//! server's timeline, and rewinds/replays its speculative timeline whenever the
//! authoritative inputs turn out to differ from its predictions.
//!
//! The engine owns the frame bookkeeping, the server-side input aggregation,
//! the state stepping/serialization/checksumming, the client-side dual-timeline
//! reconciliation, and the self-adjusting tick clock that keeps a client
//! phase-locked to the server's cadence. Sockets, rendering and the game rules
//! themselves stay on the application side of the boundary: the game is an
//! opaque [`Simulation`] and the transport is whatever moves the byte messages
//! in [`messages`] between peers.
//!
//! ## Determinism contract
//!
//! Everything rests on one contract: feeding identical [`UpdateInput`]
//! sequences to identical initial states must produce byte-identical
//! serialized states on every machine. The engine can recover from late
//! packets, bad predictions and even a panicking-adjacent simulation step, but
//! it cannot repair a violation of this contract - it only detects one (via
//! checksums) and reports it as a desync.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Debug;

pub use aggregator::{AggregatedFrame, InputAggregator};
pub use client::{ClientConfig, ClientRuntime, ClientSession, LocalInputSource};
pub use clock::{Clock, ClockConfig, SynchronizedClock};
pub use error::NetcodeError;
pub use prediction::{NeutralPrediction, PredictionStrategy, RepeatLastKnown};
pub use server::{ServerConfig, ServerFrameOutput, ServerSession};
pub use state_holder::StateHolder;
pub use time_sync::{PaceController, PacingConfig};

pub mod aggregator;
pub mod checksum;
pub mod client;
pub mod clock;
pub mod codec;
pub mod error;
pub mod indexed_queue;
pub mod messages;
pub mod prediction;
pub mod server;
pub mod state_holder;
pub mod time_sync;

// #############
// # CONSTANTS #
// #############

/// The frame value denoting "before any simulation step has run".
///
/// A freshly constructed state holder, aggregator or client session reports
/// this frame; the first [`Simulation::update`] advances it to `0`.
pub const PRE_SIM_FRAME: i64 = -1;

// #############
// #   TYPES   #
// #############

/// A frame is a single step of deterministic simulation execution.
///
/// Frames are the fundamental unit of time in the engine: a signed 64-bit
/// monotonic counter that starts at [`PRE_SIM_FRAME`] (-1, "before any step")
/// and increments by exactly one per update. It is never skipped and never
/// decremented - a rollback re-derives history from a snapshot rather than
/// mutating the counter backwards.
///
/// # Examples
///
/// ```
/// use bastion_netcode::Frame;
///
/// let frame = Frame::PRE_SIM;
/// assert!(!frame.is_stepped());
/// assert_eq!(frame.next(), Frame::new(0));
/// assert_eq!(Frame::new(10) - Frame::new(4), 6);
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Frame(i64);

impl Frame {
    /// The frame before any simulation step ([`PRE_SIM_FRAME`]).
    pub const PRE_SIM: Frame = Frame(PRE_SIM_FRAME);

    /// Creates a new `Frame` from an `i64` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i64) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i64` value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns `true` if at least one simulation step has produced this frame.
    #[inline]
    #[must_use]
    pub const fn is_stepped(self) -> bool {
        self.0 >= 0
    }

    /// The frame after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Frame {
        Frame(self.0 + 1)
    }

    /// The frame before this one.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Frame {
        Frame(self.0 - 1)
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::PRE_SIM
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<i64> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i64) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i64> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i64> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i64) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i64;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i64> for Frame {
    #[inline]
    fn from(value: i64) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i64 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i64> for Frame {
    #[inline]
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i64> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A unique identifier for a connected peer.
///
/// Peer ids are assigned by the application (typically at connection accept
/// time) and travel on the wire as `i64`, so a packet can be attributed to its
/// sender without a per-packet handshake.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PeerId(i64);

impl PeerId {
    /// Creates a new `PeerId` from an `i64` value.
    #[inline]
    #[must_use]
    pub const fn new(id: i64) -> Self {
        PeerId(id)
    }

    /// Returns the underlying `i64` value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PeerId {
    #[inline]
    fn from(value: i64) -> Self {
        PeerId(value)
    }
}

/// One peer's contribution to a single frame of simulation input.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEntry<I> {
    /// The peer this input belongs to.
    pub peer: PeerId,
    /// The input payload. For a terminated peer this is the neutral default.
    pub input: I,
    /// Set exactly once, on the first frame after the peer's disconnection
    /// was observed. The peer is absent from all later frames.
    pub terminated: bool,
}

/// Stack-allocated batch of per-peer input entries for one frame.
pub type InputVec<I> = SmallVec<[InputEntry<I>; 4]>;

/// The complete, canonical input for a single deterministic step.
///
/// One `UpdateInput` is constructed per frame, server-side, by the
/// [`InputAggregator`]; clients reconstruct speculative ones from predictions.
/// Entries are ordered by ascending peer id so the batch - and therefore every
/// downstream checksum - is independent of network arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInput<SI, CI> {
    /// Host-side input not attributable to any single peer (e.g. a randomness
    /// seed injected by the server).
    pub server_input: SI,
    /// Per-peer inputs, ordered by ascending peer id.
    pub inputs: InputVec<CI>,
}

impl<SI: Default, CI> Default for UpdateInput<SI, CI> {
    fn default() -> Self {
        Self {
            server_input: SI::default(),
            inputs: SmallVec::new(),
        }
    }
}

/// The [`UpdateInput`] type for a given simulation.
pub type SimUpdateInput<S> =
    UpdateInput<<S as Simulation>::ServerInput, <S as Simulation>::ClientInput>;

/// What a simulation step reports back to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateOutput {
    /// Peers the simulation decided to remove (e.g. eliminated players). The
    /// server kicks them with [`FinishReason::Kicked`].
    pub terminated_peers: Vec<PeerId>,
    /// `true` when the simulation has reached a terminal state and the session
    /// should stop ticking.
    pub should_stop: bool,
}

/// An error raised by a simulation step.
///
/// The engine contains these at the [`StateHolder`] boundary: the failing
/// frame degrades to a neutral [`UpdateOutput`] and the session keeps ticking,
/// because one buggy step must not take down the transport or sibling
/// connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationError {
    /// A description of what went wrong inside the step function.
    pub context: String,
}

impl SimulationError {
    /// Creates a new `SimulationError` with the given context.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "simulation step failed: {}", self.context)
    }
}

impl std::error::Error for SimulationError {}

// #############
// #   ENUMS   #
// #############

/// The closed set of reasons a peer's session can end.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// The peer disconnected normally.
    Disconnect,
    /// The simulation (or the server operator) removed the peer.
    Kicked,
    /// The underlying transport failed.
    NetworkError,
    /// State divergence or unrecoverable protocol corruption was detected.
    Corruption,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Disconnect => write!(f, "disconnect"),
            FinishReason::Kicked => write!(f, "kicked"),
            FinishReason::NetworkError => write!(f, "network error"),
            FinishReason::Corruption => write!(f, "corruption"),
        }
    }
}

/// What to do when a checksum comparison proves the client's simulation has
/// diverged from the server's.
///
/// A desync is a bug in the deterministic step function (or in float/RNG
/// portability), not a network fault; the engine never attempts silent
/// resynchronization either way.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DesyncPolicy {
    /// Treat the divergence as fatal and terminate the session with
    /// [`FinishReason::Corruption`].
    #[default]
    Disconnect,
    /// Report the divergence and keep running.
    LogOnly,
}

/// How often the server attaches a state checksum to authoritative frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Attach a checksum every `interval` frames. At 60hz an interval of 60
    /// yields one comparison per second.
    Interval(u32),
    /// Never attach checksums; desync detection is disabled.
    Off,
}

impl Default for ChecksumMode {
    fn default() -> Self {
        ChecksumMode::Interval(60)
    }
}

/// Notifications a client session produces. Drain them with
/// [`ClientSession::poll_events`]; handling them is up to the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientEvent {
    /// The session received its initial snapshot and entered the predicting
    /// state.
    Initialized {
        /// The frame of the snapshot.
        frame: Frame,
    },
    /// The predictive timeline advanced by one speculative step.
    Predicted {
        /// The new predictive frame.
        frame: Frame,
    },
    /// The authoritative mirror advanced by one confirmed step.
    AuthoritativeAdvanced {
        /// The new authoritative frame.
        frame: Frame,
    },
    /// A misprediction was detected: the predictive timeline was discarded
    /// from `from` and replayed up to `to`.
    RolledBack {
        /// The divergence point (the freshly confirmed frame).
        from: Frame,
        /// The predictive frame that was re-reached by replay.
        to: Frame,
    },
    /// The server's checksum for a frame did not match the one computed
    /// locally: the two simulations have diverged.
    DesyncDetected {
        /// The frame both checksums describe.
        frame: Frame,
        /// Checksum computed by this client's authoritative mirror.
        local_checksum: u64,
        /// Checksum the server attached.
        remote_checksum: u64,
    },
    /// The session has terminated; no further ticks or authoritative
    /// applications will occur.
    Finished {
        /// Why the session ended.
        reason: FinishReason,
    },
}

/// Notifications a server session produces. Drain them with
/// [`ServerSession::poll_events`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerEvent {
    /// A peer was registered with the aggregator.
    PeerJoined {
        /// The new peer.
        peer: PeerId,
    },
    /// A peer was removed; its termination entry will surface in the next
    /// constructed batch.
    PeerRemoved {
        /// The removed peer.
        peer: PeerId,
        /// Why it was removed.
        reason: FinishReason,
    },
    /// The simulation requested a stop; no further frames will be produced.
    Stopped {
        /// The final frame.
        frame: Frame,
    },
}

// #############
// #  TRAITS   #
// #############

/// The deterministic simulation the engine advances, serializes and checksums.
///
/// The engine never inspects the state's fields: it only steps it, serializes
/// it whole, and hashes the serialization. Implementations must uphold the
/// determinism contract described at the [crate root](crate): `update` must be
/// a pure function of the prior state and its input, and serialization must be
/// byte-stable across machines (the engine's [`codec`] uses fixed-width
/// integer encoding toward that end; float canonicalization is on you).
///
/// # Example
///
/// ```
/// use bastion_netcode::{Simulation, SimulationError, UpdateInput, UpdateOutput};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Counter {
///     total: u64,
/// }
///
/// impl Simulation for Counter {
///     type ClientInput = u8;
///     type ServerInput = u64;
///
///     fn desired_tick_rate(&self) -> u32 {
///         60
///     }
///
///     fn update(
///         &mut self,
///         input: &UpdateInput<u64, u8>,
///     ) -> Result<UpdateOutput, SimulationError> {
///         self.total = self.total.wrapping_add(input.server_input);
///         for entry in &input.inputs {
///             self.total = self.total.wrapping_add(u64::from(entry.input));
///         }
///         Ok(UpdateOutput::default())
///     }
/// }
/// ```
pub trait Simulation: Serialize + DeserializeOwned + Send + 'static {
    /// One peer's input for one frame. The [`Default`] value is the neutral
    /// "no input" used for missed inputs and terminated peers.
    type ClientInput: Copy
        + PartialEq
        + Default
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;

    /// Host-side input for one frame, not attributable to any peer. The
    /// [`Default`] value is used for client-side speculative steps.
    type ServerInput: Clone + PartialEq + Default + Debug + Serialize + DeserializeOwned + Send + Sync;

    /// The tick rate this simulation wants to run at, in frames per second.
    fn desired_tick_rate(&self) -> u32;

    /// Advances the state by exactly one frame.
    ///
    /// An `Err` is contained by the engine: the frame's output degrades to
    /// [`UpdateOutput::default`] and the session keeps running.
    fn update(&mut self, input: &SimUpdateInput<Self>) -> Result<UpdateOutput, SimulationError>;
}

// ###################
// # UNIT TESTS      #
// ###################

//! Client-side dual-timeline reconciliation.
//!
//! A client owns two copies of the simulation. The *authoritative mirror*
//! advances only on confirmed server batches and is always a faithful (if
//! lagging) replica of the server's state. The *predictive* copy runs ahead
//! of it on guessed inputs so the player sees their own actions immediately.
//! When a confirmed batch contradicts what was guessed, the predictive
//! timeline is discarded from the divergence point and deterministically
//! replayed from an authoritative snapshot - the rollback that gives the
//! technique its name. When the guess was right (the common case, and the
//! reason prediction is worth doing at all) nothing needs replaying.
//!
//! [`ClientSession`] is the passive state machine - every method is a plain
//! call, which keeps it fully testable without threads or sockets.
//! [`ClientRuntime`] wires a session to a [`SynchronizedClock`] and a local
//! input source so predict ticks fire at the server's cadence.
//!
//! # Locking
//!
//! The authoritative and predictive sides are guarded independently. A
//! reconciliation takes the authoritative lock first (read-mostly snapshot),
//! then the predictive lock; predict ticks take the authoritative lock only
//! briefly to copy the peer roster and release it before stepping. Neither
//! lock is ever held across a blocking wait.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use web_time::Duration;

use crate::clock::{ClockConfig, SynchronizedClock};
use crate::error::NetcodeError;
use crate::indexed_queue::IndexedQueue;
use crate::messages::{InputPacket, ReliableMessage};
use crate::prediction::{PredictionStrategy, RepeatLastKnown};
use crate::state_holder::StateHolder;
use crate::time_sync::PacingConfig;
use crate::{
    codec, ClientEvent, DesyncPolicy, FinishReason, Frame, InputEntry, InputVec, PeerId,
    SimUpdateInput, Simulation, UpdateInput,
};

/// Configuration for a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// This client's connection id (assigned by the server at accept time).
    pub local_peer: PeerId,
    /// What to do when a checksum comparison detects divergence.
    pub desync_policy: DesyncPolicy,
    /// How many frames the predictive timeline may run ahead of the
    /// authoritative one before predict ticks are refused.
    pub max_prediction_window: u32,
}

impl ClientConfig {
    /// Creates a config for the given connection id with default policy and
    /// prediction window.
    #[must_use]
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            desync_policy: DesyncPolicy::default(),
            max_prediction_window: 8,
        }
    }
}

/// Supplies this player's own input for each predicted frame.
///
/// Implemented for any `FnMut(Frame) -> I + Send` closure.
pub trait LocalInputSource<I>: Send {
    /// Samples the local input for `frame`.
    fn sample(&mut self, frame: Frame) -> I;
}

impl<I, F> LocalInputSource<I> for F
where
    F: FnMut(Frame) -> I + Send,
{
    fn sample(&mut self, frame: Frame) -> I {
        self(frame)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Stage {
    Uninitialized,
    Predicting,
    Terminated,
}

struct AuthSide<S: Simulation> {
    holder: StateHolder<S>,
    /// Each peer's most recent confirmed input; the prediction baseline.
    last_known: BTreeMap<PeerId, S::ClientInput>,
}

struct PredictSide<S: Simulation> {
    holder: StateHolder<S>,
    /// Our own inputs per predicted frame; trimmed as frames confirm, and
    /// the source of the unreliable resend aggregate.
    local_inputs: IndexedQueue<S::ClientInput>,
    /// The batch each predictive step actually used, kept so a confirmed
    /// batch can be compared against what was guessed for that frame.
    predicted: IndexedQueue<SimUpdateInput<S>>,
}

/// The client-side reconciliation state machine:
/// uninitialized -> predicting -> terminated.
///
/// All methods are callable from any thread; see the [module docs](self) for
/// the locking discipline. The invariant `auth_frame <= predict_frame` holds
/// at every observable instant.
pub struct ClientSession<S: Simulation> {
    config: ClientConfig,
    predictor: Box<dyn PredictionStrategy<S::ClientInput>>,
    stage: Mutex<Stage>,
    auth: Mutex<Option<AuthSide<S>>>,
    predict: Mutex<Option<PredictSide<S>>>,
    events: Mutex<VecDeque<ClientEvent>>,
}

impl<S: Simulation> std::fmt::Debug for ClientSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("local_peer", &self.config.local_peer)
            .field("stage", &*self.stage.lock())
            .field("auth_frame", &self.auth_frame())
            .field("predict_frame", &self.predict_frame())
            .finish()
    }
}

impl<S: Simulation> ClientSession<S> {
    /// Creates an uninitialized session with the default prediction strategy
    /// ([`RepeatLastKnown`]).
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_predictor(config, Box::new(RepeatLastKnown))
    }

    /// Creates an uninitialized session with a custom prediction strategy.
    #[must_use]
    pub fn with_predictor(
        config: ClientConfig,
        predictor: Box<dyn PredictionStrategy<S::ClientInput>>,
    ) -> Self {
        Self {
            config,
            predictor,
            stage: Mutex::new(Stage::Uninitialized),
            auth: Mutex::new(None),
            predict: Mutex::new(None),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// This session's configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Deserializes the server's snapshot into both timelines at `frame` and
    /// enters the predicting state.
    pub fn initialize(&self, frame: Frame, state: &[u8]) -> Result<(), NetcodeError> {
        {
            let mut stage = self.stage.lock();
            match *stage {
                Stage::Uninitialized => {}
                Stage::Predicting => {
                    return Err(NetcodeError::InvalidRequest {
                        info: "session is already initialized".to_owned(),
                    })
                }
                Stage::Terminated => return Err(NetcodeError::Terminated),
            }

            let auth_holder = StateHolder::from_snapshot(frame, state)?;
            let predict_holder = StateHolder::from_snapshot(frame, state)?;

            *self.auth.lock() = Some(AuthSide {
                holder: auth_holder,
                last_known: BTreeMap::new(),
            });
            *self.predict.lock() = Some(PredictSide {
                holder: predict_holder,
                local_inputs: IndexedQueue::new(frame.next()),
                predicted: IndexedQueue::new(frame.next()),
            });
            *stage = Stage::Predicting;
        }
        tracing::debug!(frame = frame.as_i64(), "client session initialized");
        self.push_event(ClientEvent::Initialized { frame });
        Ok(())
    }

    /// Advances the predictive timeline by one speculative frame.
    ///
    /// The batch is assembled from `local_input` for this player and the
    /// prediction strategy for every other known peer, then only the
    /// predictive holder is stepped. Refused with
    /// [`NetcodeError::PredictionThreshold`] once the speculative lead
    /// reaches the configured window.
    pub fn predict_tick(&self, local_input: S::ClientInput) -> Result<Frame, NetcodeError> {
        self.ensure_predicting()?;

        // Roster snapshot; released before the predictive lock so a predict
        // tick never blocks an in-flight reconciliation.
        let (last_known, auth_frame) = {
            let auth = self.auth.lock();
            let side = auth.as_ref().ok_or(NetcodeError::NotInitialized)?;
            (side.last_known.clone(), side.holder.frame())
        };

        let mut predict = self.predict.lock();
        let side = predict.as_mut().ok_or(NetcodeError::NotInitialized)?;

        let target = side.holder.frame().next();
        if target - auth_frame > i64::from(self.config.max_prediction_window) {
            return Err(NetcodeError::PredictionThreshold {
                frame: side.holder.frame(),
            });
        }

        let batch = self.assemble_batch(target, &last_known, Some(local_input));
        side.local_inputs.add(local_input);
        side.predicted.add(batch.clone());
        side.holder.update(&batch);

        drop(predict);
        self.push_event(ClientEvent::Predicted { frame: target });
        Ok(target)
    }

    /// Applies the confirmed batch for `frame` to the authoritative mirror
    /// and reconciles the predictive timeline against it.
    ///
    /// Authoritative frames must arrive in strictly increasing order (the
    /// reliable channel guarantees this); anything else is a protocol
    /// violation and the message is discarded.
    pub fn apply_authoritative(
        &self,
        frame: Frame,
        payload: &[u8],
        checksum: Option<u64>,
    ) -> Result<(), NetcodeError> {
        self.ensure_predicting()?;

        let batch: SimUpdateInput<S> =
            codec::decode_value(payload).map_err(|e| NetcodeError::Protocol {
                context: format!("malformed authoritative batch: {e}"),
            })?;

        let mut desync: Option<(u64, u64)> = None;
        {
            let mut auth = self.auth.lock();
            let side = auth.as_mut().ok_or(NetcodeError::NotInitialized)?;

            let expected = side.holder.frame().next();
            if frame != expected {
                return Err(NetcodeError::Protocol {
                    context: format!(
                        "authoritative frame {frame} out of order (expected {expected})"
                    ),
                });
            }

            side.holder.update(&batch);
            for entry in &batch.inputs {
                if entry.terminated {
                    side.last_known.remove(&entry.peer);
                } else {
                    side.last_known.insert(entry.peer, entry.input);
                }
            }
            self.push_event(ClientEvent::AuthoritativeAdvanced { frame });

            if let Some(remote) = checksum {
                let local = side.holder.checksum()?;
                if local != remote {
                    tracing::error!(
                        frame = frame.as_i64(),
                        local,
                        remote,
                        "state checksum mismatch, simulations have diverged"
                    );
                    self.push_event(ClientEvent::DesyncDetected {
                        frame,
                        local_checksum: local,
                        remote_checksum: remote,
                    });
                    desync = Some((local, remote));
                }
            }

            if desync.is_none() || self.config.desync_policy == DesyncPolicy::LogOnly {
                self.reconcile(side, frame, &batch)?;
            }
        }

        if let Some((local, remote)) = desync {
            match self.config.desync_policy {
                DesyncPolicy::LogOnly => {}
                DesyncPolicy::Disconnect => {
                    self.terminate(FinishReason::Corruption);
                    return Err(NetcodeError::MismatchedChecksum {
                        frame,
                        local,
                        remote,
                    });
                }
            }
        }
        Ok(())
    }

    /// Builds the unreliable packet of all not-yet-confirmed local inputs,
    /// oldest first, up to `max_len` bytes. Returns `Ok(None)` when there is
    /// nothing pending (or the session is not predicting).
    pub fn input_packet(&self, max_len: usize) -> Result<Option<Vec<u8>>, NetcodeError> {
        if *self.stage.lock() != Stage::Predicting {
            return Ok(None);
        }
        let predict = self.predict.lock();
        let Some(side) = predict.as_ref() else {
            return Ok(None);
        };

        let mut pending: Vec<(Frame, Vec<u8>)> = Vec::with_capacity(side.local_inputs.len());
        for (queued_frame, input) in side.local_inputs.iter() {
            pending.push((queued_frame, codec::encode(input)?));
        }
        drop(predict);

        let Some(packet) = InputPacket::pack(
            self.config.local_peer,
            pending.iter().map(|(f, p)| (*f, p.as_slice())),
            max_len,
        ) else {
            return Ok(None);
        };
        packet.encode().map(Some)
    }

    /// Stops accepting ticks and authoritative input, releases both
    /// timelines and emits [`ClientEvent::Finished`]. Idempotent.
    pub fn terminate(&self, reason: FinishReason) {
        {
            let mut stage = self.stage.lock();
            if *stage == Stage::Terminated {
                return;
            }
            *stage = Stage::Terminated;
        }
        *self.auth.lock() = None;
        *self.predict.lock() = None;
        tracing::debug!(%reason, "client session terminated");
        self.push_event(ClientEvent::Finished { reason });
    }

    /// The authoritative mirror's frame ([`Frame::PRE_SIM`] before
    /// initialization).
    #[must_use]
    pub fn auth_frame(&self) -> Frame {
        self.auth
            .lock()
            .as_ref()
            .map_or(Frame::PRE_SIM, |side| side.holder.frame())
    }

    /// The predictive timeline's frame ([`Frame::PRE_SIM`] before
    /// initialization).
    #[must_use]
    pub fn predict_frame(&self) -> Frame {
        self.predict
            .lock()
            .as_ref()
            .map_or(Frame::PRE_SIM, |side| side.holder.frame())
    }

    /// Runs `f` against the current predictive state, if one exists. This is
    /// what rendering reads from.
    pub fn with_predictive_state<R>(&self, f: impl FnOnce(&S) -> R) -> Option<R> {
        let predict = self.predict.lock();
        predict.as_ref().map(|side| f(side.holder.state()))
    }

    /// The checksum of the authoritative mirror's current state.
    pub fn auth_checksum(&self) -> Result<u64, NetcodeError> {
        let mut auth = self.auth.lock();
        let side = auth.as_mut().ok_or(NetcodeError::NotInitialized)?;
        side.holder.checksum()
    }

    /// Drains all pending events, oldest first.
    #[must_use]
    pub fn poll_events(&self) -> Vec<ClientEvent> {
        self.events.lock().drain(..).collect()
    }

    fn ensure_predicting(&self) -> Result<(), NetcodeError> {
        match *self.stage.lock() {
            Stage::Predicting => Ok(()),
            Stage::Uninitialized => Err(NetcodeError::NotInitialized),
            Stage::Terminated => Err(NetcodeError::Terminated),
        }
    }

    /// Brings the predictive timeline back in line with the freshly advanced
    /// authoritative mirror. Caller holds the authoritative lock.
    fn reconcile(
        &self,
        auth: &mut AuthSide<S>,
        frame: Frame,
        confirmed: &SimUpdateInput<S>,
    ) -> Result<(), NetcodeError> {
        let mut predict = self.predict.lock();
        let side = predict.as_mut().ok_or(NetcodeError::NotInitialized)?;

        if side.holder.frame() < frame {
            // The predictive timeline fell behind (e.g. a stalled clock);
            // fast-forward it to the authoritative snapshot so
            // auth_frame <= predict_frame keeps holding.
            let (_, snapshot) = auth.holder.snapshot()?;
            side.holder.reset_from_snapshot(frame, &snapshot)?;
            side.local_inputs.set(frame.next());
            side.predicted.set(frame.next());
            return Ok(());
        }

        let matched = side
            .predicted
            .try_get(frame)
            .is_some_and(|guessed| guessed == confirmed);
        if matched {
            // The common case: the guess was right, the speculative timeline
            // is already correct. Just retire the confirmed frame.
            side.predicted.pop(frame);
            side.local_inputs.pop(frame);
            return Ok(());
        }

        // Misprediction: discard the speculative timeline from `frame` and
        // replay it on top of the authoritative state.
        let replay_to = side.holder.frame();
        tracing::debug!(
            from = frame.as_i64(),
            to = replay_to.as_i64(),
            "misprediction, rolling back and replaying"
        );

        let (_, snapshot) = auth.holder.snapshot()?;
        side.holder.reset_from_snapshot(frame, &snapshot)?;
        side.local_inputs.pop(frame);
        side.predicted.set(frame.next());

        let mut replay_frame = frame.next();
        while replay_frame <= replay_to {
            let local_input = side.local_inputs.try_get(replay_frame).copied();
            let batch = self.assemble_batch(replay_frame, &auth.last_known, local_input);
            side.predicted.add(batch.clone());
            side.holder.update(&batch);
            replay_frame += 1;
        }

        debug_assert!(auth.holder.frame() <= side.holder.frame());
        self.push_event(ClientEvent::RolledBack {
            from: frame,
            to: replay_to,
        });
        Ok(())
    }

    /// Assembles the speculative batch for `frame`: the local input (when we
    /// have a real one) for this player, the prediction strategy for every
    /// other peer in the roster, the neutral server input.
    fn assemble_batch(
        &self,
        frame: Frame,
        last_known: &BTreeMap<PeerId, S::ClientInput>,
        local_input: Option<S::ClientInput>,
    ) -> SimUpdateInput<S> {
        let mut roster: BTreeSet<PeerId> = last_known.keys().copied().collect();
        roster.insert(self.config.local_peer);

        let mut inputs: InputVec<S::ClientInput> = InputVec::new();
        for peer in roster {
            let input = if peer == self.config.local_peer {
                local_input.unwrap_or_else(|| {
                    self.predictor.predict(frame, last_known.get(&peer).copied())
                })
            } else {
                self.predictor.predict(frame, last_known.get(&peer).copied())
            };
            inputs.push(InputEntry {
                peer,
                input,
                terminated: false,
            });
        }
        UpdateInput {
            server_input: S::ServerInput::default(),
            inputs,
        }
    }

    fn push_event(&self, event: ClientEvent) {
        self.events.lock().push_back(event);
    }
}

/// Drives a [`ClientSession`] with a [`SynchronizedClock`] and routes
/// reliable-channel messages to the right entry point.
///
/// The runtime owns the clock; [`ClientRuntime::terminate`] (and drop) stops
/// it, after which no further predict ticks fire.
pub struct ClientRuntime<S: Simulation> {
    session: Arc<ClientSession<S>>,
    clock: SynchronizedClock,
}

impl<S: Simulation> std::fmt::Debug for ClientRuntime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("session", &self.session)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<S: Simulation> ClientRuntime<S> {
    /// Wires a session to a fresh synchronized clock and the given local
    /// input source. The clock starts ticking when the `Initialize` message
    /// arrives.
    #[must_use]
    pub fn new(
        session: Arc<ClientSession<S>>,
        mut input_source: impl LocalInputSource<S::ClientInput> + 'static,
        pacing: PacingConfig,
        clock_config: ClockConfig,
    ) -> Self {
        let clock = SynchronizedClock::new(pacing, clock_config);

        let session_for_tick = session.clone();
        clock.subscribe(move |frame| {
            let input = input_source.sample(frame);
            match session_for_tick.predict_tick(input) {
                Ok(_) => {}
                Err(NetcodeError::PredictionThreshold { frame }) => {
                    tracing::trace!(
                        frame = frame.as_i64(),
                        "prediction window full, skipping tick"
                    );
                }
                Err(error) => {
                    tracing::warn!(%error, "predict tick failed");
                }
            }
        });

        Self { session, clock }
    }

    /// Decodes one reliable-channel message and dispatches it.
    ///
    /// A [`NetcodeError::Protocol`] return means the message was malformed
    /// and has been discarded; the connection should continue.
    pub fn handle_message(&mut self, bytes: &[u8]) -> Result<(), NetcodeError> {
        match ReliableMessage::decode(bytes)? {
            ReliableMessage::Initialize {
                client_id,
                frame,
                state,
            } => {
                if client_id != self.session.config.local_peer {
                    tracing::warn!(
                        assigned = client_id.as_i64(),
                        configured = self.session.config.local_peer.as_i64(),
                        "initialize addressed to a different connection id"
                    );
                }
                self.session.initialize(frame, &state)?;
                self.clock.initialize(frame);
                Ok(())
            }
            ReliableMessage::AuthoritativeInput {
                frame,
                checksum,
                payload,
            } => self.session.apply_authoritative(frame, &payload, checksum),
            ReliableMessage::SetDelay { frame, delay_ms } => {
                self.clock
                    .set_delay(frame, Duration::from_secs_f64(f64::from(delay_ms) / 1000.0));
                Ok(())
            }
        }
    }

    /// The driven session.
    #[must_use]
    pub fn session(&self) -> &Arc<ClientSession<S>> {
        &self.session
    }

    /// The pacing clock.
    #[must_use]
    pub fn clock(&self) -> &SynchronizedClock {
        &self.clock
    }

    /// Stops the clock (the in-flight tick completes first) and terminates
    /// the session.
    pub fn terminate(&mut self, reason: FinishReason) {
        self.clock.stop();
        self.session.terminate(reason);
    }
}

impl<S: Simulation> Drop for ClientRuntime<S> {
    fn drop(&mut self) {
        self.clock.stop();
    }
}

// #########
// # TESTS #
// #########

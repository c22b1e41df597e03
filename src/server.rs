//! The authoritative server session.
//!
//! One [`StateHolder`] and one [`InputAggregator`] behind a single mutex:
//! every tick and every inbound input event takes that lock for the minimal
//! critical section (construct batch, step, derive outputs) and never across
//! I/O. The outputs of a tick - the authoritative batch message, the optional
//! checksum and the per-client delay feedback - are returned to the caller to
//! dispatch, keeping the session ignorant of sockets.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::aggregator::InputAggregator;
use crate::clock::Clock;
use crate::error::NetcodeError;
use crate::messages::{InputPacket, ReliableMessage};
use crate::state_holder::StateHolder;
use crate::{codec, ChecksumMode, FinishReason, Frame, PeerId, ServerEvent, Simulation};

/// Configuration for a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerConfig {
    /// How often authoritative frames carry a state checksum.
    pub checksum_mode: ChecksumMode,
}

/// Everything one server tick produced, for the transport to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFrameOutput {
    /// The frame that was just stepped.
    pub frame: Frame,
    /// The encoded `AuthoritativeInput` message, to be sent reliably to
    /// every client.
    pub authoritative_message: Vec<u8>,
    /// The checksum attached to this frame, when one was computed.
    pub checksum: Option<u64>,
    /// Per-client encoded `SetDelay` feedback messages.
    pub delay_messages: Vec<(PeerId, Vec<u8>)>,
    /// `true` when the simulation requested a stop; this is the final frame.
    pub should_stop: bool,
}

struct ServerCore<S: Simulation> {
    holder: StateHolder<S>,
    aggregator: InputAggregator<S>,
    config: ServerConfig,
    stopped: bool,
}

/// The server's authoritative session: aggregates client inputs, steps the
/// single authoritative state, and derives the messages that feed every
/// client's mirror.
pub struct ServerSession<S: Simulation> {
    core: Mutex<ServerCore<S>>,
    events: Mutex<VecDeque<ServerEvent>>,
}

impl<S: Simulation> std::fmt::Debug for ServerSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("ServerSession")
            .field("frame", &core.holder.frame())
            .field("peers", &core.aggregator.peer_count())
            .field("stopped", &core.stopped)
            .finish()
    }
}

impl<S: Simulation> ServerSession<S> {
    /// Creates a session owning a freshly constructed state, positioned
    /// before frame 0.
    #[must_use]
    pub fn new(initial_state: S, config: ServerConfig) -> Self {
        Self {
            core: Mutex::new(ServerCore {
                holder: StateHolder::new(initial_state),
                aggregator: InputAggregator::new(),
                config,
                stopped: false,
            }),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// The tick rate the held simulation wants to run at.
    #[must_use]
    pub fn desired_tick_rate(&self) -> u32 {
        self.core.lock().holder.state().desired_tick_rate()
    }

    /// The most recently stepped frame.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.core.lock().holder.frame()
    }

    /// Number of currently registered peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.core.lock().aggregator.peer_count()
    }

    /// The checksum of the current authoritative state.
    pub fn checksum(&self) -> Result<u64, NetcodeError> {
        self.core.lock().holder.checksum()
    }

    /// Registers a new client and returns the encoded `Initialize` message
    /// (current snapshot) to send it on the reliable channel.
    ///
    /// The client participates in aggregation from the next constructed
    /// frame onward.
    pub fn add_client(&self, id: PeerId) -> Result<Vec<u8>, NetcodeError> {
        let message = {
            let mut core = self.core.lock();
            if core.stopped {
                return Err(NetcodeError::Terminated);
            }
            core.aggregator.add_peer(id)?;
            let (frame, state) = core.holder.snapshot()?;
            ReliableMessage::Initialize {
                client_id: id,
                frame,
                state,
            }
            .encode()?
        };
        tracing::info!(peer = id.as_i64(), "client joined");
        self.push_event(ServerEvent::PeerJoined { peer: id });
        Ok(message)
    }

    /// Removes a client (disconnect, kick, transport failure). Its
    /// termination entry surfaces in the next constructed batch; other
    /// peers' aggregation is untouched.
    pub fn remove_client(&self, id: PeerId, reason: FinishReason) -> Result<(), NetcodeError> {
        self.core.lock().aggregator.remove_peer(id)?;
        tracing::info!(peer = id.as_i64(), %reason, "client removed");
        self.push_event(ServerEvent::PeerRemoved { peer: id, reason });
        Ok(())
    }

    /// Decodes one unreliable input packet and feeds its records to the
    /// aggregator.
    ///
    /// Late, duplicate and orphaned records are soft conditions: logged and
    /// skipped, never fatal (the unreliable channel may drop, reorder or
    /// duplicate packets; idempotence lives here, not in the transport). A
    /// malformed packet is a [`NetcodeError::Protocol`] and is discarded
    /// whole.
    pub fn handle_input_packet(&self, bytes: &[u8]) -> Result<(), NetcodeError> {
        let packet = InputPacket::decode(bytes)?;
        let peer = packet.connection_id;

        let mut core = self.core.lock();
        for record in &packet.records {
            let input: S::ClientInput = match codec::decode_value(&record.payload) {
                Ok(input) => input,
                Err(error) => {
                    tracing::warn!(
                        peer = peer.as_i64(),
                        frame = record.frame.as_i64(),
                        %error,
                        "discarding undecodable input record"
                    );
                    continue;
                }
            };
            match core.aggregator.add_input(peer, record.frame, input) {
                Ok(()) => {}
                Err(
                    error @ (NetcodeError::LateInput { .. } | NetcodeError::DuplicateInput { .. }),
                ) => {
                    // Expected under packet loss and resends.
                    tracing::debug!(%error, "ignoring input record");
                }
                Err(error) => {
                    tracing::warn!(%error, "dropping input record");
                }
            }
        }
        Ok(())
    }

    /// Constructs the next canonical batch, steps the authoritative state,
    /// and derives everything the transport must dispatch.
    ///
    /// This is the sole frame-advancing operation on the server. Kicks
    /// requested by the simulation are applied here (surfacing in the *next*
    /// batch as termination entries), and a stop request makes this the
    /// final frame.
    pub fn advance_frame(&self, server_input: S::ServerInput) -> Result<ServerFrameOutput, NetcodeError> {
        let mut kicked: Vec<PeerId> = Vec::new();
        let output = {
            let mut core = self.core.lock();
            if core.stopped {
                return Err(NetcodeError::Terminated);
            }

            let aggregated = core.aggregator.construct_batch(server_input);
            let step = core.holder.update(&aggregated.input);
            let frame = core.holder.frame();
            debug_assert_eq!(frame, aggregated.frame);

            let checksum = match core.config.checksum_mode {
                ChecksumMode::Interval(interval) if interval > 0 => {
                    if frame.as_i64() % i64::from(interval) == 0 {
                        Some(core.holder.checksum()?)
                    } else {
                        None
                    }
                }
                _ => None,
            };

            let payload = codec::encode(&aggregated.input)?;
            let authoritative_message = ReliableMessage::AuthoritativeInput {
                frame,
                checksum,
                payload,
            }
            .encode()?;

            let mut delay_messages = Vec::with_capacity(aggregated.slack.len());
            for (peer, slack) in &aggregated.slack {
                let message = ReliableMessage::SetDelay {
                    frame,
                    delay_ms: (slack.as_secs_f64() * 1000.0) as f32,
                }
                .encode()?;
                delay_messages.push((*peer, message));
            }

            for peer in &step.terminated_peers {
                match core.aggregator.remove_peer(*peer) {
                    Ok(()) => kicked.push(*peer),
                    Err(error) => {
                        tracing::warn!(peer = peer.as_i64(), %error, "simulation kicked an unknown peer")
                    }
                }
            }
            if step.should_stop {
                core.stopped = true;
            }

            ServerFrameOutput {
                frame,
                authoritative_message,
                checksum,
                delay_messages,
                should_stop: step.should_stop,
            }
        };

        for peer in kicked {
            tracing::info!(peer = peer.as_i64(), "simulation kicked peer");
            self.push_event(ServerEvent::PeerRemoved {
                peer,
                reason: FinishReason::Kicked,
            });
        }
        if output.should_stop {
            tracing::info!(frame = output.frame.as_i64(), "simulation requested stop");
            self.push_event(ServerEvent::Stopped {
                frame: output.frame,
            });
        }
        Ok(output)
    }

    /// Subscribes this session to a clock: every tick pulls a server input
    /// from `input_source`, advances one frame and hands the result to
    /// `sink` for dispatch. After the simulation stops, further ticks are
    /// ignored.
    pub fn drive(
        self: &Arc<Self>,
        clock: &Clock,
        mut input_source: impl FnMut(Frame) -> S::ServerInput + Send + 'static,
        mut sink: impl FnMut(ServerFrameOutput) + Send + 'static,
    ) {
        let session = self.clone();
        clock.subscribe(move |frame| {
            let server_input = input_source(frame);
            match session.advance_frame(server_input) {
                Ok(output) => sink(output),
                Err(NetcodeError::Terminated) => {
                    tracing::trace!("tick after stop, ignoring");
                }
                Err(error) => {
                    tracing::error!(%error, "server frame failed");
                }
            }
        });
    }

    /// Drains all pending events, oldest first.
    #[must_use]
    pub fn poll_events(&self) -> Vec<ServerEvent> {
        self.events.lock().drain(..).collect()
    }

    fn push_event(&self, event: ServerEvent) {
        self.events.lock().push_back(event);
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::messages::InputRecord;
    use crate::{SimUpdateInput, SimulationError, UpdateInput, UpdateOutput};
    use serde::{Deserialize, Serialize};

    /// Kicks any peer whose input equals 66; stops when the server input is
    /// 99.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct RefereeSim {
        acc: u64,
    }

    const KICK: u8 = 66;
    const STOP: u64 = 99;

    impl Simulation for RefereeSim {
        type ClientInput = u8;
        type ServerInput = u64;

        fn desired_tick_rate(&self) -> u32 {
            30
        }

        fn update(
            &mut self,
            input: &UpdateInput<u64, u8>,
        ) -> Result<UpdateOutput, SimulationError> {
            self.acc = self.acc.wrapping_mul(31).wrapping_add(input.server_input);
            let mut output = UpdateOutput::default();
            for entry in &input.inputs {
                self.acc = self.acc.wrapping_add(u64::from(entry.input));
                if entry.input == KICK && !entry.terminated {
                    output.terminated_peers.push(entry.peer);
                }
            }
            output.should_stop = input.server_input == STOP;
            Ok(output)
        }
    }

    fn server() -> ServerSession<RefereeSim> {
        ServerSession::new(RefereeSim { acc: 1 }, ServerConfig::default())
    }

    fn input_packet(peer: PeerId, frames: &[(i64, u8)]) -> Vec<u8> {
        InputPacket {
            connection_id: peer,
            records: frames
                .iter()
                .map(|&(frame, input)| InputRecord {
                    frame: Frame::new(frame),
                    payload: codec::encode(&input).unwrap(),
                })
                .collect(),
        }
        .encode()
        .unwrap()
    }

    fn decode_batch(output: &ServerFrameOutput) -> SimUpdateInput<RefereeSim> {
        match ReliableMessage::decode(&output.authoritative_message).unwrap() {
            ReliableMessage::AuthoritativeInput { payload, .. } => {
                codec::decode_value(&payload).unwrap()
            }
            other => panic!("expected AuthoritativeInput, got {other:?}"),
        }
    }

    #[test]
    fn add_client_returns_a_snapshot_message() {
        let server = server();
        let bytes = server.add_client(PeerId::new(7)).unwrap();
        match ReliableMessage::decode(&bytes).unwrap() {
            ReliableMessage::Initialize {
                client_id,
                frame,
                state,
            } => {
                assert_eq!(client_id, PeerId::new(7));
                assert_eq!(frame, Frame::PRE_SIM);
                let decoded: RefereeSim = codec::decode_value(&state).unwrap();
                assert_eq!(decoded.acc, 1);
            }
            other => panic!("expected Initialize, got {other:?}"),
        }
        assert_eq!(
            server.poll_events(),
            vec![ServerEvent::PeerJoined {
                peer: PeerId::new(7)
            }]
        );
    }

    #[test]
    fn advance_frame_consumes_delivered_inputs() {
        let server = server();
        let peer = PeerId::new(3);
        server.add_client(peer).unwrap();
        server
            .handle_input_packet(&input_packet(peer, &[(0, 5)]))
            .unwrap();

        let output = server.advance_frame(1).unwrap();
        assert_eq!(output.frame, Frame::new(0));
        let batch = decode_batch(&output);
        assert_eq!(batch.inputs.len(), 1);
        assert_eq!(batch.inputs[0].input, 5);
        // A consumed real input earns delay feedback.
        assert_eq!(output.delay_messages.len(), 1);
        assert_eq!(output.delay_messages[0].0, peer);
    }

    #[test]
    fn missed_input_substitutes_default_without_feedback() {
        let server = server();
        server.add_client(PeerId::new(3)).unwrap();
        let output = server.advance_frame(1).unwrap();
        let batch = decode_batch(&output);
        assert_eq!(batch.inputs[0].input, 0);
        assert!(output.delay_messages.is_empty());
    }

    #[test]
    fn checksum_interval_is_honored() {
        let server = ServerSession::new(
            RefereeSim { acc: 1 },
            ServerConfig {
                checksum_mode: ChecksumMode::Interval(3),
            },
        );
        let mut with_checksum = Vec::new();
        for _ in 0..7 {
            let output = server.advance_frame(1).unwrap();
            if output.checksum.is_some() {
                with_checksum.push(output.frame.as_i64());
            }
        }
        assert_eq!(with_checksum, vec![0, 3, 6]);
    }

    #[test]
    fn checksum_off_never_attaches() {
        let server = ServerSession::new(
            RefereeSim { acc: 1 },
            ServerConfig {
                checksum_mode: ChecksumMode::Off,
            },
        );
        for _ in 0..5 {
            assert!(server.advance_frame(1).unwrap().checksum.is_none());
        }
    }

    #[test]
    fn simulation_kick_surfaces_as_termination_entry_next_frame() {
        let server = server();
        let peer = PeerId::new(3);
        server.add_client(peer).unwrap();
        server.poll_events();

        server
            .handle_input_packet(&input_packet(peer, &[(0, KICK)]))
            .unwrap();
        let output = server.advance_frame(1).unwrap();
        let batch = decode_batch(&output);
        assert!(!batch.inputs[0].terminated);
        assert_eq!(
            server.poll_events(),
            vec![ServerEvent::PeerRemoved {
                peer,
                reason: FinishReason::Kicked
            }]
        );

        // The next frame carries the termination entry, then the peer is gone.
        let output = server.advance_frame(1).unwrap();
        let batch = decode_batch(&output);
        assert_eq!(batch.inputs.len(), 1);
        assert!(batch.inputs[0].terminated);
        let output = server.advance_frame(1).unwrap();
        assert!(decode_batch(&output).inputs.is_empty());
    }

    #[test]
    fn stop_request_makes_the_frame_final() {
        let server = server();
        let output = server.advance_frame(STOP).unwrap();
        assert!(output.should_stop);
        assert_eq!(
            server.poll_events(),
            vec![ServerEvent::Stopped {
                frame: Frame::new(0)
            }]
        );
        assert_eq!(server.advance_frame(1), Err(NetcodeError::Terminated));
        assert!(server.add_client(PeerId::new(1)).is_err());
    }

    #[test]
    fn malformed_packet_is_rejected_whole() {
        let server = server();
        assert!(matches!(
            server.handle_input_packet(&[0xFF, 1, 2, 3]),
            Err(NetcodeError::Protocol { .. })
        ));
    }

    #[test]
    fn late_and_duplicate_records_do_not_fail_the_packet() {
        let server = server();
        let peer = PeerId::new(3);
        server.add_client(peer).unwrap();
        server.advance_frame(1).unwrap(); // closes frame 0

        // Late (frame 0), duplicate (frame 1 twice) and fresh records in one
        // packet: only the fresh ones land, the call succeeds.
        server
            .handle_input_packet(&input_packet(peer, &[(0, 9), (1, 7), (1, 8), (2, 6)]))
            .unwrap();
        let output = server.advance_frame(1).unwrap();
        assert_eq!(decode_batch(&output).inputs[0].input, 7);
        let output = server.advance_frame(1).unwrap();
        assert_eq!(decode_batch(&output).inputs[0].input, 6);
    }

    #[test]
    fn input_from_removed_peer_is_dropped_silently() {
        let server = server();
        let peer = PeerId::new(3);
        server.add_client(peer).unwrap();
        server.remove_client(peer, FinishReason::Disconnect).unwrap();
        // Still a valid packet; the orphaned record is just dropped.
        server
            .handle_input_packet(&input_packet(peer, &[(0, 5)]))
            .unwrap();

        let output = server.advance_frame(1).unwrap();
        let batch = decode_batch(&output);
        assert_eq!(batch.inputs.len(), 1);
        assert!(batch.inputs[0].terminated);
    }

    #[test]
    fn removing_one_client_does_not_disturb_another() {
        let server = server();
        server.add_client(PeerId::new(1)).unwrap();
        server.add_client(PeerId::new(2)).unwrap();
        server
            .remove_client(PeerId::new(1), FinishReason::NetworkError)
            .unwrap();
        server
            .handle_input_packet(&input_packet(PeerId::new(2), &[(0, 4)]))
            .unwrap();

        let output = server.advance_frame(1).unwrap();
        let batch = decode_batch(&output);
        assert_eq!(batch.inputs.len(), 2);
        assert_eq!(batch.inputs[0].peer, PeerId::new(2));
        assert_eq!(batch.inputs[0].input, 4);
        assert!(batch.inputs[1].terminated);
    }
}

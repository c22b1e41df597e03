//! End-to-end client/server loopback, driven synchronously (no threads, no
//! sockets): messages produced by one side are handed straight to the other.
//! Checksums are compared every frame, so any divergence between the server's
//! state and either client's mirror fails the run immediately.

mod common;

use bastion_netcode::messages::ReliableMessage;
use bastion_netcode::{
    ChecksumMode, ClientConfig, ClientEvent, ClientSession, FinishReason, Frame, PeerId,
    ServerConfig, ServerFrameOutput, ServerSession,
};
use common::{StubInput, StubServerInput, StubSim};

const A: PeerId = PeerId::new(1);
const B: PeerId = PeerId::new(2);

fn new_server() -> ServerSession<StubSim> {
    ServerSession::new(
        StubSim::new(),
        ServerConfig {
            checksum_mode: ChecksumMode::Interval(1),
        },
    )
}

fn new_client(server: &ServerSession<StubSim>, id: PeerId) -> ClientSession<StubSim> {
    let init = server.add_client(id).expect("add_client");
    let client = ClientSession::new(ClientConfig::new(id));
    match ReliableMessage::decode(&init).expect("decode init") {
        ReliableMessage::Initialize {
            client_id,
            frame,
            state,
        } => {
            assert_eq!(client_id, id);
            client.initialize(frame, &state).expect("initialize");
        }
        other => panic!("expected Initialize, got {other:?}"),
    }
    client
}

fn apply_output(client: &ClientSession<StubSim>, output: &ServerFrameOutput) {
    match ReliableMessage::decode(&output.authoritative_message).expect("decode auth") {
        ReliableMessage::AuthoritativeInput {
            frame,
            checksum,
            payload,
        } => {
            client
                .apply_authoritative(frame, &payload, checksum)
                .expect("apply_authoritative");
        }
        other => panic!("expected AuthoritativeInput, got {other:?}"),
    }
}

fn deliver_inputs(server: &ServerSession<StubSim>, client: &ClientSession<StubSim>) {
    if let Some(packet) = client.input_packet(2048).expect("input_packet") {
        server.handle_input_packet(&packet).expect("handle packet");
    }
}

fn rollback_count(events: &[ClientEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ClientEvent::RolledBack { .. }))
        .count()
}

/// Two clients in lockstep with the server. Prediction is wrong exactly when
/// it has to be: once per client at frame 0 (roster discovery) and once for
/// client A when client B changes its input mid-run. Every frame's checksum
/// must match on both mirrors.
#[test]
fn lockstep_run_stays_in_sync_with_minimal_rollbacks() {
    let server = new_server();
    let client_a = new_client(&server, A);
    let client_b = new_client(&server, B);

    let mut rollbacks_a = 0;
    let mut rollbacks_b = 0;

    for t in 0..30i64 {
        // B changes its held input at t = 15; everything else is constant.
        let input_a = StubInput::new(5);
        let input_b = StubInput::new(if t < 15 { 7 } else { 9 });

        client_a.predict_tick(input_a).expect("tick a");
        client_b.predict_tick(input_b).expect("tick b");
        assert!(client_a.auth_frame() <= client_a.predict_frame());

        deliver_inputs(&server, &client_a);
        deliver_inputs(&server, &client_b);

        // The server input must be the neutral default: clients speculate
        // with the default, so anything else would roll back every frame.
        let output = server.advance_frame(StubServerInput::default()).expect("advance");
        assert_eq!(output.frame, Frame::new(t));
        assert_eq!(output.delay_messages.len(), 2);

        apply_output(&client_a, &output);
        apply_output(&client_b, &output);

        assert_eq!(client_a.auth_frame(), Frame::new(t));
        assert_eq!(client_b.auth_frame(), Frame::new(t));
        assert!(client_a.auth_frame() <= client_a.predict_frame());
        assert!(client_b.auth_frame() <= client_b.predict_frame());

        rollbacks_a += rollback_count(&client_a.poll_events());
        rollbacks_b += rollback_count(&client_b.poll_events());
    }

    // Frame 0 discovers the roster (both clients), t=15 surprises only A.
    assert_eq!(rollbacks_a, 2);
    assert_eq!(rollbacks_b, 1);

    // Both mirrors ended byte-identical to the server.
    let server_checksum = server.checksum().expect("server checksum");
    assert_eq!(client_a.auth_checksum().expect("a checksum"), server_checksum);
    assert_eq!(client_b.auth_checksum().expect("b checksum"), server_checksum);
}

/// A client disconnecting surfaces exactly once as a termination entry, the
/// survivor's roster shrinks, and the session stays in sync throughout.
#[test]
fn disconnect_mid_run_keeps_the_survivor_in_sync() {
    let server = new_server();
    let client_a = new_client(&server, A);
    let client_b = new_client(&server, B);

    let run_frame = |t: i64, with_b: bool| {
        client_a.predict_tick(StubInput::new(5)).expect("tick a");
        deliver_inputs(&server, &client_a);
        if with_b {
            client_b.predict_tick(StubInput::new(7)).expect("tick b");
            deliver_inputs(&server, &client_b);
        }
        let output = server.advance_frame(StubServerInput::default()).expect("advance");
        assert_eq!(output.frame, Frame::new(t));
        apply_output(&client_a, &output);
        if with_b {
            apply_output(&client_b, &output);
        }
        output
    };

    for t in 0..5 {
        run_frame(t, true);
    }
    client_a.poll_events();

    // B drops. Its termination entry rides the next frame.
    server.remove_client(B, FinishReason::Disconnect).expect("remove");
    client_b.terminate(FinishReason::Disconnect);
    assert_eq!(
        client_b.predict_tick(StubInput::new(0)),
        Err(bastion_netcode::NetcodeError::Terminated)
    );

    // The termination frame mispredicts once (A still guessed B present);
    // afterwards A predicts a one-peer roster and stays clean.
    run_frame(5, false);
    assert_eq!(rollback_count(&client_a.poll_events()), 1);
    for t in 6..12 {
        run_frame(t, false);
        assert_eq!(rollback_count(&client_a.poll_events()), 0);
    }

    assert_eq!(
        client_a.auth_checksum().expect("a checksum"),
        server.checksum().expect("server checksum")
    );
}

/// The simulation's stop request ends the session after one final,
/// consistent frame.
#[test]
fn simulation_stop_ends_the_run_cleanly() {
    let server = new_server();
    let client_a = new_client(&server, A);

    for t in 0..3 {
        client_a.predict_tick(StubInput::new(1)).expect("tick");
        deliver_inputs(&server, &client_a);
        let output = server.advance_frame(StubServerInput::default()).expect("advance");
        assert_eq!(output.frame, Frame::new(t));
        apply_output(&client_a, &output);
    }

    client_a.predict_tick(StubInput::new(1)).expect("tick");
    deliver_inputs(&server, &client_a);
    let output = server
        .advance_frame(StubServerInput {
            seed: 0,
            stop: true,
        })
        .expect("advance");
    assert!(output.should_stop);

    // The final frame still reconciles; the stop flag rode the server input,
    // which the client did not predict, so this frame rolls back - and still
    // converges to the server's state.
    apply_output(&client_a, &output);
    assert_eq!(
        client_a.auth_checksum().expect("checksum"),
        server.checksum().expect("server checksum")
    );

    assert_eq!(
        server.advance_frame(StubServerInput::default()),
        Err(bastion_netcode::NetcodeError::Terminated)
    );
}

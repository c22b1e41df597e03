//! Threaded smoke tests: clock-driven server and client runtimes, exercised
//! end to end with real timing threads. Assertions stay loose on counts
//! (schedulers vary) and strict on state-machine behavior.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serial_test::serial;

use bastion_netcode::messages::ReliableMessage;
use bastion_netcode::{
    ClientConfig, ClientRuntime, ClientSession, Clock, ClockConfig, FinishReason, Frame,
    PacingConfig, PeerId, ServerConfig, ServerSession,
};
use common::{StubInput, StubServerInput, StubSim};

#[test]
#[serial]
fn clock_driven_server_produces_frames() {
    let server = Arc::new(ServerSession::new(StubSim::new(), ServerConfig::default()));
    let mut clock = Clock::new(100, ClockConfig::default());
    let outputs = Arc::new(Mutex::new(Vec::new()));

    let outputs_in_sink = outputs.clone();
    server.drive(
        &clock,
        |_frame| StubServerInput::default(),
        move |output| outputs_in_sink.lock().push(output),
    );

    clock.start(Frame::PRE_SIM);
    thread::sleep(Duration::from_millis(100));
    clock.stop();

    let outputs = outputs.lock();
    assert!(!outputs.is_empty(), "no frames were produced");
    for (i, output) in outputs.iter().enumerate() {
        assert_eq!(output.frame, Frame::new(i as i64));
    }
    assert_eq!(server.frame(), outputs.last().unwrap().frame);
}

#[test]
#[serial]
fn client_runtime_predicts_up_to_the_window_and_terminates_cleanly() {
    let server = ServerSession::new(StubSim::new(), ServerConfig::default());
    let init = server.add_client(PeerId::new(1)).unwrap();

    let session = Arc::new(ClientSession::<StubSim>::new(ClientConfig::new(
        PeerId::new(1),
    )));
    let sampled = Arc::new(AtomicUsize::new(0));
    let sampled_in_source = sampled.clone();
    let mut runtime = ClientRuntime::new(
        session.clone(),
        move |_frame: Frame| {
            sampled_in_source.fetch_add(1, Ordering::SeqCst);
            StubInput::new(3)
        },
        PacingConfig {
            target_tps: 200,
            ..PacingConfig::default()
        },
        ClockConfig::default(),
    );

    // Nothing ticks before the snapshot arrives.
    thread::sleep(Duration::from_millis(30));
    assert_eq!(session.predict_frame(), Frame::PRE_SIM);

    runtime.handle_message(&init).unwrap();
    thread::sleep(Duration::from_millis(120));

    // With no authoritative input the speculative lead is capped at the
    // prediction window; ticks beyond it are skipped, not fatal.
    let predicted = session.predict_frame();
    assert!(predicted.is_stepped(), "clock never ticked");
    assert!(predicted - Frame::PRE_SIM <= 8 + 1);
    assert!(sampled.load(Ordering::SeqCst) >= 1);

    runtime.terminate(FinishReason::Disconnect);
    let frame_after_terminate = session.predict_frame();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(session.predict_frame(), frame_after_terminate);
    assert_eq!(frame_after_terminate, Frame::PRE_SIM); // state was released
}

#[test]
#[serial]
fn set_delay_message_reaches_the_clock() {
    let server = ServerSession::new(StubSim::new(), ServerConfig::default());
    let init = server.add_client(PeerId::new(1)).unwrap();

    let session = Arc::new(ClientSession::<StubSim>::new(ClientConfig::new(
        PeerId::new(1),
    )));
    let mut runtime = ClientRuntime::new(
        session,
        |_frame: Frame| StubInput::new(0),
        PacingConfig {
            target_tps: 100,
            target_delta: std::time::Duration::from_millis(10),
            window_size: 8,
        },
        ClockConfig::default(),
    );

    runtime.handle_message(&init).unwrap();
    // Wait for at least one real tick before sampling the newest frame.
    for _ in 0..200 {
        if runtime.clock().frame().is_stepped() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    runtime.terminate(FinishReason::Disconnect);
    assert!(runtime.clock().frame().is_stepped(), "clock never ticked");

    // Feed a SetDelay for the newest tick; the clock's period must move.
    let newest = runtime.clock().frame();
    let message = ReliableMessage::SetDelay {
        frame: newest,
        delay_ms: 60.0,
    }
    .encode()
    .unwrap();
    runtime.handle_message(&message).unwrap();
    let period = runtime.clock().current_period().as_secs_f64();
    assert!((period - 0.060).abs() < 1e-6, "period was {period}");
}

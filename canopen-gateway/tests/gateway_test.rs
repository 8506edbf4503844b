mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canopen_common::{encode_raw, encode_sdo_response, ErrorMessage, Frame, PdoData, PdoMessage, SdoKind};
use canopen_gateway::{ConnectionState, Gateway, GatewayError};
use common::{connected, eventually, init_logging, test_config, ScriptedBridge};

const WAIT: Duration = Duration::from_secs(1);

fn ack(node: u8, index: u16, subindex: u8) -> Frame {
    encode_sdo_response(0x580 + node as u16, 0x60, index, subindex, [0; 4])
}

#[tokio::test]
async fn write_sdo_sends_expedited_request_and_completes_on_ack() {
    let (gateway, bridge, host) = connected(test_config()).await;

    let bridge_side = async {
        let (request, _) = bridge.recv_request(WAIT).await.expect("no SDO write");
        assert_eq!(
            request.as_bytes(),
            &[0x02, 0x06, 0, 0, 8, 0, 0, 0, 0x2F, 0x00, 0x20, 0x01, 0x2A, 0, 0, 0]
        );
        bridge.send_frame(&ack(0x02, 0x2000, 0x01), host).await;
    };
    let (result, ()) = tokio::join!(
        gateway.write_sdo(0x02, 0x2000, 0x01, &[0x2A], Duration::from_millis(1000)),
        bridge_side
    );

    result.unwrap();
    gateway.disconnect().await.unwrap();
}

#[tokio::test]
async fn read_sdo_without_response_times_out() {
    let (gateway, bridge, _host) = connected(test_config()).await;

    let started = Instant::now();
    let result = gateway.read_sdo(0x02, 0x2000, 0x01, Duration::from_millis(500)).await;
    let elapsed = started.elapsed();

    match result {
        Err(GatewayError::Timeout { kind, index, subindex, .. }) => {
            assert_eq!((kind, index, subindex), (SdoKind::Read, 0x2000, 0x01));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(500), "timed out after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(800), "timed out after {:?}", elapsed);

    let (request, _) = bridge.recv_request(WAIT).await.unwrap();
    assert_eq!(request.command(), 0x40);
}

#[tokio::test]
async fn read_sdo_returns_command_derived_length() {
    let (gateway, bridge, host) = connected(test_config()).await;

    let bridge_side = async {
        bridge.recv_request(WAIT).await.expect("no SDO read");
        // an unrelated object first, then the answer (2 valid bytes)
        let other = encode_sdo_response(0x582, 0x4B, 0x1017, 0x00, [0xE8, 0x03, 0, 0]);
        bridge.send_frame(&other, host).await;
        let answer = encode_sdo_response(0x582, 0x4B, 0x2000, 0x01, [0x34, 0x12, 0xFF, 0xFF]);
        bridge.send_frame(&answer, host).await;
    };
    let (result, ()) = tokio::join!(gateway.read_sdo(0x02, 0x2000, 0x01, WAIT), bridge_side);

    let read = result.unwrap();
    assert_eq!(read.valid_len, 2);
    assert_eq!(read.data(), &[0x34, 0x12]);
}

#[tokio::test]
async fn abort_frame_fails_the_waiting_request() {
    let (gateway, bridge, host) = connected(test_config()).await;

    let bridge_side = async {
        bridge.recv_request(WAIT).await.expect("no SDO read");
        let abort = encode_sdo_response(0x582, 0x80, 0x6000, 0x00, 0x0602_0000u32.to_le_bytes());
        bridge.send_frame(&abort, host).await;
    };
    let started = Instant::now();
    let (result, ()) = tokio::join!(gateway.read_sdo(0x02, 0x6000, 0x00, Duration::from_secs(5)), bridge_side);

    match result {
        Err(GatewayError::SdoAbort { code, description, .. }) => {
            assert_eq!(code, 0x0602_0000);
            assert!(description.contains("does not exist"));
        }
        other => panic!("expected abort, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn pdo_frames_reach_only_the_pdo_sink() {
    let (gateway, bridge, host) = connected(test_config()).await;

    let pdos: Arc<Mutex<Vec<PdoMessage>>> = Arc::default();
    let errors = Arc::new(AtomicUsize::new(0));
    let sink = pdos.clone();
    gateway.register_pdo_sink(move |pdo: &PdoMessage| sink.lock().unwrap().push(*pdo));
    let counter = errors.clone();
    gateway.register_error_sink(move |_: &ErrorMessage| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // short datagrams are not frames
    bridge.send_raw(&[0x00, 0x02, 0, 0, 3], host).await;
    let frame = encode_raw(0x200, &PdoData::new(&[0xAA, 0xBB, 0xCC]).unwrap());
    bridge.send_frame(&frame, host).await;

    assert!(eventually(WAIT, || !pdos.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = pdos.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].cob_id, 0x200);
    assert_eq!(received[0].length, 3);
    assert_eq!(received[0].payload, [0xAA, 0xBB, 0xCC, 0, 0, 0, 0, 0]);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn error_range_frames_reach_the_error_sink() {
    let (gateway, bridge, host) = connected(test_config()).await;

    let errors: Arc<Mutex<Vec<ErrorMessage>>> = Arc::default();
    let sink = errors.clone();
    gateway.register_error_sink(move |err: &ErrorMessage| sink.lock().unwrap().push(*err));

    let emcy = encode_raw(0x85, &PdoData::new(&[0x10, 0x42, 0x08, 0, 0, 0, 0, 0]).unwrap());
    bridge.send_frame(&emcy, host).await;

    assert!(eventually(WAIT, || errors.lock().unwrap().len() == 1).await);
    let err = errors.lock().unwrap()[0];
    assert_eq!(err.cob_id, 0x85);
    assert_eq!(&err.payload[..3], &[0x10, 0x42, 0x08]);
}

#[tokio::test]
async fn emergency_with_abort_like_code_reaches_the_error_sink() {
    let (gateway, bridge, host) = connected(test_config()).await;
    let gateway = Arc::new(gateway);

    let errors: Arc<Mutex<Vec<ErrorMessage>>> = Arc::default();
    let sink = errors.clone();
    gateway.register_error_sink(move |err: &ErrorMessage| sink.lock().unwrap().push(*err));

    // error code 0xFF80 puts 0x80 where an SDO command would sit
    let emcy = encode_raw(0x82, &PdoData::new(&[0x80, 0xFF, 0x01, 0, 0, 0, 0, 0]).unwrap());
    bridge.send_frame(&emcy, host).await;
    assert!(eventually(WAIT, || errors.lock().unwrap().len() == 1).await);

    // with a read pending it is still an error frame, not an abort of that read
    let reader = gateway.clone();
    let read = tokio::spawn(async move { reader.read_sdo(0x02, 0x2000, 0x01, WAIT).await });
    let (request, _) = bridge.recv_request(WAIT).await.unwrap();
    assert_eq!(request.command(), 0x40);

    bridge.send_frame(&emcy, host).await;
    assert!(eventually(WAIT, || errors.lock().unwrap().len() == 2).await);
    bridge
        .send_frame(&encode_sdo_response(0x582, 0x4F, 0x2000, 0x01, [0x2A, 0, 0, 0]), host)
        .await;

    let value = read.await.unwrap().unwrap();
    assert_eq!(value.data(), &[0x2A]);
    assert_eq!(errors.lock().unwrap()[1].cob_id, 0x82);
}

#[tokio::test]
async fn raw_subscribers_see_every_frame() {
    let (gateway, bridge, host) = connected(test_config()).await;
    let mut frames = gateway.subscribe_frames();

    let unrecognized = encode_raw(0x123, &PdoData::new(&[1]).unwrap());
    bridge.send_frame(&unrecognized, host).await;

    let got = tokio::time::timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(got, unrecognized);
}

#[tokio::test]
async fn disconnect_twice_reports_not_connected() {
    let (gateway, _bridge, _host) = connected(test_config()).await;
    assert_eq!(gateway.state(), ConnectionState::Connected);

    gateway.disconnect().await.unwrap();
    assert_eq!(gateway.state(), ConnectionState::Disconnected);
    assert!(matches!(gateway.disconnect().await, Err(GatewayError::NotConnected)));

    assert!(matches!(
        gateway.write_sdo(0x02, 0x2000, 0x01, &[1], WAIT).await,
        Err(GatewayError::NotConnected)
    ));
    assert!(matches!(gateway.read_sdo(0x02, 0x2000, 0x01, WAIT).await, Err(GatewayError::NotConnected)));
    assert!(matches!(gateway.write_pdo(0x02, 0x200, &[1]).await, Err(GatewayError::NotConnected)));
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let (gateway, bridge, host) = connected(test_config()).await;
    assert_eq!(gateway.local_addr().await, Some(host));
    let result = gateway.connect("127.0.0.1", bridge.port()).await;
    assert!(matches!(result, Err(GatewayError::AlreadyConnected)));
    assert!(gateway.is_connected());

    gateway.disconnect().await.unwrap();
    assert_eq!(gateway.local_addr().await, None);
}

#[tokio::test]
async fn silent_bridge_fails_handshake() {
    init_logging();
    let bridge = ScriptedBridge::bind().await;
    let mut config = test_config();
    config.handshake_timeout_ms = 100;
    let gateway = Gateway::new(config);

    let started = Instant::now();
    let result = gateway.connect("127.0.0.1", bridge.port()).await;
    assert!(matches!(result, Err(GatewayError::HandshakeFailed { .. })), "{:?}", result);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(gateway.state(), ConnectionState::Disconnected);

    // the probe was still sent
    let (probe, _) = bridge.recv_frame(WAIT).await.unwrap();
    assert_eq!(probe, Frame::zeroed());
}

#[tokio::test]
async fn invalid_arguments_are_rejected_before_sending() {
    init_logging();
    let gateway = Gateway::new(test_config());
    assert!(matches!(
        gateway.write_sdo(0x02, 0x2000, 0x01, &[1, 2, 3, 4, 5], WAIT).await,
        Err(GatewayError::InvalidArgument(_))
    ));
    assert!(matches!(
        gateway.write_pdo(0x02, 0x200, &[0; 9]).await,
        Err(GatewayError::InvalidArgument(_))
    ));
    assert!(matches!(
        gateway.connect("localhost", 9999).await,
        Err(GatewayError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn write_pdo_builds_cob_id_from_pdo_number() {
    let (gateway, bridge, _host) = connected(test_config()).await;
    gateway.write_pdo(0x05, 0x200, &[1, 2, 3]).await.unwrap();

    let (frame, _) = bridge.recv_request(WAIT).await.unwrap();
    assert_eq!(frame.cob_id(), 0x205);
    assert_eq!(frame.dlc(), 3);
    assert_eq!(&frame.as_bytes()[8..11], &[1, 2, 3]);
}

#[tokio::test]
async fn heartbeat_is_emitted_while_enabled() {
    let (gateway, bridge, _host) = connected(test_config()).await;
    assert!(!gateway.heartbeat_settings().enabled);
    gateway.start_heartbeat(Duration::from_millis(50));
    let settings = gateway.heartbeat_settings();
    assert!(settings.enabled);
    assert_eq!((settings.node_id, settings.state), (0x78, 0x05));
    assert_eq!(settings.period, Duration::from_millis(50));

    let mut beats = Vec::new();
    let started = Instant::now();
    while beats.len() < 3 && started.elapsed() < Duration::from_secs(2) {
        if let Some((frame, _)) = bridge.recv_frame(Duration::from_millis(200)).await {
            beats.push((frame, Instant::now()));
        }
    }
    assert_eq!(beats.len(), 3);
    for (frame, _) in &beats {
        assert_eq!(
            frame.as_bytes(),
            &[0x78, 0x07, 0, 0, 1, 0, 0, 0, 0x05, 0, 0, 0, 0, 0, 0, 0]
        );
    }
    let gap = beats[2].1 - beats[1].1;
    assert!(gap >= Duration::from_millis(30), "beats {:?} apart", gap);

    gateway.stop_heartbeat();
    assert!(!gateway.heartbeat_settings().enabled);
    // drain anything emitted before the stop took effect
    while bridge.recv_frame(Duration::from_millis(100)).await.is_some() {}
    assert!(bridge.recv_frame(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn disconnect_releases_waiting_callers() {
    let (gateway, _bridge, _host) = connected(test_config()).await;
    let gateway = Arc::new(gateway);

    let reader = gateway.clone();
    let pending = tokio::spawn(async move { reader.read_sdo(0x02, 0x2000, 0x01, Duration::from_secs(10)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    gateway.disconnect().await.unwrap();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(GatewayError::ConnectionLost)), "{:?}", result);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn same_kind_requests_are_serialized() {
    let (gateway, bridge, host) = connected(test_config()).await;
    let gateway = Arc::new(gateway);

    let first = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.write_sdo(0x02, 0x2000, 0x01, &[1], WAIT * 3).await })
    };
    let (request, _) = bridge.recv_request(WAIT).await.unwrap();
    assert_eq!(request.index(), 0x2000);

    let second = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.write_sdo(0x02, 0x2001, 0x01, &[2], WAIT * 3).await })
    };
    // a concurrent read is not held back by the pending write
    let read = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.read_sdo(0x02, 0x3000, 0x00, Duration::from_millis(100)).await })
    };
    let (read_request, _) = bridge.recv_request(WAIT).await.unwrap();
    assert_eq!(read_request.command(), 0x40);
    assert!(bridge.recv_request(Duration::from_millis(100)).await.is_none());

    bridge.send_frame(&ack(0x02, 0x2000, 0x01), host).await;
    first.await.unwrap().unwrap();

    let (request, _) = bridge.recv_request(WAIT).await.unwrap();
    assert_eq!(request.index(), 0x2001);
    bridge.send_frame(&ack(0x02, 0x2001, 0x01), host).await;
    second.await.unwrap().unwrap();

    assert!(matches!(read.await.unwrap(), Err(GatewayError::Timeout { .. })));
}

#[tokio::test]
async fn lost_bridge_disconnects_the_gateway() {
    let (gateway, bridge, _host) = connected(test_config()).await;
    let mut state = gateway.watch_state();
    drop(bridge);

    // outgoing traffic to the closed port makes the socket report an error
    gateway.start_heartbeat(Duration::from_millis(10));
    let lost = tokio::time::timeout(Duration::from_secs(3), state.wait_for(|s| !s.is_connected())).await;
    assert!(matches!(lost, Ok(Ok(_))), "gateway still connected");
    drop(lost);
    gateway.stop_heartbeat();

    assert!(matches!(gateway.read_sdo(0x02, 0x2000, 0x01, WAIT).await, Err(GatewayError::NotConnected)));
    assert!(matches!(gateway.disconnect().await, Err(GatewayError::NotConnected)));

    // a new session can be opened afterwards
    let bridge = ScriptedBridge::bind().await;
    let (result, _) = tokio::join!(gateway.connect("127.0.0.1", bridge.port()), bridge.accept_handshake());
    result.unwrap();
    assert!(gateway.is_connected());
}

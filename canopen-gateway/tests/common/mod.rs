#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use canopen_common::{Frame, FRAME_LEN};
use canopen_gateway::{Gateway, GatewayConfig};
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        local_bind: "127.0.0.1:0".to_string(),
        handshake_timeout_ms: 500,
        poll_interval_ms: 10,
        ..GatewayConfig::default()
    }
}

/// A bridge whose every reply is driven by the test.
pub struct ScriptedBridge {
    socket: UdpSocket,
}

impl ScriptedBridge {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self { socket }
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    /// Next datagram as a frame, or `None` if nothing arrives within `wait`.
    pub async fn recv_frame(&self, wait: Duration) -> Option<(Frame, SocketAddr)> {
        let mut buf = [0u8; 64];
        let (n, from) = timeout(wait, self.socket.recv_from(&mut buf)).await.ok()?.unwrap();
        assert_eq!(n, FRAME_LEN, "gateway sent a {}-byte datagram", n);
        Some((Frame::from_bytes(&buf[..n]).unwrap(), from))
    }

    pub async fn send_frame(&self, frame: &Frame, to: SocketAddr) {
        self.socket.send_to(frame.as_bytes(), to).await.unwrap();
    }

    pub async fn send_raw(&self, bytes: &[u8], to: SocketAddr) {
        self.socket.send_to(bytes, to).await.unwrap();
    }

    /// Wait for the zero probe and answer it.
    pub async fn accept_handshake(&self) -> SocketAddr {
        let (probe, host) = self.recv_frame(Duration::from_secs(2)).await.expect("no handshake probe");
        assert_eq!(probe, Frame::zeroed());
        self.send_raw(&[0u8; FRAME_LEN], host).await;
        host
    }

    /// Skip heartbeats and return the next other frame.
    pub async fn recv_request(&self, wait: Duration) -> Option<(Frame, SocketAddr)> {
        loop {
            let (frame, from) = self.recv_frame(wait).await?;
            if !(0x700..0x780).contains(&frame.cob_id()) {
                return Some((frame, from));
            }
        }
    }
}

/// A gateway connected to a fresh scripted bridge; returns the host address too.
pub async fn connected(config: GatewayConfig) -> (Gateway, ScriptedBridge, SocketAddr) {
    init_logging();
    let bridge = ScriptedBridge::bind().await;
    let gateway = Gateway::new(config);
    let port = bridge.port();
    let (connected, host) = tokio::join!(gateway.connect("127.0.0.1", port), bridge.accept_handshake());
    connected.unwrap();
    (gateway, bridge, host)
}

/// Poll `check` until it holds or `wait` elapses.
pub async fn eventually(wait: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

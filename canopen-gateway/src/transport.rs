//! UDP endpoint towards the CAN-to-UDP bridge.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use canopen_common::{Frame, FRAME_LEN};
use log::{debug, info};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{GatewayError, Result};

/// Room for datagrams longer than a frame; only the first 16 bytes are used.
pub const RECV_BUFFER_LEN: usize = 64;

#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl Transport {
    /// Bind a fresh IPv4 datagram endpoint.
    pub async fn create(local: SocketAddr) -> Result<Self> {
        if !local.is_ipv4() {
            return Err(GatewayError::InvalidArgument(format!("{} is not an IPv4 address", local)));
        }
        let socket = UdpSocket::bind(local).await.map_err(GatewayError::SocketInit)?;
        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    /// Send an all-zero probe to `peer` and wait for any datagram back.
    pub async fn handshake(&self, peer: SocketAddr, wait: Duration) -> Result<()> {
        let failed = |reason: String| GatewayError::HandshakeFailed { addr: peer, reason };

        self.socket
            .connect(peer)
            .await
            .map_err(|e| failed(format!("connect: {}", e)))?;
        self.send(&Frame::zeroed()).await?;
        debug!("Handshake probe sent to {}", peer);

        let mut buf = [0u8; RECV_BUFFER_LEN];
        match timeout(wait, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                info!("Bridge {} answered handshake ({} bytes)", peer, n);
                Ok(())
            }
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed(format!("no response within {:?}", wait))),
        }
    }

    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::NotConnected);
        }
        let sent = self.socket.send(frame.as_bytes()).await.map_err(GatewayError::Send)?;
        if sent != FRAME_LEN {
            return Err(GatewayError::Send(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short datagram: {} of {} bytes", sent, FRAME_LEN),
            )));
        }
        Ok(())
    }

    /// Wait up to `poll` for one datagram; `Ok(None)` when nothing arrived.
    pub async fn try_receive(&self, buf: &mut [u8], poll: Duration) -> Result<Option<usize>> {
        if self.is_closed() {
            return Err(GatewayError::NotConnected);
        }
        match timeout(poll, self.socket.recv(buf)).await {
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) => Err(GatewayError::Recv(e)),
            Err(_) => Ok(None),
        }
    }

    /// Mark the endpoint closed. Returns `true` only for the first call; the
    /// socket itself is released when the last handle is dropped.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            debug!("Transport to {:?} closed", self.peer_addr());
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

//! UDP side of the simulated CAN-to-UDP bridge.
//!
//! The bridge answers the host's all-zero probe with the node's boot-up
//! message, routes SDO requests to the [`SdoServer`], broadcasts TPDO1 and
//! forwards whatever the test or operator injects through [`BridgeHandle`].

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use canopen_common::frame::{COB_HEARTBEAT, PDO_COB_RANGE};
use canopen_common::{encode_heartbeat, encode_raw, EmergencyMessage, Frame, PdoData};
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::sdo_server::SdoServer;

/// NMT state byte sent in the boot-up message.
const BOOT_UP: u8 = 0x00;
/// NMT state byte of an operational node.
const OPERATIONAL: u8 = 0x05;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// TPDO1 broadcast period; `None` disables the broadcast
    pub tpdo_period: Option<Duration>,
    /// Node heartbeat period; `None` disables it
    pub heartbeat_period: Option<Duration>,
    /// Leave SDO requests unanswered
    pub mute_sdo: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            tpdo_period: Some(Duration::from_millis(100)),
            heartbeat_period: None,
            mute_sdo: false,
        }
    }
}

/// What the bridge has seen from the host.
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub probes: usize,
    pub sdo_requests: usize,
    pub heartbeats: Vec<Frame>,
    pub pdos: Vec<Frame>,
}

enum BridgeCommand {
    Send(Frame),
}

pub struct MockBridge {
    socket: UdpSocket,
    server: SdoServer,
    options: BridgeOptions,
    stats: Arc<Mutex<BridgeStats>>,
}

fn lock(stats: &Mutex<BridgeStats>) -> MutexGuard<'_, BridgeStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockBridge {
    pub async fn bind(addr: SocketAddr, server: SdoServer, options: BridgeOptions) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            server,
            options,
            stats: Arc::new(Mutex::new(BridgeStats::default())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run on a background task.
    pub fn spawn(self) -> io::Result<BridgeHandle> {
        let addr = self.local_addr()?;
        let stats = self.stats.clone();
        let node_id = self.server.node_id();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(shutdown_rx, command_rx));
        Ok(BridgeHandle {
            addr,
            node_id,
            stats,
            shutdown,
            command_tx,
            task,
        })
    }

    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut commands: mpsc::UnboundedReceiver<BridgeCommand>,
    ) {
        let node_id = self.server.node_id();
        let mut host: Option<SocketAddr> = None;
        let mut buf = [0u8; 64];

        let mut tpdo_tick = interval(self.options.tpdo_period.unwrap_or(Duration::from_secs(3600)));
        tpdo_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_tick = interval(self.options.heartbeat_period.unwrap_or(Duration::from_secs(3600)));
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // TPDO broadcasting state
        let mut temperature: u16 = 2350; // 23.50°C
        let mut pressure: u16 = 1013; // 1013 hPa
        let mut status: u8 = 1;

        info!("Mock bridge for node {} listening on {:?}", node_id, self.socket.local_addr());

        loop {
            let outgoing = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.handle_datagram(&buf[..n], from, &mut host),
                    Err(e) => {
                        // ICMP errors from a vanished host surface here on some platforms
                        debug!("Mock bridge receive error: {}", e);
                        None
                    }
                },
                command = commands.recv() => match command {
                    Some(BridgeCommand::Send(frame)) => Some(frame),
                    None => break,
                },
                _ = tpdo_tick.tick(), if self.options.tpdo_period.is_some() && host.is_some() => {
                    temperature = (temperature + 1) % 3000;
                    pressure = 1000 + (pressure - 1000 + 1) % 50;
                    status = if status == 1 { 2 } else { 1 };

                    let [t_lo, t_hi] = temperature.to_le_bytes();
                    let [p_lo, p_hi] = pressure.to_le_bytes();
                    PdoData::new(&[t_lo, t_hi, p_lo, p_hi, status])
                        .map(|data| encode_raw(0x180 + node_id as u16, &data))
                }
                _ = heartbeat_tick.tick(), if self.options.heartbeat_period.is_some() && host.is_some() => {
                    Some(encode_heartbeat(node_id, OPERATIONAL))
                }
            };

            if let (Some(frame), Some(to)) = (outgoing, host) {
                if let Err(e) = self.socket.send_to(frame.as_bytes(), to).await {
                    warn!("Failed to send {:?} to {}: {}", frame, to, e);
                }
            }
        }
        info!("Mock bridge stopped");
    }

    fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, host: &mut Option<SocketAddr>) -> Option<Frame> {
        let Some(frame) = Frame::from_bytes(bytes) else {
            warn!("Ignoring {}-byte datagram from {}", bytes.len(), from);
            return None;
        };
        *host = Some(from);

        if frame == Frame::zeroed() {
            info!("Handshake probe from {}", from);
            lock(&self.stats).probes += 1;
            return Some(encode_heartbeat(self.server.node_id(), BOOT_UP));
        }

        let cob_id = frame.cob_id();
        if (COB_HEARTBEAT..COB_HEARTBEAT + 0x80).contains(&cob_id) {
            debug!("Host heartbeat {:?}", frame);
            lock(&self.stats).heartbeats.push(frame);
            return None;
        }
        if PDO_COB_RANGE.contains(&cob_id) {
            debug!("Host PDO {:?}", frame);
            lock(&self.stats).pdos.push(frame);
            return None;
        }

        let response = self.server.handle_frame(&frame);
        if response.is_some() {
            lock(&self.stats).sdo_requests += 1;
            if self.options.mute_sdo {
                return None;
            }
        }
        response
    }
}

/// Control of a spawned bridge.
pub struct BridgeHandle {
    addr: SocketAddr,
    node_id: u8,
    stats: Arc<Mutex<BridgeStats>>,
    shutdown: watch::Sender<bool>,
    command_tx: mpsc::UnboundedSender<BridgeCommand>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn stats(&self) -> BridgeStats {
        lock(&self.stats).clone()
    }

    /// Forward a frame to the host as if it came from the bus.
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.command_tx.send(BridgeCommand::Send(frame)).is_ok()
    }

    /// Raise an EMCY from the simulated node.
    pub fn emergency(&self, error_code: u16, error_register: u8) -> bool {
        let emcy = EmergencyMessage {
            node_id: self.node_id,
            error_code,
            error_register,
            manufacturer_data: [0; 5],
        };
        self.send_frame(emcy.to_frame())
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Mock bridge task failed: {}", e);
        }
    }
}

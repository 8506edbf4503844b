use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use canopen_common::{
    decode_sdo_response, encode_pdo, encode_sdo_request, get_abort_code_description, parse_payload,
    ExpeditedData, Frame, PdoData, SdoCommand, SdoDataType, SdoKind, SdoValue, EXPEDITED_MAX_LEN,
    PDO_MAX_LEN,
};
use log::{info, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::correlator::{AwaitError, Correlator};
use crate::dispatch::DispatchLoop;
use crate::error::{GatewayError, Result};
use crate::recorder::{RecordEvent, Recorder};
use crate::sinks::{ErrorSink, PdoSink, SinkRegistry};
use crate::state::{ConnectionState, HeartbeatSettings};
use crate::transport::Transport;

/// Value returned by an expedited SDO read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoReadResult {
    pub valid_len: usize,
    pub value: [u8; EXPEDITED_MAX_LEN],
}

impl SdoReadResult {
    pub fn data(&self) -> &[u8] {
        &self.value[..self.valid_len]
    }
}

struct Session {
    transport: Arc<Transport>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Session {
    async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!("Dispatch task ended abnormally: {}", e);
        }
        self.transport.close();
    }
}

/// CANopen gateway over a CAN-to-UDP bridge.
///
/// All operations take `&self`; share the gateway behind an `Arc` to issue
/// requests from several tasks. Expedited SDO transfers of the same kind are
/// serialized because responses carry no request identifier. Reads and writes
/// proceed independently of each other and of PDO traffic.
pub struct Gateway {
    config: GatewayConfig,
    correlator: Arc<Correlator>,
    sinks: Arc<SinkRegistry>,
    recorder: Arc<Recorder>,
    connection: Arc<watch::Sender<ConnectionState>>,
    heartbeat: watch::Sender<HeartbeatSettings>,
    session: Mutex<Option<Session>>,
    write_ticket: Mutex<()>,
    read_ticket: Mutex<()>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let heartbeat = HeartbeatSettings {
            enabled: false,
            node_id: config.heartbeat.node_id,
            state: config.heartbeat.state,
            period: config.heartbeat_period(),
        };
        Self {
            correlator: Arc::new(Correlator::new(config.cob_id_match)),
            sinks: Arc::new(SinkRegistry::default()),
            recorder: Arc::new(Recorder::new()),
            connection: Arc::new(watch::Sender::new(ConnectionState::Disconnected)),
            heartbeat: watch::Sender::new(heartbeat),
            session: Mutex::new(None),
            write_ticket: Mutex::new(()),
            read_ticket: Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Receiver that follows every connection state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Address the local socket is bound to while connected.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.session.lock().await.as_ref().and_then(|s| s.transport.local_addr())
    }

    fn set_state(&self, state: ConnectionState) {
        self.connection.send_replace(state);
        self.recorder.record(RecordEvent::ConnectionStatus(state));
    }

    /// Connect to the bridge configured in `GatewayConfig`.
    pub async fn connect_configured(&self) -> Result<()> {
        let addr = self
            .config
            .bridge_addr()
            .map_err(|e| GatewayError::InvalidArgument(e.to_string()))?;
        self.connect_addr(addr).await
    }

    /// Handshake with the bridge at `address:port` and start the dispatch loop.
    pub async fn connect(&self, address: &str, port: u16) -> Result<()> {
        let ip: Ipv4Addr = address
            .parse()
            .map_err(|_| GatewayError::InvalidArgument(format!("'{}' is not an IPv4 address", address)))?;
        self.connect_addr(SocketAddr::V4(SocketAddrV4::new(ip, port))).await
    }

    async fn connect_addr(&self, peer: SocketAddr) -> Result<()> {
        let local = self
            .config
            .local_addr()
            .map_err(|e| GatewayError::InvalidArgument(e.to_string()))?;

        let mut session = self.session.lock().await;
        if self.is_connected() {
            return Err(GatewayError::AlreadyConnected);
        }
        // reap a session that died on a transport error
        if let Some(stale) = session.take() {
            stale.stop().await;
        }

        self.set_state(ConnectionState::Handshaking);
        let transport = match self.open_transport(local, peer).await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                self.recorder.record(RecordEvent::ConnectionFailed(e.to_string()));
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.set_state(ConnectionState::Connected);
        let dispatch = DispatchLoop {
            transport: transport.clone(),
            correlator: self.correlator.clone(),
            sinks: self.sinks.clone(),
            recorder: self.recorder.clone(),
            connection: self.connection.clone(),
            heartbeat: self.heartbeat.subscribe(),
            shutdown: shutdown_rx,
            poll_interval: self.config.poll_interval(),
        };
        let task = tokio::spawn(dispatch.run());
        *session = Some(Session {
            transport,
            shutdown,
            task,
        });
        info!("Connected to bridge {}", peer);

        if self.config.heartbeat.start_on_connect {
            self.start_heartbeat(self.config.heartbeat_period());
        }
        Ok(())
    }

    async fn open_transport(&self, local: SocketAddr, peer: SocketAddr) -> Result<Transport> {
        let transport = Transport::create(local).await?;
        transport.handshake(peer, self.config.handshake_timeout()).await?;
        Ok(transport)
    }

    /// Stop the dispatch loop and release the socket.
    ///
    /// Fails with `NotConnected` when there is no live session, including after
    /// the dispatch loop dropped the connection on its own.
    pub async fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let was_connected = self.is_connected();
        let Some(live) = session.take() else {
            return Err(GatewayError::NotConnected);
        };

        live.stop().await;
        if !was_connected {
            return Err(GatewayError::NotConnected);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected from bridge");
        Ok(())
    }

    async fn transport(&self) -> Result<Arc<Transport>> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        match self.session.lock().await.as_ref() {
            Some(session) if !session.transport.is_closed() => Ok(session.transport.clone()),
            _ => Err(GatewayError::NotConnected),
        }
    }

    /// Expedited SDO write of up to four bytes; resolves on the node's acknowledgement.
    pub async fn write_sdo(
        &self,
        receiver_id: u8,
        index: u16,
        subindex: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let data = ExpeditedData::new(data).map_err(|e| GatewayError::InvalidArgument(e.to_string()))?;
        let transport = self.transport().await?;

        let _ticket = self.write_ticket.lock().await;
        let frame = encode_sdo_request(SdoKind::Write, receiver_id, index, subindex, Some(&data));
        let result = self
            .transact(&transport, SdoKind::Write, frame, receiver_id, index, subindex, timeout)
            .await
            .map(|_| ());

        self.record_sdo(SdoKind::Write, receiver_id, index, subindex, &result, || {
            format!("{:02X?}", data.as_slice())
        });
        result
    }

    /// Expedited SDO read; the returned length comes from the response command byte.
    pub async fn read_sdo(
        &self,
        receiver_id: u8,
        index: u16,
        subindex: u8,
        timeout: Duration,
    ) -> Result<SdoReadResult> {
        let transport = self.transport().await?;

        let _ticket = self.read_ticket.lock().await;
        let frame = encode_sdo_request(SdoKind::Read, receiver_id, index, subindex, None);
        let result = self
            .transact(&transport, SdoKind::Read, frame, receiver_id, index, subindex, timeout)
            .await
            .map(|response| {
                let payload = decode_sdo_response(&response);
                SdoReadResult {
                    valid_len: payload.valid_len,
                    value: payload.bytes,
                }
            });

        self.record_sdo(SdoKind::Read, receiver_id, index, subindex, &result, || match &result {
            Ok(read) => format!("{:02X?}", read.data()),
            Err(_) => String::new(),
        });
        result
    }

    /// Write a typed value using its little-endian encoding.
    pub async fn write_value(
        &self,
        receiver_id: u8,
        index: u16,
        subindex: u8,
        value: &SdoValue,
        timeout: Duration,
    ) -> Result<()> {
        let data = value.to_expedited()?;
        self.write_sdo(receiver_id, index, subindex, data.as_slice(), timeout).await
    }

    /// Read an object and decode it as `data_type`.
    pub async fn read_value(
        &self,
        receiver_id: u8,
        index: u16,
        subindex: u8,
        data_type: SdoDataType,
        timeout: Duration,
    ) -> Result<SdoValue> {
        let read = self.read_sdo(receiver_id, index, subindex, timeout).await?;
        Ok(parse_payload(read.data(), data_type)?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn transact(
        &self,
        transport: &Transport,
        kind: SdoKind,
        request: Frame,
        receiver_id: u8,
        index: u16,
        subindex: u8,
        timeout: Duration,
    ) -> Result<Frame> {
        let mut connection = self.connection.subscribe();
        self.correlator.begin(kind, receiver_id, index, subindex);
        if let Err(e) = transport.send(&request).await {
            self.correlator.cancel(kind);
            return Err(e);
        }

        let response = self
            .correlator
            .await_result(kind, receiver_id, index, subindex, timeout, &mut connection)
            .await
            .map_err(|e| match e {
                AwaitError::TimedOut(waited) => GatewayError::Timeout {
                    kind,
                    index,
                    subindex,
                    waited,
                },
                AwaitError::Disconnected => GatewayError::ConnectionLost,
            })?;

        if response.command() == SdoCommand::AbortTransfer as u8 {
            let code = decode_sdo_response(&response).abort_code();
            return Err(GatewayError::SdoAbort {
                index,
                subindex,
                code,
                description: get_abort_code_description(code),
            });
        }
        Ok(response)
    }

    fn record_sdo<T>(
        &self,
        kind: SdoKind,
        node_id: u8,
        index: u16,
        subindex: u8,
        result: &Result<T>,
        value: impl FnOnce() -> String,
    ) {
        let event = match result {
            Ok(_) => RecordEvent::SdoData {
                kind,
                node_id,
                index,
                subindex,
                value: value(),
            },
            Err(e) => RecordEvent::SdoError {
                kind,
                node_id,
                index,
                subindex,
                error: e.to_string(),
            },
        };
        self.recorder.record(event);
    }

    /// Fire-and-forget PDO with `cob_id = pdo_number + receiver_id`.
    pub async fn write_pdo(&self, receiver_id: u8, pdo_number: u16, data: &[u8]) -> Result<()> {
        let data = PdoData::new(data).ok_or_else(|| {
            GatewayError::InvalidArgument(format!(
                "PDO payload of {} bytes exceeds {} bytes",
                data.len(),
                PDO_MAX_LEN
            ))
        })?;
        let transport = self.transport().await?;
        transport.send(&encode_pdo(receiver_id, pdo_number, &data)).await
    }

    /// Emit the heartbeat frame every `period`, starting one period from now.
    pub fn start_heartbeat(&self, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        self.heartbeat.send_modify(|hb| {
            hb.enabled = true;
            hb.period = period;
        });
        info!("Heartbeat started, period {:?}", period);
        self.recorder.record(RecordEvent::Heartbeat(true));
    }

    pub fn stop_heartbeat(&self) {
        self.heartbeat.send_modify(|hb| hb.enabled = false);
        info!("Heartbeat stopped");
        self.recorder.record(RecordEvent::Heartbeat(false));
    }

    pub fn heartbeat_settings(&self) -> HeartbeatSettings {
        *self.heartbeat.borrow()
    }

    pub fn register_pdo_sink(&self, sink: impl PdoSink + 'static) {
        self.sinks.set_pdo_sink(Arc::new(sink));
    }

    pub fn register_error_sink(&self, sink: impl ErrorSink + 'static) {
        self.sinks.set_error_sink(Arc::new(sink));
    }

    /// Every well-formed inbound frame, before classification.
    pub fn subscribe_frames(&self) -> mpsc::UnboundedReceiver<Frame> {
        self.sinks.subscribe()
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

//! Background task that receives bridge frames and routes them.

use std::sync::Arc;
use std::time::Duration;

use canopen_common::{
    classify, encode_heartbeat, ErrorMessage, Frame, FrameKind, PdoMessage, SdoKind,
};
use log::{debug, error, info, trace};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::correlator::Correlator;
use crate::error::GatewayError;
use crate::recorder::{RecordEvent, Recorder};
use crate::sinks::SinkRegistry;
use crate::state::{ConnectionState, HeartbeatSettings};
use crate::transport::{Transport, RECV_BUFFER_LEN};

pub(crate) struct DispatchLoop {
    pub transport: Arc<Transport>,
    pub correlator: Arc<Correlator>,
    pub sinks: Arc<SinkRegistry>,
    pub recorder: Arc<Recorder>,
    pub connection: Arc<watch::Sender<ConnectionState>>,
    pub heartbeat: watch::Receiver<HeartbeatSettings>,
    pub shutdown: watch::Receiver<bool>,
    pub poll_interval: Duration,
}

impl DispatchLoop {
    pub async fn run(mut self) {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let mut next_beat: Option<Instant> = None;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let heartbeat = *self.heartbeat.borrow();
            next_beat = match (heartbeat.enabled, next_beat) {
                (false, _) => None,
                (true, None) => Some(Instant::now() + heartbeat.period),
                (true, Some(at)) => Some(at.min(Instant::now() + heartbeat.period)),
            };
            let poll = match next_beat {
                Some(at) => self.poll_interval.min(at.saturating_duration_since(Instant::now())),
                None => self.poll_interval,
            };

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                received = self.transport.try_receive(&mut buf, poll) => match received {
                    Ok(Some(n)) => self.handle_datagram(&buf[..n]),
                    Ok(None) => {}
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                }
            }

            if let Some(at) = next_beat {
                if Instant::now() >= at {
                    let frame = encode_heartbeat(heartbeat.node_id, heartbeat.state);
                    if let Err(e) = self.transport.send(&frame).await {
                        self.fail(e);
                        return;
                    }
                    trace!("Heartbeat sent: {:?}", frame);
                    next_beat = Some(Instant::now() + heartbeat.period);
                }
            }
        }
        debug!("Dispatch loop stopped");
    }

    fn handle_datagram(&self, bytes: &[u8]) {
        let Some(frame) = Frame::from_bytes(bytes) else {
            debug!("Ignoring {}-byte datagram", bytes.len());
            return;
        };
        self.sinks.publish_frame(&frame);
        self.route(frame);
    }

    fn route(&self, frame: Frame) {
        let kind = classify(&frame);
        debug!("{:?} <- {:?}", kind, frame);

        match kind {
            FrameKind::Pdo => {
                let pdo = PdoMessage::from_frame(&frame);
                self.sinks.dispatch_pdo(&pdo);
                self.recorder.record(RecordEvent::Pdo(pdo));
            }
            FrameKind::SdoWriteAck => self.correlator.offer(SdoKind::Write, frame),
            FrameKind::SdoReadResponse => self.correlator.offer(SdoKind::Read, frame),
            FrameKind::SdoAbort => {
                // an abort answers whichever request is waiting on that object
                if self.correlator.is_pending(SdoKind::Write) {
                    self.correlator.offer(SdoKind::Write, frame);
                }
                if self.correlator.is_pending(SdoKind::Read) {
                    self.correlator.offer(SdoKind::Read, frame);
                }
            }
            FrameKind::Error => {
                let err = ErrorMessage::from_frame(&frame);
                self.sinks.dispatch_error(&err);
                self.recorder.record(RecordEvent::Error(err));
            }
            FrameKind::Unrecognized => {}
        }
    }

    fn fail(&self, e: GatewayError) {
        error!("Bridge connection lost: {}", e);
        self.transport.close();
        self.connection.send_replace(ConnectionState::Disconnected);
        self.recorder.record(RecordEvent::ConnectionFailed(e.to_string()));
        info!("Gateway disconnected after transport failure");
    }
}

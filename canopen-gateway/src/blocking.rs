//! Synchronous wrapper for callers without an async runtime.

use std::time::Duration;

use canopen_common::{Frame, SdoDataType, SdoValue};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::{Gateway, SdoReadResult};
use crate::sinks::{ErrorSink, PdoSink};
use crate::state::ConnectionState;

/// A `Gateway` driven by its own runtime. Every call blocks the calling
/// thread; the dispatch loop keeps running on the runtime's worker thread
/// between calls.
///
/// Must not be used from inside another tokio runtime.
pub struct BlockingGateway {
    runtime: Runtime,
    inner: Gateway,
}

impl BlockingGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("canopen-dispatch")
            .enable_all()
            .build()
            .map_err(GatewayError::SocketInit)?;
        Ok(Self {
            runtime,
            inner: Gateway::new(config),
        })
    }

    pub fn gateway(&self) -> &Gateway {
        &self.inner
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn connect(&self, address: &str, port: u16) -> Result<()> {
        self.runtime.block_on(self.inner.connect(address, port))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.runtime.block_on(self.inner.disconnect())
    }

    pub fn write_sdo(&self, receiver_id: u8, index: u16, subindex: u8, data: &[u8], timeout: Duration) -> Result<()> {
        self.runtime
            .block_on(self.inner.write_sdo(receiver_id, index, subindex, data, timeout))
    }

    pub fn read_sdo(&self, receiver_id: u8, index: u16, subindex: u8, timeout: Duration) -> Result<SdoReadResult> {
        self.runtime
            .block_on(self.inner.read_sdo(receiver_id, index, subindex, timeout))
    }

    pub fn write_value(
        &self,
        receiver_id: u8,
        index: u16,
        subindex: u8,
        value: &SdoValue,
        timeout: Duration,
    ) -> Result<()> {
        self.runtime
            .block_on(self.inner.write_value(receiver_id, index, subindex, value, timeout))
    }

    pub fn read_value(
        &self,
        receiver_id: u8,
        index: u16,
        subindex: u8,
        data_type: SdoDataType,
        timeout: Duration,
    ) -> Result<SdoValue> {
        self.runtime
            .block_on(self.inner.read_value(receiver_id, index, subindex, data_type, timeout))
    }

    pub fn write_pdo(&self, receiver_id: u8, pdo_number: u16, data: &[u8]) -> Result<()> {
        self.runtime.block_on(self.inner.write_pdo(receiver_id, pdo_number, data))
    }

    pub fn start_heartbeat(&self, period: Duration) {
        self.inner.start_heartbeat(period)
    }

    pub fn stop_heartbeat(&self) {
        self.inner.stop_heartbeat()
    }

    pub fn register_pdo_sink(&self, sink: impl PdoSink + 'static) {
        self.inner.register_pdo_sink(sink)
    }

    pub fn register_error_sink(&self, sink: impl ErrorSink + 'static) {
        self.inner.register_error_sink(sink)
    }

    /// Use `blocking_recv` on the returned receiver.
    pub fn subscribe_frames(&self) -> mpsc::UnboundedReceiver<Frame> {
        self.inner.subscribe_frames()
    }
}

impl Drop for BlockingGateway {
    fn drop(&mut self) {
        if self.inner.is_connected() {
            let _ = self.runtime.block_on(self.inner.disconnect());
        }
    }
}

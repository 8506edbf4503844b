use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use canopen_common::{SdoError, SdoKind};
use thiserror::Error;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Failures surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway is not connected")]
    NotConnected,

    #[error("gateway is already connected")]
    AlreadyConnected,

    #[error("failed to create UDP socket: {0}")]
    SocketInit(#[source] io::Error),

    #[error("failed to send frame: {0}")]
    Send(#[source] io::Error),

    #[error("failed to receive frame: {0}")]
    Recv(#[source] io::Error),

    #[error("handshake with bridge {addr} failed: {reason}")]
    HandshakeFailed { addr: SocketAddr, reason: String },

    #[error("SDO {kind} 0x{index:04X}:{subindex:02X} timed out after {waited:?}")]
    Timeout {
        kind: SdoKind,
        index: u16,
        subindex: u8,
        waited: Duration,
    },

    #[error("connection lost while waiting for a response")]
    ConnectionLost,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("SDO abort 0x{code:08X} on 0x{index:04X}:{subindex:02X}: {description}")]
    SdoAbort {
        index: u16,
        subindex: u8,
        code: u32,
        description: String,
    },

    #[error("payload error: {0}")]
    Payload(#[from] SdoError),
}

impl GatewayError {
    /// Whether the caller may simply retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }
}

/// Errors from loading or saving the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine a configuration directory")]
    NoConfigDir,

    #[error("config file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

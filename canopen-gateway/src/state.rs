use std::fmt;

/// Lifecycle of a gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Handshaking,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Handshaking => write!(f, "Handshaking"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Heartbeat emission settings read by the dispatch loop each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub node_id: u8,
    pub state: u8,
    pub period: std::time::Duration,
}

//! # CANopen UDP Gateway
//!
//! Talks to CANopen nodes through a CAN-to-UDP bridge that wraps every CAN
//! frame in a fixed 16-byte datagram.
//!
//! - [`Gateway`]: async façade (connect, expedited SDO read/write, PDO write,
//!   heartbeat, observers)
//! - [`BlockingGateway`]: the same operations for synchronous callers
//! - [`GatewayConfig`]: TOML configuration
//! - [`Recorder`]: optional CSV recording of bus traffic
//!
//! ```no_run
//! use std::time::Duration;
//! use canopen_gateway::{Gateway, GatewayConfig};
//!
//! # async fn run() -> canopen_gateway::Result<()> {
//! let gateway = Gateway::new(GatewayConfig::default());
//! gateway.connect("127.0.0.1", 9999).await?;
//! gateway.write_sdo(0x02, 0x2000, 0x01, &[0x2A], Duration::from_millis(1000)).await?;
//! let value = gateway.read_sdo(0x02, 0x2000, 0x01, Duration::from_millis(500)).await?;
//! println!("{:02X?}", value.data());
//! gateway.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod config;
pub mod correlator;
mod dispatch;
pub mod error;
pub mod gateway;
pub mod recorder;
pub mod sinks;
pub mod state;
pub mod transport;

pub use blocking::BlockingGateway;
pub use config::{GatewayConfig, HeartbeatConfig, RecorderConfig};
pub use error::{ConfigError, GatewayError, Result};
pub use gateway::{Gateway, SdoReadResult};
pub use recorder::{RecordEvent, Recorder};
pub use sinks::{ErrorSink, PdoSink};
pub use state::{ConnectionState, HeartbeatSettings};

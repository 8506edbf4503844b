//! # Mock CANopen Node
//!
//! A CAN-to-UDP bridge simulator with a single CANopen node behind it, for
//! exercising the gateway without hardware.
//!
//! The simulated node:
//! - answers the gateway's handshake probe with a boot-up message
//! - serves expedited SDO uploads and downloads from an [`ObjectDictionary`]
//! - broadcasts TPDO1 (`0x180 + node_id`) with changing sensor values
//! - can raise EMCY frames on request

pub mod bridge;
pub mod object_dictionary;
pub mod sdo_server;

pub use bridge::{BridgeHandle, BridgeOptions, BridgeStats, MockBridge};
pub use object_dictionary::{parse_object_file, DictionaryError, EntrySpec, ObjectDictionary};
pub use sdo_server::SdoServer;

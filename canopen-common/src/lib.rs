//! # CANopen Common Library
//!
//! Shared CANopen protocol implementation used by the UDP gateway and by the
//! mock bridge node used for testing.
//!
//! This library provides:
//! - the 16-byte bridge frame layout and classification of inbound frames
//! - expedited SDO command encoding, typed values and abort codes
//! - emergency (EMCY) frame decoding
//!
//! Nothing in here performs I/O.

pub mod emergency;
pub mod frame;
pub mod sdo;

// Re-export commonly used types for convenience
pub use emergency::{EmergencyErrorClass, EmergencyMessage, ErrorRegister};
pub use frame::{
    classify, decode_sdo_response, encode_heartbeat, encode_pdo, encode_raw, encode_sdo_request,
    encode_sdo_response, matches, CobIdMatch, ErrorMessage, Frame, FrameKind, PdoData, PdoMessage,
    SdoKind, FRAME_LEN, PDO_MAX_LEN,
};
pub use sdo::{
    get_abort_code_description, parse_hex_bytes, parse_payload, ExpeditedData, SdoCommand, SdoDataType, SdoError,
    SdoPayload, SdoValue, EXPEDITED_MAX_LEN,
};

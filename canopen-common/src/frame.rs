//! Fixed 16-byte datagram layout used by CAN-to-UDP bridges.
//!
//! | Offset | Field |
//! |---|---|
//! | 0..2 | COB-ID, little-endian |
//! | 4 | DLC |
//! | 8 | SDO command / first PDO byte |
//! | 9..11 | SDO index, little-endian |
//! | 11 | SDO subindex |
//! | 12..16 | SDO payload (PDO payload spans 8..16) |
//!
//! Bytes 2..4 and 5..8 are reserved and always written as zero.

use core::ops::{Range, RangeInclusive};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sdo::{ExpeditedData, SdoCommand, SdoPayload, EXPEDITED_MAX_LEN};

/// Every datagram on the bridge is exactly this long.
pub const FRAME_LEN: usize = 16;
/// DLC used by all SDO frames.
pub const SDO_DLC: u8 = 8;
/// Maximum PDO payload.
pub const PDO_MAX_LEN: usize = 8;

const COB_ID_LOW: usize = 0;
const COB_ID_HIGH: usize = 1;
const DLC: usize = 4;
const COMMAND: usize = 8;
const INDEX_LOW: usize = 9;
const INDEX_HIGH: usize = 10;
const SUBINDEX: usize = 11;
const SDO_DATA: usize = 12;
const PDO_DATA: usize = 8;

/// Canopen function code bases on COB_ID
pub const COB_SDO_REQUEST: u16 = 0x600;
pub const COB_SDO_RESPONSE: u16 = 0x580;
pub const COB_HEARTBEAT: u16 = 0x700;
pub const COB_EMERGENCY: u16 = 0x080;

/// Inbound COB-IDs treated as process data.
pub const PDO_COB_RANGE: RangeInclusive<u16> = 0x181..=0x57F;
/// Inbound COB-IDs treated as error/emergency traffic.
pub const ERROR_COB_RANGE: Range<u16> = 0x81..0xFF;
/// SDO responses from nodes 1..=127.
pub const SDO_RESPONSE_COB_RANGE: RangeInclusive<u16> = 0x581..=0x5FF;

/// One bridge datagram.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    /// All-zero frame, also used as the handshake probe.
    pub const fn zeroed() -> Self {
        Frame([0; FRAME_LEN])
    }

    /// Takes the first 16 bytes of a datagram; shorter datagrams are not frames.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let head: [u8; FRAME_LEN] = bytes.get(..FRAME_LEN)?.try_into().ok()?;
        Some(Frame(head))
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    pub fn cob_id(&self) -> u16 {
        u16::from_le_bytes([self.0[COB_ID_LOW], self.0[COB_ID_HIGH]])
    }

    pub fn dlc(&self) -> u8 {
        self.0[DLC]
    }

    pub fn command(&self) -> u8 {
        self.0[COMMAND]
    }

    pub fn index(&self) -> u16 {
        u16::from_le_bytes([self.0[INDEX_LOW], self.0[INDEX_HIGH]])
    }

    pub fn subindex(&self) -> u8 {
        self.0[SUBINDEX]
    }

    pub fn sdo_data(&self) -> [u8; EXPEDITED_MAX_LEN] {
        let mut data = [0u8; EXPEDITED_MAX_LEN];
        data.copy_from_slice(&self.0[SDO_DATA..FRAME_LEN]);
        data
    }

    pub fn pdo_data(&self) -> [u8; PDO_MAX_LEN] {
        let mut data = [0u8; PDO_MAX_LEN];
        data.copy_from_slice(&self.0[PDO_DATA..FRAME_LEN]);
        data
    }

    fn with_header(cob_id: u16, dlc: u8) -> Self {
        let mut frame = Frame::zeroed();
        let [low, high] = cob_id.to_le_bytes();
        frame.0[COB_ID_LOW] = low;
        frame.0[COB_ID_HIGH] = high;
        frame.0[DLC] = dlc;
        frame
    }

    fn set_sdo_address(&mut self, command: u8, index: u16, subindex: u8) {
        let [low, high] = index.to_le_bytes();
        self.0[COMMAND] = command;
        self.0[INDEX_LOW] = low;
        self.0[INDEX_HIGH] = high;
        self.0[SUBINDEX] = subindex;
    }
}

impl From<[u8; FRAME_LEN]> for Frame {
    fn from(bytes: [u8; FRAME_LEN]) -> Self {
        Frame(bytes)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(cob=0x{:03X}, dlc={}, {:02X?})", self.cob_id(), self.dlc(), &self.0[PDO_DATA..])
    }
}

/// The two expedited SDO request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdoKind {
    Write,
    Read,
}

impl fmt::Display for SdoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdoKind::Write => write!(f, "write"),
            SdoKind::Read => write!(f, "read"),
        }
    }
}

/// Classification of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Pdo,
    SdoWriteAck,
    SdoReadResponse,
    SdoAbort,
    Error,
    Unrecognized,
}

/// How a response COB-ID is composed from the SDO response base and a node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CobIdMatch {
    /// `0x580 + node_id`
    #[default]
    Additive,
    /// `0x580 | node_id`
    Bitwise,
}

impl CobIdMatch {
    pub fn response_cob_id(&self, receiver_id: u8) -> u16 {
        match self {
            CobIdMatch::Additive => COB_SDO_RESPONSE.wrapping_add(receiver_id as u16),
            CobIdMatch::Bitwise => COB_SDO_RESPONSE | receiver_id as u16,
        }
    }
}

/// Build an expedited SDO request addressed to `receiver_id`.
///
/// Writes carry `data` (empty when `None`); reads ignore it.
pub fn encode_sdo_request(
    kind: SdoKind,
    receiver_id: u8,
    index: u16,
    subindex: u8,
    data: Option<&ExpeditedData>,
) -> Frame {
    let mut frame = Frame::with_header(COB_SDO_REQUEST + receiver_id as u16, SDO_DLC);
    match kind {
        SdoKind::Write => {
            let data = data.copied().unwrap_or(ExpeditedData::EMPTY);
            frame.set_sdo_address(SdoCommand::download_request(data.len()), index, subindex);
            frame.0[SDO_DATA..FRAME_LEN].copy_from_slice(&data.padded());
        }
        SdoKind::Read => {
            frame.set_sdo_address(SdoCommand::InitiateUploadRequest as u8, index, subindex);
        }
    }
    frame
}

/// Build an SDO server-side frame (response, acknowledgement or abort).
pub fn encode_sdo_response(
    cob_id: u16,
    command: u8,
    index: u16,
    subindex: u8,
    data: [u8; EXPEDITED_MAX_LEN],
) -> Frame {
    let mut frame = Frame::with_header(cob_id, SDO_DLC);
    frame.set_sdo_address(command, index, subindex);
    frame.0[SDO_DATA..FRAME_LEN].copy_from_slice(&data);
    frame
}

/// Build a PDO frame with `cob_id = pdo_number + receiver_id`.
pub fn encode_pdo(receiver_id: u8, pdo_number: u16, data: &PdoData) -> Frame {
    encode_raw(pdo_number.wrapping_add(receiver_id as u16), data)
}

/// Build a frame with an arbitrary COB-ID and up to eight data bytes.
pub fn encode_raw(cob_id: u16, data: &PdoData) -> Frame {
    let mut frame = Frame::with_header(cob_id, data.len() as u8);
    frame.0[PDO_DATA..PDO_DATA + data.len()].copy_from_slice(data.as_slice());
    frame
}

/// Heartbeat producer frame: COB-ID `0x700 + node_id`, DLC 1, one state byte.
pub fn encode_heartbeat(node_id: u8, state: u8) -> Frame {
    let mut frame = Frame::with_header(COB_HEARTBEAT + node_id as u16, 1);
    frame.0[PDO_DATA] = state;
    frame
}

/// Classify an inbound frame; the first matching rule wins.
pub fn classify(frame: &Frame) -> FrameKind {
    let cob_id = frame.cob_id();
    let command = frame.command();

    if PDO_COB_RANGE.contains(&cob_id) {
        FrameKind::Pdo
    } else if command == SdoCommand::DownloadResponse as u8 {
        FrameKind::SdoWriteAck
    } else if frame.dlc() == SDO_DLC && SdoCommand::is_upload_response(command) {
        FrameKind::SdoReadResponse
    } else if frame.dlc() == SDO_DLC
        && command == SdoCommand::AbortTransfer as u8
        && SDO_RESPONSE_COB_RANGE.contains(&cob_id)
    {
        FrameKind::SdoAbort
    } else if ERROR_COB_RANGE.contains(&cob_id) {
        FrameKind::Error
    } else {
        FrameKind::Unrecognized
    }
}

/// Command byte, command-derived valid length and payload of an SDO frame.
pub fn decode_sdo_response(frame: &Frame) -> SdoPayload {
    let command = frame.command();
    SdoPayload {
        command,
        valid_len: SdoCommand::valid_bytes(command),
        bytes: frame.sdo_data(),
    }
}

/// Whether `frame` answers a request to `receiver_id` for `index:subindex`.
pub fn matches(frame: &Frame, receiver_id: u8, index: u16, subindex: u8, cob_match: CobIdMatch) -> bool {
    frame.cob_id() == cob_match.response_cob_id(receiver_id)
        && frame.index() == index
        && frame.subindex() == subindex
}

/// Payload of a PDO, at most eight bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PdoData {
    bytes: [u8; PDO_MAX_LEN],
    len: usize,
}

impl PdoData {
    pub fn new(data: &[u8]) -> Option<Self> {
        if data.len() > PDO_MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; PDO_MAX_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self { bytes, len: data.len() })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// An inbound PDO as handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMessage {
    pub cob_id: u16,
    pub length: u8,
    pub payload: [u8; PDO_MAX_LEN],
}

impl PdoMessage {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            cob_id: frame.cob_id(),
            length: frame.dlc(),
            payload: frame.pdo_data(),
        }
    }

    /// Meaningful bytes according to the DLC, capped at eight.
    pub fn data(&self) -> &[u8] {
        &self.payload[..(self.length as usize).min(PDO_MAX_LEN)]
    }
}

/// An inbound error/emergency frame as handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMessage {
    pub cob_id: u16,
    pub payload: [u8; PDO_MAX_LEN],
}

impl ErrorMessage {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            cob_id: frame.cob_id(),
            payload: frame.pdo_data(),
        }
    }
}

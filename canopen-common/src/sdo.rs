// sdo.rs - Expedited SDO command codes, payloads and typed values
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// Largest payload an expedited SDO transfer can carry.
pub const EXPEDITED_MAX_LEN: usize = 4;

/// SDO Command Specifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdoCommand {
    /// Initiate domain upload (read)
    InitiateUploadRequest = 0x40,
    /// Expedited upload response with 4 valid bytes
    ExpeditedUploadResponse = 0x43,
    /// Expedited download (write) with 4 valid bytes
    ExpeditedDownloadRequest = 0x23,
    /// Download acknowledgement
    DownloadResponse = 0x60,
    /// Abort transfer
    AbortTransfer = 0x80,
}

impl SdoCommand {
    /// Last command byte that still counts as an expedited upload response.
    pub const LAST_UPLOAD_RESPONSE: u8 = 0x53;

    /// Command byte of an expedited write carrying `len` valid bytes.
    ///
    /// `len` must be `0..=4`; the `n` field is three bits wide so that an
    /// empty write (`0x33`) stays distinguishable from a full one (`0x23`).
    pub fn download_request(len: usize) -> u8 {
        let unused = (EXPEDITED_MAX_LEN - len.min(EXPEDITED_MAX_LEN)) as u8;
        Self::ExpeditedDownloadRequest as u8 | (unused << 2)
    }

    /// Command byte of an expedited read response carrying `len` valid bytes.
    pub fn upload_response(len: usize) -> u8 {
        let unused = (EXPEDITED_MAX_LEN - len.min(EXPEDITED_MAX_LEN)) as u8;
        Self::ExpeditedUploadResponse as u8 | (unused << 2)
    }

    /// Number of valid payload bytes encoded in an expedited command byte.
    pub fn valid_bytes(command: u8) -> usize {
        let unused = ((command >> 2) & 0x07) as usize;
        EXPEDITED_MAX_LEN.saturating_sub(unused)
    }

    pub fn is_upload_response(command: u8) -> bool {
        (Self::ExpeditedUploadResponse as u8..=Self::LAST_UPLOAD_RESPONSE).contains(&command)
    }

    pub fn is_download_request(command: u8) -> bool {
        (command & 0xE3) == Self::ExpeditedDownloadRequest as u8
    }
}

/// Payload of an expedited SDO write, at most four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpeditedData {
    bytes: [u8; EXPEDITED_MAX_LEN],
    len: usize,
}

impl ExpeditedData {
    pub const EMPTY: Self = Self { bytes: [0; EXPEDITED_MAX_LEN], len: 0 };

    pub fn new(data: &[u8]) -> Result<Self, SdoError> {
        if data.len() > EXPEDITED_MAX_LEN {
            return Err(SdoError::InvalidLength {
                max: EXPEDITED_MAX_LEN,
                actual: data.len(),
            });
        }
        let mut bytes = [0u8; EXPEDITED_MAX_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self { bytes, len: data.len() })
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

    /// Zero-padded four byte block as it is placed on the wire.
    pub fn padded(&self) -> [u8; EXPEDITED_MAX_LEN] {
        self.bytes
    }
}

impl TryFrom<&[u8]> for ExpeditedData {
    type Error = SdoError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Self::new(data)
    }
}

/// Decoded expedited response: command byte plus the four payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoPayload {
    pub command: u8,
    pub valid_len: usize,
    pub bytes: [u8; EXPEDITED_MAX_LEN],
}

impl SdoPayload {
    pub fn value(&self) -> &[u8] {
        &self.bytes[..self.valid_len]
    }

    /// Abort code carried by an abort frame, little-endian in the payload.
    pub fn abort_code(&self) -> u32 {
        u32::from_le_bytes(self.bytes)
    }
}

/// SDO Data Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoDataType {
    UInt8,
    UInt16,
    UInt32,
    Int8,
    Int16,
    Int32,
    Real32,
    VisibleString,
    OctetString,
}

impl SdoDataType {
    /// Encoded size in bytes, `None` for string types.
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::UInt8 | Self::Int8 => Some(1),
            Self::UInt16 | Self::Int16 => Some(2),
            Self::UInt32 | Self::Int32 | Self::Real32 => Some(4),
            Self::VisibleString | Self::OctetString => None,
        }
    }
}

impl FromStr for SdoDataType {
    type Err = SdoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u8" | "uint8" => Ok(Self::UInt8),
            "u16" | "uint16" => Ok(Self::UInt16),
            "u32" | "uint32" => Ok(Self::UInt32),
            "i8" | "int8" => Ok(Self::Int8),
            "i16" | "int16" => Ok(Self::Int16),
            "i32" | "int32" => Ok(Self::Int32),
            "f32" | "float32" | "real32" => Ok(Self::Real32),
            "string" | "visible_string" => Ok(Self::VisibleString),
            "bytes" | "octet_string" => Ok(Self::OctetString),
            other => Err(SdoError::ParseError(format!("Unknown data type '{}'", other))),
        }
    }
}

/// A typed object dictionary value
#[derive(Debug, Clone, PartialEq)]
pub enum SdoValue {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Real32(f32),
    String(String),
    Bytes(Vec<u8>),
}

impl SdoValue {
    /// Little-endian wire representation, rejected if it does not fit an expedited transfer.
    pub fn to_expedited(&self) -> Result<ExpeditedData, SdoError> {
        match self {
            Self::UInt8(v) => ExpeditedData::new(&v.to_le_bytes()),
            Self::UInt16(v) => ExpeditedData::new(&v.to_le_bytes()),
            Self::UInt32(v) => ExpeditedData::new(&v.to_le_bytes()),
            Self::Int8(v) => ExpeditedData::new(&v.to_le_bytes()),
            Self::Int16(v) => ExpeditedData::new(&v.to_le_bytes()),
            Self::Int32(v) => ExpeditedData::new(&v.to_le_bytes()),
            Self::Real32(v) => ExpeditedData::new(&v.to_le_bytes()),
            Self::String(v) => ExpeditedData::new(v.as_bytes()),
            Self::Bytes(v) => ExpeditedData::new(v),
        }
    }

    /// Parse a textual value (decimal, `0x` hex for integers) as `data_type`.
    pub fn parse_as(data_type: SdoDataType, text: &str) -> Result<Self, SdoError> {
        let text = text.trim();
        let parse_err = |_| SdoError::ParseError(format!("'{}' is not a valid {:?}", text, data_type));
        match data_type {
            SdoDataType::UInt8 => parse_unsigned(text).and_then(|v| u8::try_from(v).map_err(parse_err)).map(Self::UInt8),
            SdoDataType::UInt16 => parse_unsigned(text).and_then(|v| u16::try_from(v).map_err(parse_err)).map(Self::UInt16),
            SdoDataType::UInt32 => parse_unsigned(text).and_then(|v| u32::try_from(v).map_err(parse_err)).map(Self::UInt32),
            SdoDataType::Int8 => text.parse::<i8>().map(Self::Int8).map_err(|e| SdoError::ParseError(e.to_string())),
            SdoDataType::Int16 => text.parse::<i16>().map(Self::Int16).map_err(|e| SdoError::ParseError(e.to_string())),
            SdoDataType::Int32 => text.parse::<i32>().map(Self::Int32).map_err(|e| SdoError::ParseError(e.to_string())),
            SdoDataType::Real32 => {
                let value = text.parse::<f32>().map_err(|e| SdoError::ParseError(e.to_string()))?;
                if !value.is_finite() {
                    return Err(SdoError::ParseError(format!("'{}' does not fit a float32", text)));
                }
                Ok(Self::Real32(value))
            }
            SdoDataType::VisibleString => Ok(Self::String(text.to_string())),
            SdoDataType::OctetString => parse_hex_bytes(text).map(Self::Bytes),
        }
    }
}

impl fmt::Display for SdoValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UInt8(v) => write!(f, "{}", v),
            Self::UInt16(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::Int8(v) => write!(f, "{}", v),
            Self::Int16(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::Real32(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
            Self::Bytes(v) => write!(f, "{:02X?}", v),
        }
    }
}

/// Custom error type for SDO payload handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoError {
    InvalidLength { max: usize, actual: usize },
    ParseError(String),
}

impl fmt::Display for SdoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength { max, actual } => {
                write!(f, "Payload of {} bytes exceeds the limit of {} bytes", actual, max)
            }
            Self::ParseError(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl Error for SdoError {}

fn parse_unsigned(text: &str) -> Result<u64, SdoError> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|e| SdoError::ParseError(format!("'{}': {}", text, e)))
}

/// Parse hex bytes such as `"2A 00 FF"` or `"2a00ff"`.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, SdoError> {
    let digits: Vec<u8> = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .map(|c| {
            c.to_digit(16)
                .map(|d| d as u8)
                .ok_or_else(|| SdoError::ParseError(format!("'{}': '{}' is not a hex digit", text, c)))
        })
        .collect::<Result<_, _>>()?;
    if digits.len() % 2 != 0 {
        return Err(SdoError::ParseError(format!("'{}' has an odd number of hex digits", text)));
    }
    Ok(digits.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect())
}

/// Parse payload data based on expected type
pub fn parse_payload(payload: &[u8], data_type: SdoDataType) -> Result<SdoValue, SdoError> {
    if let Some(size) = data_type.size() {
        if payload.len() < size {
            return Err(SdoError::ParseError(format!(
                "Insufficient data for {:?}: got {} bytes",
                data_type,
                payload.len()
            )));
        }
    }

    let value = match data_type {
        SdoDataType::UInt8 => SdoValue::UInt8(payload[0]),
        SdoDataType::UInt16 => SdoValue::UInt16(u16::from_le_bytes([payload[0], payload[1]])),
        SdoDataType::UInt32 => {
            SdoValue::UInt32(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
        }
        SdoDataType::Int8 => SdoValue::Int8(payload[0] as i8),
        SdoDataType::Int16 => SdoValue::Int16(i16::from_le_bytes([payload[0], payload[1]])),
        SdoDataType::Int32 => {
            SdoValue::Int32(i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
        }
        SdoDataType::Real32 => {
            SdoValue::Real32(f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
        }
        SdoDataType::VisibleString => {
            SdoValue::String(String::from_utf8_lossy(payload).trim_end_matches('\0').to_string())
        }
        SdoDataType::OctetString => SdoValue::Bytes(payload.to_vec()),
    };
    Ok(value)
}

/// Get human-readable description of SDO abort codes
pub fn get_abort_code_description(code: u32) -> String {
    match code {
        0x05030000 => "Toggle bit not alternated".to_string(),
        0x05040000 => "SDO protocol timed out".to_string(),
        0x05040001 => "Client/server command specifier not valid or unknown".to_string(),
        0x05040005 => "Out of memory".to_string(),
        0x06010000 => "Unsupported access to an object".to_string(),
        0x06010001 => "Attempt to read a write only object".to_string(),
        0x06010002 => "Attempt to write a read only object".to_string(),
        0x06020000 => "Object does not exist in the object dictionary".to_string(),
        0x06040041 => "Object cannot be mapped to the PDO".to_string(),
        0x06040042 => "The number and length of the objects to be mapped would exceed PDO length".to_string(),
        0x06040043 => "General parameter incompatibility reason".to_string(),
        0x06040047 => "General internal incompatibility in the device".to_string(),
        0x06060000 => "Access failed due to a hardware error".to_string(),
        0x06070010 => "Data type does not match, length of service parameter does not match".to_string(),
        0x06070012 => "Data type does not match, length of service parameter too high".to_string(),
        0x06070013 => "Data type does not match, length of service parameter too low".to_string(),
        0x06090011 => "Sub-index does not exist".to_string(),
        0x06090030 => "Value range of parameter exceeded (only for write access)".to_string(),
        0x06090031 => "Value of parameter written too high".to_string(),
        0x06090032 => "Value of parameter written too low".to_string(),
        0x06090036 => "Maximum value is less than minimum value".to_string(),
        0x08000000 => "General error".to_string(),
        0x08000020 => "Data cannot be transferred or stored to the application".to_string(),
        0x08000021 => "Data cannot be transferred or stored to the application because of local control".to_string(),
        0x08000022 => "Data cannot be transferred or stored to the application because of the present device state".to_string(),
        _ => format!("Unknown abort code: 0x{:08X}", code),
    }
}

// emergency.rs - EMCY frame decoding
use std::fmt;

use crate::frame::{encode_raw, Frame, PdoData, COB_EMERGENCY, ERROR_COB_RANGE};

/// Emergency error code classes (high byte of the error code).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EmergencyErrorClass {
    NoError,
    Generic,
    Current,
    Voltage,
    Temperature,
    Hardware,
    Software,
    AdditionalModules,
    Monitoring,
    External,
    AdditionalFunctions,
    DeviceSpecific,
    Unknown,
}

impl EmergencyErrorClass {
    pub fn from_code(code: u16) -> Self {
        match code >> 8 {
            0x00 => Self::NoError,
            0x10 => Self::Generic,
            0x20..=0x2F => Self::Current,
            0x30..=0x3F => Self::Voltage,
            0x40..=0x4F => Self::Temperature,
            0x50 => Self::Hardware,
            0x60..=0x6F => Self::Software,
            0x70 => Self::AdditionalModules,
            0x80..=0x8F => Self::Monitoring,
            0x90 => Self::External,
            0xF0 => Self::AdditionalFunctions,
            0xFF => Self::DeviceSpecific,
            _ => Self::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::NoError => "Error reset or no error",
            Self::Generic => "Generic error",
            Self::Current => "Current",
            Self::Voltage => "Voltage",
            Self::Temperature => "Temperature",
            Self::Hardware => "Device hardware",
            Self::Software => "Device software",
            Self::AdditionalModules => "Additional modules",
            Self::Monitoring => "Monitoring",
            Self::External => "External error",
            Self::AdditionalFunctions => "Additional functions",
            Self::DeviceSpecific => "Device specific",
            Self::Unknown => "Unknown error class",
        }
    }
}

/// Bits of the error register (object 0x1001).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorRegister {
    GenericError,
    Current,
    Voltage,
    Temperature,
    CommunicationError,
    DeviceProfileSpecific,
    Reserved,
    ManufacturerSpecific,
}

impl ErrorRegister {
    pub const ALL: [ErrorRegister; 8] = [
        ErrorRegister::GenericError,
        ErrorRegister::Current,
        ErrorRegister::Voltage,
        ErrorRegister::Temperature,
        ErrorRegister::CommunicationError,
        ErrorRegister::DeviceProfileSpecific,
        ErrorRegister::Reserved,
        ErrorRegister::ManufacturerSpecific,
    ];

    pub fn bit(&self) -> u8 {
        match *self {
            ErrorRegister::GenericError => 0,
            ErrorRegister::Current => 1,
            ErrorRegister::Voltage => 2,
            ErrorRegister::Temperature => 3,
            ErrorRegister::CommunicationError => 4,
            ErrorRegister::DeviceProfileSpecific => 5,
            ErrorRegister::Reserved => 6,
            ErrorRegister::ManufacturerSpecific => 7,
        }
    }

    pub fn mask(&self) -> u8 {
        1 << self.bit()
    }
}

/// A decoded emergency (EMCY) frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyMessage {
    pub node_id: u8,
    pub error_code: u16,
    pub error_register: u8,
    pub manufacturer_data: [u8; 5],
}

impl EmergencyMessage {
    /// Decode an EMCY payload; `None` outside the error COB-ID range.
    pub fn parse(cob_id: u16, payload: &[u8; 8]) -> Option<Self> {
        if !ERROR_COB_RANGE.contains(&cob_id) {
            return None;
        }
        let mut manufacturer_data = [0u8; 5];
        manufacturer_data.copy_from_slice(&payload[3..8]);
        Some(Self {
            node_id: (cob_id - COB_EMERGENCY) as u8,
            error_code: u16::from_le_bytes([payload[0], payload[1]]),
            error_register: payload[2],
            manufacturer_data,
        })
    }

    pub fn class(&self) -> EmergencyErrorClass {
        EmergencyErrorClass::from_code(self.error_code)
    }

    /// Error register bits that are set.
    pub fn active_registers(&self) -> Vec<ErrorRegister> {
        ErrorRegister::ALL
            .into_iter()
            .filter(|r| (self.error_register & r.mask()) != 0)
            .collect()
    }

    pub fn is_reset(&self) -> bool {
        self.error_code == 0
    }

    /// Frame as a node would transmit it.
    pub fn to_frame(&self) -> Frame {
        let [low, high] = self.error_code.to_le_bytes();
        let mut payload = [0u8; 8];
        payload[..3].copy_from_slice(&[low, high, self.error_register]);
        payload[3..].copy_from_slice(&self.manufacturer_data);
        let data = PdoData::new(&payload).unwrap_or_default();
        encode_raw(COB_EMERGENCY + self.node_id as u16, &data)
    }
}

impl fmt::Display for EmergencyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EMCY node 0x{:02X}: 0x{:04X} ({}), register 0x{:02X}",
            self.node_id,
            self.error_code,
            self.class().description(),
            self.error_register
        )
    }
}

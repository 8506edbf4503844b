//! Object Dictionary for the mock CANopen node
//!
//! This module defines the simulated object dictionary with test data.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use canopen_common::{SdoDataType, SdoValue};
use rand::Rng;
use serde::Deserialize;

/// SDO abort codes the mock node answers with
pub mod abort {
    pub const COMMAND_SPECIFIER_INVALID: u32 = 0x0504_0001;
    pub const WRITE_READ_ONLY: u32 = 0x0601_0002;
    pub const OBJECT_NOT_FOUND: u32 = 0x0602_0000;
    pub const LENGTH_MISMATCH: u32 = 0x0607_0010;
}

/// Represents a single entry in the object dictionary
pub enum ObjectEntry {
    /// Stored value; `writable` entries accept SDO downloads
    Static {
        data: Vec<u8>,
        data_type: SdoDataType,
        writable: bool,
    },
    /// Dynamic value generated on each read
    Dynamic(Box<dyn Fn() -> Vec<u8> + Send + Sync>, SdoDataType),
}

/// Object dictionary mapping (index, subindex) to values
#[derive(Default)]
pub struct ObjectDictionary {
    entries: HashMap<(u16, u8), ObjectEntry>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a read-only entry
    pub fn add_static(&mut self, index: u16, subindex: u8, data: Vec<u8>, data_type: SdoDataType) {
        self.entries.insert(
            (index, subindex),
            ObjectEntry::Static { data, data_type, writable: false },
        );
    }

    /// Add an entry that SDO downloads may overwrite
    pub fn add_writable(&mut self, index: u16, subindex: u8, data: Vec<u8>, data_type: SdoDataType) {
        self.entries.insert(
            (index, subindex),
            ObjectEntry::Static { data, data_type, writable: true },
        );
    }

    /// Add a dynamic entry (value generated on each read)
    pub fn add_dynamic<F>(&mut self, index: u16, subindex: u8, generator: F, data_type: SdoDataType)
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        self.entries.insert(
            (index, subindex),
            ObjectEntry::Dynamic(Box::new(generator), data_type),
        );
    }

    /// Get an entry from the dictionary
    pub fn get(&self, index: u16, subindex: u8) -> Option<(Vec<u8>, SdoDataType)> {
        self.entries.get(&(index, subindex)).map(|entry| match entry {
            ObjectEntry::Static { data, data_type, .. } => (data.clone(), *data_type),
            ObjectEntry::Dynamic(generator, data_type) => (generator(), *data_type),
        })
    }

    /// Store downloaded bytes, or return the abort code to answer with.
    pub fn write(&mut self, index: u16, subindex: u8, bytes: &[u8]) -> Result<(), u32> {
        match self.entries.get_mut(&(index, subindex)) {
            None => Err(abort::OBJECT_NOT_FOUND),
            Some(ObjectEntry::Dynamic(..)) => Err(abort::WRITE_READ_ONLY),
            Some(ObjectEntry::Static { writable: false, .. }) => Err(abort::WRITE_READ_ONLY),
            Some(ObjectEntry::Static { data, data_type, .. }) => {
                if let Some(size) = data_type.size() {
                    if bytes.len() != size {
                        return Err(abort::LENGTH_MISMATCH);
                    }
                }
                *data = bytes.to_vec();
                Ok(())
            }
        }
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One line per object, sorted by address
    pub fn summary(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.entries.keys().copied().collect();
        addresses.sort();

        addresses
            .into_iter()
            .map(|(index, subindex)| {
                let entry_type = match &self.entries[&(index, subindex)] {
                    ObjectEntry::Static { data_type, writable: true, .. } => format!("Writable {:?}", data_type),
                    ObjectEntry::Static { data_type, .. } => format!("Static {:?}", data_type),
                    ObjectEntry::Dynamic(_, data_type) => format!("Dynamic {:?}", data_type),
                };
                format!("0x{:04X}:{:02X} - {}", index, subindex, entry_type)
            })
            .collect()
    }

    /// Add entries parsed from a TOML object file, replacing existing ones.
    pub fn add_entries(&mut self, entries: Vec<EntrySpec>) -> Result<(), DictionaryError> {
        for entry in entries {
            let data_type: SdoDataType = entry.data_type.parse().map_err(|e| DictionaryError::Entry {
                index: entry.index,
                subindex: entry.subindex,
                reason: format!("{}", e),
            })?;
            let data = SdoValue::parse_as(data_type, &entry.value)
                .and_then(|value| value.to_expedited())
                .map_err(|e| DictionaryError::Entry {
                    index: entry.index,
                    subindex: entry.subindex,
                    reason: e.to_string(),
                })?;

            if entry.writable {
                self.add_writable(entry.index, entry.subindex, data.as_slice().to_vec(), data_type);
            } else {
                self.add_static(entry.index, entry.subindex, data.as_slice().to_vec(), data_type);
            }
        }
        Ok(())
    }

    /// Add standard test objects for demonstration
    pub fn add_test_objects_for_node(&mut self, node_id: u8) {
        // 0x1000:00 - Device Type (UInt32) - Static
        self.add_static(0x1000, 0x00, 0x00000191u32.to_le_bytes().to_vec(), SdoDataType::UInt32);

        // 0x1001:00 - Error Register (UInt8) - Static
        self.add_static(0x1001, 0x00, vec![0x00], SdoDataType::UInt8);

        // 0x1008:00 - Device Name, truncated to what an expedited upload carries
        self.add_static(0x1008, 0x00, b"MOCK".to_vec(), SdoDataType::VisibleString);

        // 0x1017:00 - Producer heartbeat time in ms (UInt16)
        self.add_writable(0x1017, 0x00, 1000u16.to_le_bytes().to_vec(), SdoDataType::UInt16);

        // 0x1018:01 - Vendor ID (UInt32), 0x1018:02 - Product code carries the node id
        self.add_static(0x1018, 0x01, 0x00000001u32.to_le_bytes().to_vec(), SdoDataType::UInt32);
        self.add_static(0x1018, 0x02, (node_id as u32).to_le_bytes().to_vec(), SdoDataType::UInt32);

        // 0x2000:01 - Temperature Sensor (Real32) - Dynamic (simulated changing value)
        self.add_dynamic(
            0x2000,
            0x01,
            || {
                let mut rng = rand::rng();
                let temp: f32 = rng.random_range(20.0..30.0);
                temp.to_le_bytes().to_vec()
            },
            SdoDataType::Real32,
        );

        // 0x2001:01 - Counter (UInt32) - Dynamic (incrementing)
        let counter = Arc::new(AtomicU32::new(0));
        self.add_dynamic(
            0x2001,
            0x01,
            move || counter.fetch_add(1, Ordering::SeqCst).to_le_bytes().to_vec(),
            SdoDataType::UInt32,
        );

        // 0x2003:01 - Status Word (UInt16) - Static
        self.add_static(0x2003, 0x01, 0x0031u16.to_le_bytes().to_vec(), SdoDataType::UInt16);

        // 0x2003:02 - Control Word (UInt16) - Writable
        self.add_writable(0x2003, 0x02, 0x000Fu16.to_le_bytes().to_vec(), SdoDataType::UInt16);

        // 0x2100:01..03 - Setpoints written by the host
        self.add_writable(0x2100, 0x01, vec![0x00], SdoDataType::UInt8);
        self.add_writable(0x2100, 0x02, 0u32.to_le_bytes().to_vec(), SdoDataType::UInt32);
        self.add_writable(0x2100, 0x03, 0f32.to_le_bytes().to_vec(), SdoDataType::Real32);

        // 0x2004:01 - RPM (Int32) - Dynamic (simulated motor speed)
        self.add_dynamic(
            0x2004,
            0x01,
            || {
                let mut rng = rand::rng();
                let rpm: i32 = rng.random_range(1000..3000);
                rpm.to_le_bytes().to_vec()
            },
            SdoDataType::Int32,
        );
    }
}

/// One `[[object]]` table of an object file.
#[derive(Debug, Clone, Deserialize)]
pub struct EntrySpec {
    pub index: u16,
    pub subindex: u8,
    #[serde(rename = "type")]
    pub data_type: String,
    pub value: String,
    #[serde(default = "default_writable")]
    pub writable: bool,
}

fn default_writable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ObjectFile {
    #[serde(default, rename = "object")]
    objects: Vec<EntrySpec>,
}

/// Parse an object file such as
///
/// ```toml
/// [[object]]
/// index = 0x2200
/// subindex = 1
/// type = "u16"
/// value = "0x1234"
/// ```
pub fn parse_object_file(text: &str) -> Result<Vec<EntrySpec>, DictionaryError> {
    let file: ObjectFile = toml::from_str(text).map_err(|e| DictionaryError::Parse(e.to_string()))?;
    Ok(file.objects)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictionaryError {
    Parse(String),
    Entry { index: u16, subindex: u8, reason: String },
}

impl fmt::Display for DictionaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "Invalid object file: {}", msg),
            Self::Entry { index, subindex, reason } => {
                write!(f, "Invalid object 0x{:04X}:{:02X}: {}", index, subindex, reason)
            }
        }
    }
}

impl std::error::Error for DictionaryError {}

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use canopen_common::{EmergencyMessage, ErrorMessage, PdoMessage, SdoKind};
use chrono::Local;
use csv::Writer;
use log::{info, warn};

use crate::state::ConnectionState;

/// Something worth a row in the traffic recording.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    Pdo(PdoMessage),
    Error(ErrorMessage),
    SdoData {
        kind: SdoKind,
        node_id: u8,
        index: u16,
        subindex: u8,
        value: String,
    },
    SdoError {
        kind: SdoKind,
        node_id: u8,
        index: u16,
        subindex: u8,
        error: String,
    },
    Heartbeat(bool),
    ConnectionFailed(String),
    ConnectionStatus(ConnectionState),
}

#[derive(Default)]
struct RecorderState {
    writer: Option<Writer<File>>,
    path: Option<PathBuf>,
}

/// CSV traffic recorder, disabled until `enable` is called.
#[derive(Default)]
pub struct Recorder {
    state: Mutex<RecorderState>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a new recording file in `directory`
    pub fn enable(&self, directory: &Path) -> Result<PathBuf, csv::Error> {
        fs::create_dir_all(directory)?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S%.3f");
        let path = directory.join(format!("canopen_traffic_{}.csv", timestamp));

        let file = File::create(&path)?;
        let mut writer = Writer::from_writer(file);
        writer.write_record(["Timestamp", "Event Type", "Address", "Value", "Message"])?;
        writer.flush()?;

        let mut state = self.lock();
        state.writer = Some(writer);
        state.path = Some(path.clone());
        info!("Traffic recording enabled: {:?}", path);
        Ok(path)
    }

    /// Stop recording and close the file
    pub fn disable(&self) {
        let mut state = self.lock();
        if let Some(mut writer) = state.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush recording: {}", e);
            }
            info!("Traffic recording disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().writer.is_some()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    pub fn record(&self, event: RecordEvent) {
        let mut state = self.lock();
        let Some(writer) = state.writer.as_mut() else {
            return;
        };

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let (event_type, address, value, message) = describe(event);

        if let Err(e) = writer.write_record([timestamp.as_str(), event_type, address.as_str(), value.as_str(), message.as_str()]) {
            warn!("Failed to write recording entry: {}", e);
        }
        if let Err(e) = writer.flush() {
            warn!("Failed to flush recording: {}", e);
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

fn describe(event: RecordEvent) -> (&'static str, String, String, String) {
    match event {
        RecordEvent::Pdo(pdo) => ("PDO", format!("0x{:03X}", pdo.cob_id), hex(pdo.data()), String::new()),
        RecordEvent::Error(err) => {
            let message = EmergencyMessage::parse(err.cob_id, &err.payload)
                .map(|emcy| emcy.to_string())
                .unwrap_or_default();
            ("EMCY", format!("0x{:03X}", err.cob_id), hex(&err.payload), message)
        }
        RecordEvent::SdoData { kind, node_id, index, subindex, value } => (
            match kind {
                SdoKind::Write => "SDO_WRITE",
                SdoKind::Read => "SDO_READ",
            },
            format!("{:02X}/{:04X}:{:02X}", node_id, index, subindex),
            value,
            String::new(),
        ),
        RecordEvent::SdoError { kind, node_id, index, subindex, error } => (
            "SDO_ERROR",
            format!("{:02X}/{:04X}:{:02X}", node_id, index, subindex),
            kind.to_string(),
            error,
        ),
        RecordEvent::Heartbeat(enabled) => (
            "HEARTBEAT",
            String::new(),
            if enabled { "Started" } else { "Stopped" }.to_string(),
            String::new(),
        ),
        RecordEvent::ConnectionFailed(err) => ("CONNECTION_FAILED", String::new(), String::new(), err),
        RecordEvent::ConnectionStatus(state) => {
            ("CONNECTION_STATUS", String::new(), state.to_string(), String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_recorder_writes_nothing() {
        let recorder = Recorder::new();
        recorder.record(RecordEvent::Heartbeat(true));
        assert!(!recorder.is_enabled());
        assert!(recorder.path().is_none());
    }

    #[test]
    fn rows_follow_header() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new();
        let path = recorder.enable(dir.path()).unwrap();

        recorder.record(RecordEvent::SdoData {
            kind: SdoKind::Read,
            node_id: 0x02,
            index: 0x2000,
            subindex: 0x01,
            value: "42".into(),
        });
        recorder.record(RecordEvent::Error(ErrorMessage {
            cob_id: 0x82,
            payload: [0x10, 0x42, 0x08, 0, 0, 0, 0, 0],
        }));
        recorder.record(RecordEvent::ConnectionStatus(ConnectionState::Connected));
        recorder.disable();
        recorder.record(RecordEvent::Heartbeat(false));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[1], "Event Type");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][1], "SDO_READ");
        assert_eq!(&rows[0][2], "02/2000:01");
        assert_eq!(&rows[0][3], "42");
        assert_eq!(&rows[1][1], "EMCY");
        assert!(rows[1][4].contains("Temperature"));
        assert_eq!(&rows[2][3], "Connected");
    }
}

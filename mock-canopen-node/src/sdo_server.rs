//! SDO Server answering expedited uploads and downloads

use canopen_common::frame::{COB_SDO_REQUEST, COB_SDO_RESPONSE};
use canopen_common::{decode_sdo_response, encode_sdo_response, Frame, SdoCommand, SdoDataType, EXPEDITED_MAX_LEN};
use log::{debug, info, warn};

use crate::object_dictionary::{abort, ObjectDictionary};

pub struct SdoServer {
    node_id: u8,
    object_dict: ObjectDictionary,
    request_cob_id: u16,  // 0x600 + node_id
    response_cob_id: u16, // 0x580 + node_id
}

impl SdoServer {
    pub fn new(node_id: u8, object_dict: ObjectDictionary) -> Self {
        Self {
            node_id,
            object_dict,
            request_cob_id: COB_SDO_REQUEST + node_id as u16,
            response_cob_id: COB_SDO_RESPONSE + node_id as u16,
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn dictionary(&self) -> &ObjectDictionary {
        &self.object_dict
    }

    /// Returns Some(response) if this was an SDO request for us
    pub fn handle_frame(&mut self, frame: &Frame) -> Option<Frame> {
        if frame.cob_id() != self.request_cob_id {
            return None;
        }

        let command = frame.command();
        let index = frame.index();
        let subindex = frame.subindex();

        if command == SdoCommand::InitiateUploadRequest as u8 {
            debug!("SDO upload request 0x{:04X}:{:02X}", index, subindex);
            Some(self.upload(index, subindex))
        } else if SdoCommand::is_download_request(command) {
            let payload = decode_sdo_response(frame);
            debug!("SDO download request 0x{:04X}:{:02X} {:02X?}", index, subindex, payload.value());
            Some(self.download(index, subindex, payload.value()))
        } else {
            warn!("Unsupported SDO command 0x{:02X}", command);
            Some(self.abort(index, subindex, abort::COMMAND_SPECIFIER_INVALID))
        }
    }

    fn upload(&self, index: u16, subindex: u8) -> Frame {
        match self.object_dict.get(index, subindex) {
            Some((data, data_type)) if data.len() <= EXPEDITED_MAX_LEN => {
                info!("SDO upload 0x{:04X}:{:02X} = {}", index, subindex, format_data(&data, &data_type));
                let mut bytes = [0u8; EXPEDITED_MAX_LEN];
                bytes[..data.len()].copy_from_slice(&data);
                encode_sdo_response(
                    self.response_cob_id,
                    SdoCommand::upload_response(data.len()),
                    index,
                    subindex,
                    bytes,
                )
            }
            // Segmented transfer is not simulated
            Some(_) => self.abort(index, subindex, abort::COMMAND_SPECIFIER_INVALID),
            None => {
                warn!("Object not found: 0x{:04X}:{:02X}", index, subindex);
                self.abort(index, subindex, abort::OBJECT_NOT_FOUND)
            }
        }
    }

    fn download(&mut self, index: u16, subindex: u8, data: &[u8]) -> Frame {
        match self.object_dict.write(index, subindex, data) {
            Ok(()) => {
                info!("SDO download 0x{:04X}:{:02X} <- {:02X?}", index, subindex, data);
                encode_sdo_response(
                    self.response_cob_id,
                    SdoCommand::DownloadResponse as u8,
                    index,
                    subindex,
                    [0; EXPEDITED_MAX_LEN],
                )
            }
            Err(code) => {
                warn!("SDO download 0x{:04X}:{:02X} rejected: 0x{:08X}", index, subindex, code);
                self.abort(index, subindex, code)
            }
        }
    }

    fn abort(&self, index: u16, subindex: u8, code: u32) -> Frame {
        encode_sdo_response(
            self.response_cob_id,
            SdoCommand::AbortTransfer as u8,
            index,
            subindex,
            code.to_le_bytes(),
        )
    }
}

/// Format data for display based on its type
fn format_data(data: &[u8], data_type: &SdoDataType) -> String {
    match canopen_common::parse_payload(data, *data_type) {
        Ok(value) => value.to_string(),
        Err(_) => format!("{:02X?}", data),
    }
}

//! The wire format: `len:u32 LE ‖ type:u32 LE ‖ body`, `len` covering
//! `type+body`. One variant per stable tag number (spec §4.1).
//!
//! Grounded on `original_source/framework/messages.py`: that module
//! factors the file-record layout into a single `FileMessage` reused by
//! both `FileListMessage` and `ShareFileMessage`; `FileRecord` here plays
//! the same role.

use crate::error::MalformedMessage;

pub const UNIQUE_ID_LEN: usize = 32;
/// Sentinel returned by the index when a client asks to be assigned an id.
pub const NO_CLIENT_ID: &str = "ffffffffffffffffffffffffffffffff";

fn malformed(reason: impl Into<String>) -> MalformedMessage {
    MalformedMessage(reason.into())
}

/// `{name, modification_time, size, file_id}` — shared by `FileList` and `ShareFile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub modification_time: u32,
    pub size: u32,
    pub file_id: String,
}

impl FileRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        let name_bytes = self.name.as_bytes();
        out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(name_bytes);
        out.extend_from_slice(&self.modification_time.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        debug_assert_eq!(self.file_id.len(), UNIQUE_ID_LEN);
        out.extend_from_slice(self.file_id.as_bytes());
    }

    fn decode(data: &[u8]) -> Result<(Self, usize), MalformedMessage> {
        let name_len = read_u32(data, 0)? as usize;
        let mut offset = 4;
        let name = read_utf8(data, offset, name_len)?;
        offset += name_len;
        let modification_time = read_u32(data, offset)?;
        offset += 4;
        let size = read_u32(data, offset)?;
        offset += 4;
        let file_id = read_utf8(data, offset, UNIQUE_ID_LEN)?;
        offset += UNIQUE_ID_LEN;
        Ok((
            FileRecord {
                name,
                modification_time,
                size,
                file_id,
            },
            offset,
        ))
    }
}

/// A sharing client as carried inside `SharingInfoResponse` (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharingEntry {
    pub client_id: String,
    pub ip: [u8; 4],
    pub port: Option<u16>,
}

impl SharingEntry {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.client_id.as_bytes());
        out.extend_from_slice(&self.ip);
        out.extend_from_slice(&self.port.unwrap_or(0).to_le_bytes());
    }

    fn decode(data: &[u8], offset: usize) -> Result<(Self, usize), MalformedMessage> {
        let client_id = read_utf8(data, offset, UNIQUE_ID_LEN)?;
        let mut o = offset + UNIQUE_ID_LEN;
        let ip = read_bytes4(data, o)?;
        o += 4;
        let port_raw = read_u16(data, o)?;
        o += 2;
        let port = if port_raw == 0 { None } else { Some(port_raw) };
        Ok((
            SharingEntry {
                client_id,
                ip,
                port,
            },
            o,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    GeneralSuccess(String),
    SearchFile(String),
    FileList(Vec<FileRecord>),
    FileRecord(FileRecord),
    ShareFile(FileRecord),
    ClientId(String),
    SharingInfoRequest { file_id: String },
    SharingInfoResponse {
        file_id: String,
        name: String,
        modification_time: u32,
        size: u32,
        entries: Vec<SharingEntry>,
    },
    StartFileTransfer { file_id: String, chunk_index: u32 },
    ChunkDataResponse {
        file_id: String,
        chunk_index: u32,
        data: Vec<u8>,
    },
    RemoveShare { file_id: String },
    SharePort { port: u16 },
    RTTCheck { send_epoch: u32 },
    RTTResponse { send_epoch: u32, recv_epoch: u32 },
    GeneralError(String),
}

/// Stable wire tag for each variant (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const GENERAL_SUCCESS: MessageType = MessageType(0);
    pub const SEARCH_FILE: MessageType = MessageType(1);
    pub const FILE_LIST: MessageType = MessageType(2);
    pub const FILE_RECORD: MessageType = MessageType(3);
    pub const SHARE_FILE: MessageType = MessageType(4);
    pub const CLIENT_ID: MessageType = MessageType(5);
    pub const SHARING_INFO_REQUEST: MessageType = MessageType(6);
    pub const SHARING_INFO_RESPONSE: MessageType = MessageType(7);
    pub const START_FILE_TRANSFER: MessageType = MessageType(8);
    pub const CHUNK_DATA_RESPONSE: MessageType = MessageType(9);
    pub const REMOVE_SHARE: MessageType = MessageType(10);
    pub const SHARE_PORT: MessageType = MessageType(11);
    pub const RTT_CHECK: MessageType = MessageType(12);
    pub const RTT_RESPONSE: MessageType = MessageType(13);
    pub const GENERAL_ERROR: MessageType = MessageType(999);
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::GeneralSuccess(_) => MessageType::GENERAL_SUCCESS,
            Message::SearchFile(_) => MessageType::SEARCH_FILE,
            Message::FileList(_) => MessageType::FILE_LIST,
            Message::FileRecord(_) => MessageType::FILE_RECORD,
            Message::ShareFile(_) => MessageType::SHARE_FILE,
            Message::ClientId(_) => MessageType::CLIENT_ID,
            Message::SharingInfoRequest { .. } => MessageType::SHARING_INFO_REQUEST,
            Message::SharingInfoResponse { .. } => MessageType::SHARING_INFO_RESPONSE,
            Message::StartFileTransfer { .. } => MessageType::START_FILE_TRANSFER,
            Message::ChunkDataResponse { .. } => MessageType::CHUNK_DATA_RESPONSE,
            Message::RemoveShare { .. } => MessageType::REMOVE_SHARE,
            Message::SharePort { .. } => MessageType::SHARE_PORT,
            Message::RTTCheck { .. } => MessageType::RTT_CHECK,
            Message::RTTResponse { .. } => MessageType::RTT_RESPONSE,
            Message::GeneralError(_) => MessageType::GENERAL_ERROR,
        }
    }

    /// The response type a requester should wait for, per spec §4.1.
    pub fn expected_response(&self) -> Option<MessageType> {
        match self {
            Message::SearchFile(_) => Some(MessageType::FILE_LIST),
            Message::SharingInfoRequest { .. } => Some(MessageType::SHARING_INFO_RESPONSE),
            Message::StartFileTransfer { .. } => Some(MessageType::CHUNK_DATA_RESPONSE),
            Message::RTTCheck { .. } => Some(MessageType::RTT_RESPONSE),
            _ => None,
        }
    }

    /// Serializes the full frame: `len ‖ type ‖ body`.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.encode_body(&mut body);
        let mut frame = Vec::with_capacity(8 + body.len());
        let covered_len = (4 + body.len()) as u32;
        frame.extend_from_slice(&covered_len.to_le_bytes());
        frame.extend_from_slice(&self.message_type().0.to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Message::GeneralSuccess(text) | Message::GeneralError(text) => {
                out.extend_from_slice(text.as_bytes());
            }
            Message::SearchFile(substr) => out.extend_from_slice(substr.as_bytes()),
            Message::FileList(files) => {
                out.extend_from_slice(&(files.len() as u32).to_le_bytes());
                for file in files {
                    file.encode(out);
                }
            }
            Message::FileRecord(record) | Message::ShareFile(record) => record.encode(out),
            Message::ClientId(id) => out.extend_from_slice(id.as_bytes()),
            Message::SharingInfoRequest { file_id } | Message::RemoveShare { file_id } => {
                out.extend_from_slice(file_id.as_bytes())
            }
            Message::SharingInfoResponse {
                file_id,
                name,
                modification_time,
                size,
                entries,
            } => {
                out.extend_from_slice(file_id.as_bytes());
                let name_bytes = name.as_bytes();
                out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(name_bytes);
                out.extend_from_slice(&modification_time.to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for entry in entries {
                    entry.encode(out);
                }
            }
            Message::StartFileTransfer {
                file_id,
                chunk_index,
            } => {
                out.extend_from_slice(file_id.as_bytes());
                out.extend_from_slice(&chunk_index.to_le_bytes());
            }
            Message::ChunkDataResponse {
                file_id,
                chunk_index,
                data,
            } => {
                out.extend_from_slice(file_id.as_bytes());
                out.extend_from_slice(&chunk_index.to_le_bytes());
                out.extend_from_slice(data);
            }
            Message::SharePort { port } => out.extend_from_slice(&port.to_le_bytes()),
            Message::RTTCheck { send_epoch } => out.extend_from_slice(&send_epoch.to_le_bytes()),
            Message::RTTResponse {
                send_epoch,
                recv_epoch,
            } => {
                out.extend_from_slice(&send_epoch.to_le_bytes());
                out.extend_from_slice(&recv_epoch.to_le_bytes());
            }
        }
    }

    /// Decodes a `type ‖ body` slice (the length prefix has already been
    /// stripped and validated by the caller, i.e. `Channel::recv`).
    pub fn decode(data: &[u8]) -> Result<Self, MalformedMessage> {
        if data.len() < 4 {
            return Err(malformed("frame shorter than the type tag"));
        }
        let tag = read_u32(data, 0)?;
        let body = &data[4..];
        match MessageType(tag) {
            MessageType::GENERAL_SUCCESS => Ok(Message::GeneralSuccess(decode_utf8(body)?)),
            MessageType::GENERAL_ERROR => Ok(Message::GeneralError(decode_utf8(body)?)),
            MessageType::SEARCH_FILE => Ok(Message::SearchFile(decode_utf8(body)?)),
            MessageType::FILE_LIST => {
                let count = read_u32(body, 0)? as usize;
                let mut offset = 4;
                let mut files = Vec::with_capacity(count);
                for _ in 0..count {
                    let (record, consumed) = FileRecord::decode(&body[offset..])?;
                    files.push(record);
                    offset += consumed;
                }
                Ok(Message::FileList(files))
            }
            MessageType::FILE_RECORD => {
                let (record, _) = FileRecord::decode(body)?;
                Ok(Message::FileRecord(record))
            }
            MessageType::SHARE_FILE => {
                let (record, _) = FileRecord::decode(body)?;
                Ok(Message::ShareFile(record))
            }
            MessageType::CLIENT_ID => Ok(Message::ClientId(read_utf8(body, 0, UNIQUE_ID_LEN)?)),
            MessageType::SHARING_INFO_REQUEST => Ok(Message::SharingInfoRequest {
                file_id: read_utf8(body, 0, UNIQUE_ID_LEN)?,
            }),
            MessageType::REMOVE_SHARE => Ok(Message::RemoveShare {
                file_id: read_utf8(body, 0, UNIQUE_ID_LEN)?,
            }),
            MessageType::SHARING_INFO_RESPONSE => {
                let file_id = read_utf8(body, 0, UNIQUE_ID_LEN)?;
                let mut offset = UNIQUE_ID_LEN;
                let name_len = read_u32(body, offset)? as usize;
                offset += 4;
                let name = read_utf8(body, offset, name_len)?;
                offset += name_len;
                let modification_time = read_u32(body, offset)?;
                offset += 4;
                let size = read_u32(body, offset)?;
                offset += 4;
                let count = read_u32(body, offset)? as usize;
                offset += 4;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let (entry, next) = SharingEntry::decode(body, offset)?;
                    entries.push(entry);
                    offset = next;
                }
                Ok(Message::SharingInfoResponse {
                    file_id,
                    name,
                    modification_time,
                    size,
                    entries,
                })
            }
            MessageType::START_FILE_TRANSFER => {
                let file_id = read_utf8(body, 0, UNIQUE_ID_LEN)?;
                let chunk_index = read_u32(body, UNIQUE_ID_LEN)?;
                Ok(Message::StartFileTransfer {
                    file_id,
                    chunk_index,
                })
            }
            MessageType::CHUNK_DATA_RESPONSE => {
                let file_id = read_utf8(body, 0, UNIQUE_ID_LEN)?;
                let chunk_index = read_u32(body, UNIQUE_ID_LEN)?;
                let data = body
                    .get(UNIQUE_ID_LEN + 4..)
                    .ok_or_else(|| malformed("chunk data truncated"))?
                    .to_vec();
                Ok(Message::ChunkDataResponse {
                    file_id,
                    chunk_index,
                    data,
                })
            }
            MessageType::SHARE_PORT => Ok(Message::SharePort {
                port: read_u16(body, 0)?,
            }),
            MessageType::RTT_CHECK => Ok(Message::RTTCheck {
                send_epoch: read_u32(body, 0)?,
            }),
            MessageType::RTT_RESPONSE => Ok(Message::RTTResponse {
                send_epoch: read_u32(body, 0)?,
                recv_epoch: read_u32(body, 4)?,
            }),
            MessageType(other) => Err(malformed(format!("unknown message tag {other}"))),
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, MalformedMessage> {
    let slice = data
        .get(offset..offset + 4)
        .ok_or_else(|| malformed("truncated u32"))?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, MalformedMessage> {
    let slice = data
        .get(offset..offset + 2)
        .ok_or_else(|| malformed("truncated u16"))?;
    Ok(u16::from_le_bytes(slice.try_into().unwrap()))
}

fn read_bytes4(data: &[u8], offset: usize) -> Result<[u8; 4], MalformedMessage> {
    let slice = data
        .get(offset..offset + 4)
        .ok_or_else(|| malformed("truncated ipv4 address"))?;
    Ok(slice.try_into().unwrap())
}

fn read_utf8(data: &[u8], offset: usize, len: usize) -> Result<String, MalformedMessage> {
    let slice = data
        .get(offset..offset + len)
        .ok_or_else(|| malformed("truncated utf-8 field"))?;
    String::from_utf8(slice.to_vec()).map_err(|_| malformed("invalid utf-8 field"))
}

fn decode_utf8(data: &[u8]) -> Result<String, MalformedMessage> {
    String::from_utf8(data.to_vec()).map_err(|_| malformed("invalid utf-8 body"))
}

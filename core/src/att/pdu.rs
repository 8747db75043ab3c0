// Attribute PDU codec — opcode byte followed by little-endian fields

use super::{AttErrorCode, *};

/// An attribute type identifier, 16-bit or 128-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttUuid {
    Short(u16),
    Long([u8; 16]),
}

impl AttUuid {
    pub fn encoded_len(&self) -> usize {
        match self {
            AttUuid::Short(_) => 2,
            AttUuid::Long(_) => 16,
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            AttUuid::Short(value) => buf.extend_from_slice(&value.to_le_bytes()),
            AttUuid::Long(bytes) => buf.extend_from_slice(bytes),
        }
    }
}

impl From<u16> for AttUuid {
    fn from(value: u16) -> Self {
        AttUuid::Short(value)
    }
}

/// One attribute-protocol PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    ErrorResponse {
        request_opcode: u8,
        handle: u16,
        code: AttErrorCode,
    },
    ExchangeMtuRequest {
        mtu: u16,
    },
    ExchangeMtuResponse {
        mtu: u16,
    },
    FindInformationRequest {
        starting_handle: u16,
        ending_handle: u16,
    },
    /// Entries in one response all share a type width
    FindInformationResponse {
        entries: Vec<(u16, AttUuid)>,
    },
    ReadRequest {
        handle: u16,
    },
    ReadResponse {
        value: Vec<u8>,
    },
    ReadBlobRequest {
        handle: u16,
        offset: u16,
    },
    ReadBlobResponse {
        value: Vec<u8>,
    },
    WriteRequest {
        handle: u16,
        value: Vec<u8>,
    },
    WriteResponse,
    WriteCommand {
        handle: u16,
        value: Vec<u8>,
    },
    Notification {
        handle: u16,
        value: Vec<u8>,
    },
    Indication {
        handle: u16,
        value: Vec<u8>,
    },
    Confirmation,
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

impl AttPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            AttPdu::ErrorResponse { .. } => OP_ERROR_RESPONSE,
            AttPdu::ExchangeMtuRequest { .. } => OP_EXCHANGE_MTU_REQUEST,
            AttPdu::ExchangeMtuResponse { .. } => OP_EXCHANGE_MTU_RESPONSE,
            AttPdu::FindInformationRequest { .. } => OP_FIND_INFORMATION_REQUEST,
            AttPdu::FindInformationResponse { .. } => OP_FIND_INFORMATION_RESPONSE,
            AttPdu::ReadRequest { .. } => OP_READ_REQUEST,
            AttPdu::ReadResponse { .. } => OP_READ_RESPONSE,
            AttPdu::ReadBlobRequest { .. } => OP_READ_BLOB_REQUEST,
            AttPdu::ReadBlobResponse { .. } => OP_READ_BLOB_RESPONSE,
            AttPdu::WriteRequest { .. } => OP_WRITE_REQUEST,
            AttPdu::WriteResponse => OP_WRITE_RESPONSE,
            AttPdu::WriteCommand { .. } => OP_WRITE_COMMAND,
            AttPdu::Notification { .. } => OP_NOTIFICATION,
            AttPdu::Indication { .. } => OP_INDICATION,
            AttPdu::Confirmation => OP_CONFIRMATION,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode()];
        match self {
            AttPdu::ErrorResponse {
                request_opcode,
                handle,
                code,
            } => {
                buf.push(*request_opcode);
                buf.extend_from_slice(&handle.to_le_bytes());
                buf.push(code.as_u8());
            }
            AttPdu::ExchangeMtuRequest { mtu } | AttPdu::ExchangeMtuResponse { mtu } => {
                buf.extend_from_slice(&mtu.to_le_bytes());
            }
            AttPdu::FindInformationRequest {
                starting_handle,
                ending_handle,
            } => {
                buf.extend_from_slice(&starting_handle.to_le_bytes());
                buf.extend_from_slice(&ending_handle.to_le_bytes());
            }
            AttPdu::FindInformationResponse { entries } => {
                let format = match entries.first() {
                    Some((_, AttUuid::Long(_))) => 2,
                    _ => 1,
                };
                buf.push(format);
                for (handle, uuid) in entries {
                    buf.extend_from_slice(&handle.to_le_bytes());
                    uuid.write_to(&mut buf);
                }
            }
            AttPdu::ReadRequest { handle } => {
                buf.extend_from_slice(&handle.to_le_bytes());
            }
            AttPdu::ReadResponse { value } | AttPdu::ReadBlobResponse { value } => {
                buf.extend_from_slice(value);
            }
            AttPdu::ReadBlobRequest { handle, offset } => {
                buf.extend_from_slice(&handle.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            AttPdu::WriteRequest { handle, value }
            | AttPdu::WriteCommand { handle, value }
            | AttPdu::Notification { handle, value }
            | AttPdu::Indication { handle, value } => {
                buf.extend_from_slice(&handle.to_le_bytes());
                buf.extend_from_slice(value);
            }
            AttPdu::WriteResponse | AttPdu::Confirmation => {}
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AttError> {
        let opcode = *data.first().ok_or(AttError::Malformed(0))?;
        let malformed = || AttError::Malformed(opcode);
        let body = &data[1..];

        let pdu = match opcode {
            OP_ERROR_RESPONSE => {
                if body.len() < 4 {
                    return Err(malformed());
                }
                AttPdu::ErrorResponse {
                    request_opcode: body[0],
                    handle: read_u16(body, 1),
                    code: AttErrorCode::from_u8(body[3]),
                }
            }
            OP_EXCHANGE_MTU_REQUEST | OP_EXCHANGE_MTU_RESPONSE => {
                if body.len() < 2 {
                    return Err(malformed());
                }
                let mtu = read_u16(body, 0);
                if opcode == OP_EXCHANGE_MTU_REQUEST {
                    AttPdu::ExchangeMtuRequest { mtu }
                } else {
                    AttPdu::ExchangeMtuResponse { mtu }
                }
            }
            OP_FIND_INFORMATION_REQUEST => {
                if body.len() < 4 {
                    return Err(malformed());
                }
                AttPdu::FindInformationRequest {
                    starting_handle: read_u16(body, 0),
                    ending_handle: read_u16(body, 2),
                }
            }
            OP_FIND_INFORMATION_RESPONSE => {
                if body.is_empty() {
                    return Err(malformed());
                }
                let uuid_len = match body[0] {
                    1 => 2,
                    2 => 16,
                    _ => return Err(malformed()),
                };
                let entry_len = 2 + uuid_len;
                let data = &body[1..];
                if data.is_empty() || data.len() % entry_len != 0 {
                    return Err(malformed());
                }
                let mut entries = Vec::with_capacity(data.len() / entry_len);
                for entry in data.chunks(entry_len) {
                    let handle = read_u16(entry, 0);
                    let uuid = if uuid_len == 2 {
                        AttUuid::Short(read_u16(entry, 2))
                    } else {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(&entry[2..18]);
                        AttUuid::Long(bytes)
                    };
                    entries.push((handle, uuid));
                }
                AttPdu::FindInformationResponse { entries }
            }
            OP_READ_REQUEST => {
                if body.len() < 2 {
                    return Err(malformed());
                }
                AttPdu::ReadRequest {
                    handle: read_u16(body, 0),
                }
            }
            OP_READ_RESPONSE => AttPdu::ReadResponse {
                value: body.to_vec(),
            },
            OP_READ_BLOB_REQUEST => {
                if body.len() < 4 {
                    return Err(malformed());
                }
                AttPdu::ReadBlobRequest {
                    handle: read_u16(body, 0),
                    offset: read_u16(body, 2),
                }
            }
            OP_READ_BLOB_RESPONSE => AttPdu::ReadBlobResponse {
                value: body.to_vec(),
            },
            OP_WRITE_REQUEST | OP_WRITE_COMMAND | OP_NOTIFICATION | OP_INDICATION => {
                if body.len() < 2 {
                    return Err(malformed());
                }
                let handle = read_u16(body, 0);
                let value = body[2..].to_vec();
                match opcode {
                    OP_WRITE_REQUEST => AttPdu::WriteRequest { handle, value },
                    OP_WRITE_COMMAND => AttPdu::WriteCommand { handle, value },
                    OP_NOTIFICATION => AttPdu::Notification { handle, value },
                    _ => AttPdu::Indication { handle, value },
                }
            }
            OP_WRITE_RESPONSE => AttPdu::WriteResponse,
            OP_CONFIRMATION => AttPdu::Confirmation,
            _ => return Err(malformed()),
        };
        Ok(pdu)
    }
}

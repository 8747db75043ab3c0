// Signaling channel codec — control frames with code, identifier, and
// little-endian length

use super::L2capError;

// Control-frame codes
pub const CODE_COMMAND_REJECT: u8 = 0x01;
pub const CODE_DISCONNECTION_REQUEST: u8 = 0x06;
pub const CODE_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const CODE_ECHO_REQUEST: u8 = 0x08;
pub const CODE_ECHO_RESPONSE: u8 = 0x09;
pub const CODE_CREDIT_CONNECTION_REQUEST: u8 = 0x14;
pub const CODE_CREDIT_CONNECTION_RESPONSE: u8 = 0x15;
pub const CODE_FLOW_CONTROL_CREDIT: u8 = 0x16;

/// One control frame on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    CommandReject {
        reason: u16,
        data: Vec<u8>,
    },
    DisconnectionRequest {
        destination_cid: u16,
        source_cid: u16,
    },
    DisconnectionResponse {
        destination_cid: u16,
        source_cid: u16,
    },
    EchoRequest {
        data: Vec<u8>,
    },
    EchoResponse {
        data: Vec<u8>,
    },
    CreditConnectionRequest {
        psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },
    CreditConnectionResponse {
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },
    FlowControlCredit {
        cid: u16,
        credits: u16,
    },
}

impl ControlFrame {
    pub fn code(&self) -> u8 {
        match self {
            ControlFrame::CommandReject { .. } => CODE_COMMAND_REJECT,
            ControlFrame::DisconnectionRequest { .. } => CODE_DISCONNECTION_REQUEST,
            ControlFrame::DisconnectionResponse { .. } => CODE_DISCONNECTION_RESPONSE,
            ControlFrame::EchoRequest { .. } => CODE_ECHO_REQUEST,
            ControlFrame::EchoResponse { .. } => CODE_ECHO_RESPONSE,
            ControlFrame::CreditConnectionRequest { .. } => CODE_CREDIT_CONNECTION_REQUEST,
            ControlFrame::CreditConnectionResponse { .. } => CODE_CREDIT_CONNECTION_RESPONSE,
            ControlFrame::FlowControlCredit { .. } => CODE_FLOW_CONTROL_CREDIT,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ControlFrame::CommandReject { reason, data } => {
                buf.extend_from_slice(&reason.to_le_bytes());
                buf.extend_from_slice(data);
            }
            ControlFrame::DisconnectionRequest {
                destination_cid,
                source_cid,
            }
            | ControlFrame::DisconnectionResponse {
                destination_cid,
                source_cid,
            } => {
                buf.extend_from_slice(&destination_cid.to_le_bytes());
                buf.extend_from_slice(&source_cid.to_le_bytes());
            }
            ControlFrame::EchoRequest { data } | ControlFrame::EchoResponse { data } => {
                buf.extend_from_slice(data);
            }
            ControlFrame::CreditConnectionRequest {
                psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } => {
                for field in [psm, source_cid, mtu, mps, initial_credits] {
                    buf.extend_from_slice(&field.to_le_bytes());
                }
            }
            ControlFrame::CreditConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } => {
                for field in [destination_cid, mtu, mps, initial_credits, result] {
                    buf.extend_from_slice(&field.to_le_bytes());
                }
            }
            ControlFrame::FlowControlCredit { cid, credits } => {
                buf.extend_from_slice(&cid.to_le_bytes());
                buf.extend_from_slice(&credits.to_le_bytes());
            }
        }
        buf
    }
}

/// A control frame plus the identifier correlating requests to responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingPacket {
    pub identifier: u8,
    pub frame: ControlFrame,
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

impl SignalingPacket {
    pub fn new(identifier: u8, frame: ControlFrame) -> Self {
        Self { identifier, frame }
    }

    /// Serialize: `[code][identifier][length u16][payload]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.frame.payload();
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.push(self.frame.code());
        buf.push(self.identifier);
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decode one control frame from a signaling-channel PDU.
    ///
    /// Unknown codes and short payloads are `MalformedControlFrame`; the
    /// manager answers those with a CommandReject.
    pub fn from_bytes(data: &[u8]) -> Result<Self, L2capError> {
        if data.len() < 4 {
            return Err(L2capError::MalformedControlFrame { code: 0 });
        }
        let code = data[0];
        let identifier = data[1];
        let length = read_u16(data, 2) as usize;
        let malformed = || L2capError::MalformedControlFrame { code };
        if data.len() < 4 + length {
            return Err(malformed());
        }
        let payload = &data[4..4 + length];

        let frame = match code {
            CODE_COMMAND_REJECT => {
                if payload.len() < 2 {
                    return Err(malformed());
                }
                ControlFrame::CommandReject {
                    reason: read_u16(payload, 0),
                    data: payload[2..].to_vec(),
                }
            }
            CODE_DISCONNECTION_REQUEST | CODE_DISCONNECTION_RESPONSE => {
                if payload.len() < 4 {
                    return Err(malformed());
                }
                let destination_cid = read_u16(payload, 0);
                let source_cid = read_u16(payload, 2);
                if code == CODE_DISCONNECTION_REQUEST {
                    ControlFrame::DisconnectionRequest {
                        destination_cid,
                        source_cid,
                    }
                } else {
                    ControlFrame::DisconnectionResponse {
                        destination_cid,
                        source_cid,
                    }
                }
            }
            CODE_ECHO_REQUEST => ControlFrame::EchoRequest {
                data: payload.to_vec(),
            },
            CODE_ECHO_RESPONSE => ControlFrame::EchoResponse {
                data: payload.to_vec(),
            },
            CODE_CREDIT_CONNECTION_REQUEST => {
                if payload.len() < 10 {
                    return Err(malformed());
                }
                ControlFrame::CreditConnectionRequest {
                    psm: read_u16(payload, 0),
                    source_cid: read_u16(payload, 2),
                    mtu: read_u16(payload, 4),
                    mps: read_u16(payload, 6),
                    initial_credits: read_u16(payload, 8),
                }
            }
            CODE_CREDIT_CONNECTION_RESPONSE => {
                if payload.len() < 10 {
                    return Err(malformed());
                }
                ControlFrame::CreditConnectionResponse {
                    destination_cid: read_u16(payload, 0),
                    mtu: read_u16(payload, 2),
                    mps: read_u16(payload, 4),
                    initial_credits: read_u16(payload, 6),
                    result: read_u16(payload, 8),
                }
            }
            CODE_FLOW_CONTROL_CREDIT => {
                if payload.len() < 4 {
                    return Err(malformed());
                }
                ControlFrame::FlowControlCredit {
                    cid: read_u16(payload, 0),
                    credits: read_u16(payload, 2),
                }
            }
            _ => return Err(malformed()),
        };

        Ok(SignalingPacket { identifier, frame })
    }
}

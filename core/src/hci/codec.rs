// Packet framing — type byte + little-endian length, stateful across
// arbitrarily fragmented input

use super::{
    FrameError, HciError, EVT_COMMAND_COMPLETE, EVT_COMMAND_STATUS, EVT_CONNECTION_COMPLETE,
    EVT_DISCONNECTION_COMPLETE, EVT_ENCRYPTION_CHANGE,
};
use crate::types::{ConnectionHandle, PeerAddress, Role};
use tracing::warn;

/// Wire packet type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Host-to-controller command (0x01)
    Command = 0x01,
    /// Connection data, either direction (0x02)
    Data = 0x02,
    /// Controller-to-host event (0x04)
    Event = 0x04,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(PacketType::Command),
            0x02 => Ok(PacketType::Data),
            0x04 => Ok(PacketType::Event),
            other => Err(FrameError::InvalidPacketType(other)),
        }
    }
}

/// One framed unit on the controller transport.
///
/// Wire formats (all lengths little-endian):
/// - Command: `[0x01][opcode u16][param_len u8][params]`
/// - Data:    `[0x02][handle u16][data_len u16][payload]`
/// - Event:   `[0x04][event_code u8][payload_len u8][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Command {
        opcode: u16,
        params: Vec<u8>,
    },
    Data {
        handle: ConnectionHandle,
        payload: Vec<u8>,
    },
    Event {
        code: u8,
        payload: Vec<u8>,
    },
}

impl Packet {
    /// Serialize the packet to its wire framing.
    ///
    /// Payloads longer than the length field can carry are a caller bug; the
    /// layers above never produce them (the multiplexer fragments first).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::Command { opcode, params } => {
                debug_assert!(params.len() <= u8::MAX as usize);
                let mut buf = Vec::with_capacity(4 + params.len());
                buf.push(PacketType::Command as u8);
                buf.extend_from_slice(&opcode.to_le_bytes());
                buf.push(params.len() as u8);
                buf.extend_from_slice(params);
                buf
            }
            Packet::Data { handle, payload } => {
                debug_assert!(payload.len() <= u16::MAX as usize);
                let mut buf = Vec::with_capacity(5 + payload.len());
                buf.push(PacketType::Data as u8);
                buf.extend_from_slice(&handle.0.to_le_bytes());
                buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Packet::Event { code, payload } => {
                debug_assert!(payload.len() <= u8::MAX as usize);
                let mut buf = Vec::with_capacity(3 + payload.len());
                buf.push(PacketType::Event as u8);
                buf.push(*code);
                buf.push(payload.len() as u8);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }
}

/// Stateful frame decoder.
///
/// Feed it whatever chunks the transport delivers, then drain complete
/// packets with `next_packet`. Partial frames stay buffered across calls.
pub struct FrameCodec {
    buffer: Vec<u8>,
    /// Bytes of an oversized data frame still to be discarded
    skip_remaining: usize,
    /// Set after an unrecoverable framing error; every further call fails
    poisoned: Option<FrameError>,
    max_data_payload: usize,
}

impl FrameCodec {
    pub fn new(max_data_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            skip_remaining: 0,
            poisoned: None,
            max_data_payload,
        }
    }

    /// Append a chunk of raw transport bytes to the decode buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next complete packet, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed. An oversized data frame
    /// yields `Err(FrameTooLong)` once; subsequent calls skip the rest of
    /// that frame and resume at the next boundary. An unknown type byte
    /// poisons the codec — framing can't be recovered.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }

        // Finish discarding an oversized frame before looking for a boundary
        if self.skip_remaining > 0 {
            let n = self.skip_remaining.min(self.buffer.len());
            self.buffer.drain(..n);
            self.skip_remaining -= n;
            if self.skip_remaining > 0 {
                return Ok(None);
            }
        }

        if self.buffer.is_empty() {
            return Ok(None);
        }

        let packet_type = match PacketType::from_u8(self.buffer[0]) {
            Ok(t) => t,
            Err(err) => {
                warn!("unrecoverable framing error: {}", err);
                self.poisoned = Some(err.clone());
                return Err(err);
            }
        };

        match packet_type {
            PacketType::Command => {
                // [type][opcode u16][param_len u8][params]
                if self.buffer.len() < 4 {
                    return Ok(None);
                }
                let param_len = self.buffer[3] as usize;
                if self.buffer.len() < 4 + param_len {
                    return Ok(None);
                }
                let opcode = u16::from_le_bytes([self.buffer[1], self.buffer[2]]);
                let params = self.buffer[4..4 + param_len].to_vec();
                self.buffer.drain(..4 + param_len);
                Ok(Some(Packet::Command { opcode, params }))
            }
            PacketType::Data => {
                // [type][handle u16][data_len u16][payload]
                if self.buffer.len() < 5 {
                    return Ok(None);
                }
                let data_len =
                    u16::from_le_bytes([self.buffer[3], self.buffer[4]]) as usize;
                if data_len > self.max_data_payload {
                    // Drop the frame, keep the link: consume the header now
                    // and remember how much payload is left to discard.
                    let available = self.buffer.len() - 5;
                    let consumed = available.min(data_len);
                    self.buffer.drain(..5 + consumed);
                    self.skip_remaining = data_len - consumed;
                    return Err(FrameError::FrameTooLong {
                        got: data_len,
                        max: self.max_data_payload,
                    });
                }
                if self.buffer.len() < 5 + data_len {
                    return Ok(None);
                }
                let handle =
                    ConnectionHandle(u16::from_le_bytes([self.buffer[1], self.buffer[2]]));
                let payload = self.buffer[5..5 + data_len].to_vec();
                self.buffer.drain(..5 + data_len);
                Ok(Some(Packet::Data { handle, payload }))
            }
            PacketType::Event => {
                // [type][code u8][payload_len u8][payload]
                if self.buffer.len() < 3 {
                    return Ok(None);
                }
                let payload_len = self.buffer[2] as usize;
                if self.buffer.len() < 3 + payload_len {
                    return Ok(None);
                }
                let code = self.buffer[1];
                let payload = self.buffer[3..3 + payload_len].to_vec();
                self.buffer.drain(..3 + payload_len);
                Ok(Some(Packet::Event { code, payload }))
            }
        }
    }
}

/// A decoded controller event.
///
/// Events the stack doesn't interpret decode as `Unknown` and flow to
/// listeners untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectionComplete {
        status: u8,
        handle: ConnectionHandle,
        peer_address: PeerAddress,
        role: Role,
    },
    DisconnectionComplete {
        status: u8,
        handle: ConnectionHandle,
        reason: u8,
    },
    EncryptionChange {
        status: u8,
        handle: ConnectionHandle,
        enabled: bool,
    },
    CommandComplete {
        opcode: u16,
        status: u8,
        params: Vec<u8>,
    },
    CommandStatus {
        opcode: u16,
        status: u8,
    },
    Unknown {
        code: u8,
        payload: Vec<u8>,
    },
}

impl Event {
    /// The wire event code for this event.
    pub fn code(&self) -> u8 {
        match self {
            Event::ConnectionComplete { .. } => EVT_CONNECTION_COMPLETE,
            Event::DisconnectionComplete { .. } => EVT_DISCONNECTION_COMPLETE,
            Event::EncryptionChange { .. } => EVT_ENCRYPTION_CHANGE,
            Event::CommandComplete { .. } => EVT_COMMAND_COMPLETE,
            Event::CommandStatus { .. } => EVT_COMMAND_STATUS,
            Event::Unknown { code, .. } => *code,
        }
    }

    /// Parse an event payload. Known codes with short payloads are
    /// `MalformedEvent`; unknown codes are passed through.
    pub fn parse(code: u8, payload: &[u8]) -> Result<Event, HciError> {
        let short = |reason| HciError::MalformedEvent { code, reason };
        match code {
            EVT_CONNECTION_COMPLETE => {
                // status(1) handle(2) peer(6) role(1)
                if payload.len() < 10 {
                    return Err(short("connection complete needs 10 bytes"));
                }
                let mut addr = [0u8; 6];
                addr.copy_from_slice(&payload[3..9]);
                Ok(Event::ConnectionComplete {
                    status: payload[0],
                    handle: ConnectionHandle(u16::from_le_bytes([payload[1], payload[2]])),
                    peer_address: PeerAddress(addr),
                    role: Role::from_u8(payload[9]),
                })
            }
            EVT_DISCONNECTION_COMPLETE => {
                // status(1) handle(2) reason(1)
                if payload.len() < 4 {
                    return Err(short("disconnection complete needs 4 bytes"));
                }
                Ok(Event::DisconnectionComplete {
                    status: payload[0],
                    handle: ConnectionHandle(u16::from_le_bytes([payload[1], payload[2]])),
                    reason: payload[3],
                })
            }
            EVT_ENCRYPTION_CHANGE => {
                // status(1) handle(2) enabled(1)
                if payload.len() < 4 {
                    return Err(short("encryption change needs 4 bytes"));
                }
                Ok(Event::EncryptionChange {
                    status: payload[0],
                    handle: ConnectionHandle(u16::from_le_bytes([payload[1], payload[2]])),
                    enabled: payload[3] != 0,
                })
            }
            EVT_COMMAND_COMPLETE => {
                // opcode(2) status(1) return params(..)
                if payload.len() < 3 {
                    return Err(short("command complete needs 3 bytes"));
                }
                Ok(Event::CommandComplete {
                    opcode: u16::from_le_bytes([payload[0], payload[1]]),
                    status: payload[2],
                    params: payload[3..].to_vec(),
                })
            }
            EVT_COMMAND_STATUS => {
                // status(1) opcode(2)
                if payload.len() < 3 {
                    return Err(short("command status needs 3 bytes"));
                }
                Ok(Event::CommandStatus {
                    status: payload[0],
                    opcode: u16::from_le_bytes([payload[1], payload[2]]),
                })
            }
            _ => Ok(Event::Unknown {
                code,
                payload: payload.to_vec(),
            }),
        }
    }

    /// Serialize the event back to a wire packet. Used by virtual
    /// controllers; the host side only parses.
    pub fn to_packet(&self) -> Packet {
        match self {
            Event::ConnectionComplete {
                status,
                handle,
                peer_address,
                role,
            } => {
                let mut payload = Vec::with_capacity(10);
                payload.push(*status);
                payload.extend_from_slice(&handle.0.to_le_bytes());
                payload.extend_from_slice(peer_address.as_bytes());
                payload.push(role.as_u8());
                Packet::Event {
                    code: EVT_CONNECTION_COMPLETE,
                    payload,
                }
            }
            Event::DisconnectionComplete {
                status,
                handle,
                reason,
            } => {
                let mut payload = Vec::with_capacity(4);
                payload.push(*status);
                payload.extend_from_slice(&handle.0.to_le_bytes());
                payload.push(*reason);
                Packet::Event {
                    code: EVT_DISCONNECTION_COMPLETE,
                    payload,
                }
            }
            Event::EncryptionChange {
                status,
                handle,
                enabled,
            } => {
                let mut payload = Vec::with_capacity(4);
                payload.push(*status);
                payload.extend_from_slice(&handle.0.to_le_bytes());
                payload.push(u8::from(*enabled));
                Packet::Event {
                    code: EVT_ENCRYPTION_CHANGE,
                    payload,
                }
            }
            Event::CommandComplete {
                opcode,
                status,
                params,
            } => {
                let mut payload = Vec::with_capacity(3 + params.len());
                payload.extend_from_slice(&opcode.to_le_bytes());
                payload.push(*status);
                payload.extend_from_slice(params);
                Packet::Event {
                    code: EVT_COMMAND_COMPLETE,
                    payload,
                }
            }
            Event::CommandStatus { opcode, status } => {
                let mut payload = Vec::with_capacity(3);
                payload.push(*status);
                payload.extend_from_slice(&opcode.to_le_bytes());
                Packet::Event {
                    code: EVT_COMMAND_STATUS,
                    payload,
                }
            }
            Event::Unknown { code, payload } => Packet::Event {
                code: *code,
                payload: payload.clone(),
            },
        }
    }
}

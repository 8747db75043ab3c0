// Pairing PDU codec — one code byte, fixed-size fields

use super::{IoCapability, PairingFailedReason, SmpError, *};
use crate::types::PeerAddress;

/// Capabilities exchanged in a pairing request/response (6 bytes on the
/// wire: io, oob, auth_req, max key size, initiator keys, responder keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFeatures {
    pub io_capability: IoCapability,
    pub oob: bool,
    pub auth_req: u8,
    pub max_key_size: u8,
    pub initiator_keys: u8,
    pub responder_keys: u8,
}

impl PairingFeatures {
    pub fn bonding(&self) -> bool {
        self.auth_req & AUTH_REQ_BONDING != 0
    }

    pub fn mitm(&self) -> bool {
        self.auth_req & AUTH_REQ_MITM != 0
    }

    pub fn secure_connections(&self) -> bool {
        self.auth_req & AUTH_REQ_SECURE_CONNECTIONS != 0
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.io_capability.as_u8());
        buf.push(u8::from(self.oob));
        buf.push(self.auth_req);
        buf.push(self.max_key_size);
        buf.push(self.initiator_keys);
        buf.push(self.responder_keys);
    }

    fn parse(code: u8, body: &[u8]) -> Result<Self, SmpError> {
        if body.len() < 6 {
            return Err(SmpError::Malformed(code));
        }
        let io_capability = IoCapability::from_u8(body[0]).ok_or(SmpError::Malformed(code))?;
        Ok(Self {
            io_capability,
            oob: body[1] != 0,
            auth_req: body[2],
            max_key_size: body[3],
            initiator_keys: body[4],
            responder_keys: body[5],
        })
    }
}

/// One security-manager PDU on the fixed security channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm { value: [u8; 32] },
    PairingRandom { nonce: [u8; 32] },
    PairingFailed { reason: PairingFailedReason },
    EncryptionInformation { ltk: [u8; 16] },
    CentralIdentification { ediv: u16, rand: [u8; 8] },
    IdentityInformation { irk: [u8; 16] },
    IdentityAddressInformation { address: PeerAddress },
    SigningInformation { csrk: [u8; 16] },
    SecurityRequest { auth_req: u8 },
    PublicKey { key: [u8; 32] },
    DhKeyCheck { value: [u8; 32] },
}

fn take<const N: usize>(code: u8, body: &[u8]) -> Result<[u8; N], SmpError> {
    if body.len() < N {
        return Err(SmpError::Malformed(code));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&body[..N]);
    Ok(out)
}

impl SmpPdu {
    pub fn code(&self) -> u8 {
        match self {
            SmpPdu::PairingRequest(_) => OP_PAIRING_REQUEST,
            SmpPdu::PairingResponse(_) => OP_PAIRING_RESPONSE,
            SmpPdu::PairingConfirm { .. } => OP_PAIRING_CONFIRM,
            SmpPdu::PairingRandom { .. } => OP_PAIRING_RANDOM,
            SmpPdu::PairingFailed { .. } => OP_PAIRING_FAILED,
            SmpPdu::EncryptionInformation { .. } => OP_ENCRYPTION_INFORMATION,
            SmpPdu::CentralIdentification { .. } => OP_CENTRAL_IDENTIFICATION,
            SmpPdu::IdentityInformation { .. } => OP_IDENTITY_INFORMATION,
            SmpPdu::IdentityAddressInformation { .. } => OP_IDENTITY_ADDRESS_INFORMATION,
            SmpPdu::SigningInformation { .. } => OP_SIGNING_INFORMATION,
            SmpPdu::SecurityRequest { .. } => OP_SECURITY_REQUEST,
            SmpPdu::PublicKey { .. } => OP_PUBLIC_KEY,
            SmpPdu::DhKeyCheck { .. } => OP_DHKEY_CHECK,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.code()];
        match self {
            SmpPdu::PairingRequest(features) | SmpPdu::PairingResponse(features) => {
                features.write_to(&mut buf);
            }
            SmpPdu::PairingConfirm { value } | SmpPdu::DhKeyCheck { value } => {
                buf.extend_from_slice(value);
            }
            SmpPdu::PairingRandom { nonce } => buf.extend_from_slice(nonce),
            SmpPdu::PairingFailed { reason } => buf.push(reason.as_u8()),
            SmpPdu::EncryptionInformation { ltk } => buf.extend_from_slice(ltk),
            SmpPdu::CentralIdentification { ediv, rand } => {
                buf.extend_from_slice(&ediv.to_le_bytes());
                buf.extend_from_slice(rand);
            }
            SmpPdu::IdentityInformation { irk } => buf.extend_from_slice(irk),
            SmpPdu::IdentityAddressInformation { address } => {
                buf.push(0); // public address kind
                buf.extend_from_slice(address.as_bytes());
            }
            SmpPdu::SigningInformation { csrk } => buf.extend_from_slice(csrk),
            SmpPdu::SecurityRequest { auth_req } => buf.push(*auth_req),
            SmpPdu::PublicKey { key } => buf.extend_from_slice(key),
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SmpError> {
        let code = *data.first().ok_or(SmpError::Malformed(0))?;
        let body = &data[1..];
        let pdu = match code {
            OP_PAIRING_REQUEST => SmpPdu::PairingRequest(PairingFeatures::parse(code, body)?),
            OP_PAIRING_RESPONSE => SmpPdu::PairingResponse(PairingFeatures::parse(code, body)?),
            OP_PAIRING_CONFIRM => SmpPdu::PairingConfirm {
                value: take(code, body)?,
            },
            OP_PAIRING_RANDOM => SmpPdu::PairingRandom {
                nonce: take(code, body)?,
            },
            OP_PAIRING_FAILED => {
                if body.is_empty() {
                    return Err(SmpError::Malformed(code));
                }
                SmpPdu::PairingFailed {
                    reason: PairingFailedReason::from_u8(body[0]),
                }
            }
            OP_ENCRYPTION_INFORMATION => SmpPdu::EncryptionInformation {
                ltk: take(code, body)?,
            },
            OP_CENTRAL_IDENTIFICATION => {
                if body.len() < 10 {
                    return Err(SmpError::Malformed(code));
                }
                let mut rand = [0u8; 8];
                rand.copy_from_slice(&body[2..10]);
                SmpPdu::CentralIdentification {
                    ediv: u16::from_le_bytes([body[0], body[1]]),
                    rand,
                }
            }
            OP_IDENTITY_INFORMATION => SmpPdu::IdentityInformation {
                irk: take(code, body)?,
            },
            OP_IDENTITY_ADDRESS_INFORMATION => {
                if body.len() < 7 {
                    return Err(SmpError::Malformed(code));
                }
                let mut addr = [0u8; 6];
                addr.copy_from_slice(&body[1..7]);
                SmpPdu::IdentityAddressInformation {
                    address: PeerAddress(addr),
                }
            }
            OP_SIGNING_INFORMATION => SmpPdu::SigningInformation {
                csrk: take(code, body)?,
            },
            OP_SECURITY_REQUEST => {
                if body.is_empty() {
                    return Err(SmpError::Malformed(code));
                }
                SmpPdu::SecurityRequest { auth_req: body[0] }
            }
            OP_PUBLIC_KEY => SmpPdu::PublicKey {
                key: take(code, body)?,
            },
            OP_DHKEY_CHECK => SmpPdu::DhKeyCheck {
                value: take(code, body)?,
            },
            _ => return Err(SmpError::Malformed(code)),
        };
        Ok(pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> PairingFeatures {
        PairingFeatures {
            io_capability: IoCapability::NoInputNoOutput,
            oob: false,
            auth_req: AUTH_REQ_BONDING | AUTH_REQ_SECURE_CONNECTIONS,
            max_key_size: MAX_KEY_SIZE,
            initiator_keys: KEY_DIST_IDENTITY,
            responder_keys: KEY_DIST_IDENTITY | KEY_DIST_SIGNING,
        }
    }

    #[test]
    fn test_pdu_roundtrips() {
        let pdus = [
            SmpPdu::PairingRequest(features()),
            SmpPdu::PairingResponse(features()),
            SmpPdu::PairingConfirm { value: [0x11; 32] },
            SmpPdu::PairingRandom { nonce: [0x22; 32] },
            SmpPdu::PairingFailed {
                reason: PairingFailedReason::ConfirmValueFailed,
            },
            SmpPdu::EncryptionInformation { ltk: [0x33; 16] },
            SmpPdu::CentralIdentification {
                ediv: 0xBEEF,
                rand: [0x44; 8],
            },
            SmpPdu::IdentityInformation { irk: [0x55; 16] },
            SmpPdu::IdentityAddressInformation {
                address: PeerAddress([1, 2, 3, 4, 5, 6]),
            },
            SmpPdu::SigningInformation { csrk: [0x66; 16] },
            SmpPdu::SecurityRequest {
                auth_req: AUTH_REQ_BONDING,
            },
            SmpPdu::PublicKey { key: [0x77; 32] },
            SmpPdu::DhKeyCheck { value: [0x88; 32] },
        ];
        for pdu in pdus {
            let decoded = SmpPdu::from_bytes(&pdu.to_bytes()).unwrap();
            assert_eq!(decoded, pdu);
        }
    }

    #[test]
    fn test_feature_flags() {
        let features = features();
        assert!(features.bonding());
        assert!(!features.mitm());
        assert!(features.secure_connections());
    }

    #[test]
    fn test_short_pdu_rejected() {
        assert!(SmpPdu::from_bytes(&[OP_PAIRING_CONFIRM, 1, 2, 3]).is_err());
        assert!(SmpPdu::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_bad_io_capability_rejected() {
        let mut bytes = SmpPdu::PairingRequest(features()).to_bytes();
        bytes[1] = 0x09;
        assert!(SmpPdu::from_bytes(&bytes).is_err());
    }
}

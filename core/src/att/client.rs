//! Attribute client — serialized requests and typed failures
//!
//! Correlation is purely positional: one request out, one response back.
//! The request slot is a lock, so a second request issued while the first
//! is outstanding queues instead of colliding. Server-initiated
//! notifications and indications bypass the slot entirely.

use super::pdu::{AttPdu, AttUuid};
use super::{AttError, AttErrorCode, OP_FIND_INFORMATION_REQUEST};
use crate::config::ATT_MIN_MTU;
use crate::l2cap::channel::PduSender;
use crate::l2cap::CID_ATTRIBUTE;
use crate::types::ConnectionHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A value change pushed by the peer's server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeUpdate {
    pub conn: ConnectionHandle,
    pub handle: u16,
    pub value: Vec<u8>,
    /// True for an indication (which this client has already confirmed)
    pub indicated: bool,
}

/// Synchronous update delivery into the session registry's event bus.
pub type AttributeUpdateSink = Arc<dyn Fn(AttributeUpdate) + Send + Sync>;

struct PendingRequest {
    request_opcode: u8,
    reply: oneshot::Sender<Result<AttPdu, AttError>>,
}

/// Client side of the attribute channel for one connection.
pub struct AttributeClient {
    io: Arc<PduSender>,
    /// Effective MTU, shared with the server half of the bearer
    mtu: Arc<AtomicU16>,
    preferred_mtu: u16,
    request_timeout: Duration,
    /// Serializes requests: the protocol has no transaction identifier
    slot: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingRequest>>,
    closed: AtomicBool,
    updates: AttributeUpdateSink,
}

impl AttributeClient {
    pub fn new(
        io: Arc<PduSender>,
        mtu: Arc<AtomicU16>,
        preferred_mtu: u16,
        request_timeout: Duration,
        updates: AttributeUpdateSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            io,
            mtu,
            preferred_mtu,
            request_timeout,
            slot: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
            updates,
        })
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn response_matches(request_opcode: u8, response: &AttPdu) -> bool {
        use super::*;
        matches!(
            (request_opcode, response),
            (OP_EXCHANGE_MTU_REQUEST, AttPdu::ExchangeMtuResponse { .. })
                | (
                    OP_FIND_INFORMATION_REQUEST,
                    AttPdu::FindInformationResponse { .. }
                )
                | (OP_READ_REQUEST, AttPdu::ReadResponse { .. })
                | (OP_READ_BLOB_REQUEST, AttPdu::ReadBlobResponse { .. })
                | (OP_WRITE_REQUEST, AttPdu::WriteResponse)
        )
    }

    /// Issue one request and await its correlated response.
    pub async fn request(&self, pdu: AttPdu) -> Result<AttPdu, AttError> {
        let _guard = self.slot.lock().await;
        if self.closed.load(Ordering::Relaxed) {
            return Err(AttError::Closed);
        }

        let request_opcode = pdu.opcode();
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingRequest {
            request_opcode,
            reply: tx,
        });

        if let Err(err) = self.io.send_pdu(CID_ATTRIBUTE, &pdu.to_bytes()).await {
            self.pending.lock().take();
            return Err(err.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AttError::Closed),
            Err(_) => {
                self.pending.lock().take();
                Err(AttError::Timeout)
            }
        }
    }

    /// Handle one inbound response-side PDU.
    pub async fn on_pdu(&self, bytes: &[u8]) {
        let pdu = match AttPdu::from_bytes(bytes) {
            Ok(pdu) => pdu,
            Err(err) => {
                warn!("dropping malformed attribute PDU: {}", err);
                if let Some(pending) = self.pending.lock().take() {
                    let _ = pending
                        .reply
                        .send(Err(AttError::Malformed(bytes.first().copied().unwrap_or(0))));
                }
                return;
            }
        };

        match pdu {
            AttPdu::Notification { handle, value } => {
                (self.updates)(AttributeUpdate {
                    conn: self.io.conn,
                    handle,
                    value,
                    indicated: false,
                });
            }
            AttPdu::Indication { handle, value } => {
                (self.updates)(AttributeUpdate {
                    conn: self.io.conn,
                    handle,
                    value,
                    indicated: true,
                });
                // The server may not send another until this goes out
                if let Err(err) = self
                    .io
                    .send_pdu(CID_ATTRIBUTE, &AttPdu::Confirmation.to_bytes())
                    .await
                {
                    warn!("failed to confirm indication: {}", err);
                }
            }
            AttPdu::ErrorResponse {
                request_opcode,
                handle,
                code,
            } => match self.pending.lock().take() {
                Some(pending) => {
                    let _ = pending.reply.send(Err(AttError::Peer {
                        request: request_opcode,
                        handle,
                        code,
                    }));
                }
                None => warn!("error response with no request outstanding"),
            },
            response => match self.pending.lock().take() {
                Some(pending) => {
                    let result = if Self::response_matches(pending.request_opcode, &response) {
                        Ok(response)
                    } else {
                        warn!(
                            "response 0x{:02X} does not match request 0x{:02X}",
                            response.opcode(),
                            pending.request_opcode
                        );
                        Err(AttError::Malformed(response.opcode()))
                    };
                    let _ = pending.reply.send(result);
                }
                None => warn!(
                    "response 0x{:02X} with no request outstanding",
                    response.opcode()
                ),
            },
        }
    }

    /// Negotiate the attribute MTU; returns the effective value.
    pub async fn exchange_mtu(&self) -> Result<u16, AttError> {
        let response = self
            .request(AttPdu::ExchangeMtuRequest {
                mtu: self.preferred_mtu,
            })
            .await?;
        let AttPdu::ExchangeMtuResponse { mtu: server_rx } = response else {
            return Err(AttError::Malformed(response.opcode()));
        };
        let effective = self
            .preferred_mtu
            .min(server_rx.max(ATT_MIN_MTU))
            .max(ATT_MIN_MTU);
        self.mtu.store(effective, Ordering::Relaxed);
        debug!("attribute MTU now {}", effective);
        Ok(effective)
    }

    /// Enumerate every attribute in the handle range, paging until the
    /// server signals exhaustion.
    pub async fn discover(
        &self,
        starting_handle: u16,
        ending_handle: u16,
    ) -> Result<Vec<(u16, AttUuid)>, AttError> {
        let mut found = Vec::new();
        let mut next = starting_handle;
        loop {
            let response = self
                .request(AttPdu::FindInformationRequest {
                    starting_handle: next,
                    ending_handle,
                })
                .await;
            match response {
                Ok(AttPdu::FindInformationResponse { entries }) => {
                    let Some(&(last, _)) = entries.last() else {
                        break;
                    };
                    found.extend(entries);
                    if last >= ending_handle || last == u16::MAX {
                        break;
                    }
                    next = last + 1;
                }
                Err(AttError::Peer {
                    request: OP_FIND_INFORMATION_REQUEST,
                    code: AttErrorCode::AttributeNotFound,
                    ..
                }) => break,
                Ok(other) => return Err(AttError::Malformed(other.opcode())),
                Err(err) => return Err(err),
            }
        }
        Ok(found)
    }

    /// Read a value, bounded by one response (at most MTU-1 bytes).
    pub async fn read(&self, handle: u16) -> Result<Vec<u8>, AttError> {
        let response = self.request(AttPdu::ReadRequest { handle }).await?;
        match response {
            AttPdu::ReadResponse { value } => Ok(value),
            other => Err(AttError::Malformed(other.opcode())),
        }
    }

    /// Read a value of any length, continuing with offset reads while each
    /// returned fragment fills the MTU.
    pub async fn read_long(&self, handle: u16) -> Result<Vec<u8>, AttError> {
        let mut value = self.read(handle).await?;
        let fragment_len = self.mtu() as usize - 1;
        if value.len() < fragment_len {
            return Ok(value);
        }
        loop {
            let response = self
                .request(AttPdu::ReadBlobRequest {
                    handle,
                    offset: value.len() as u16,
                })
                .await?;
            let AttPdu::ReadBlobResponse { value: fragment } = response else {
                return Err(AttError::Malformed(response.opcode()));
            };
            let done = fragment.len() < fragment_len;
            value.extend_from_slice(&fragment);
            if done {
                return Ok(value);
            }
        }
    }

    /// Acknowledged write.
    pub async fn write(&self, handle: u16, value: &[u8]) -> Result<(), AttError> {
        let response = self
            .request(AttPdu::WriteRequest {
                handle,
                value: value.to_vec(),
            })
            .await?;
        match response {
            AttPdu::WriteResponse => Ok(()),
            other => Err(AttError::Malformed(other.opcode())),
        }
    }

    /// Unacknowledged write: no response, the caller does not block on the
    /// peer.
    pub async fn write_command(&self, handle: u16, value: &[u8]) -> Result<(), AttError> {
        self.io
            .send_pdu(
                CID_ATTRIBUTE,
                &AttPdu::WriteCommand {
                    handle,
                    value: value.to_vec(),
                }
                .to_bytes(),
            )
            .await?;
        Ok(())
    }

    /// Fail the outstanding request (if any) and refuse new ones.
    pub fn fail_pending(&self, error: AttError) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(pending) = self.pending.lock().take() {
            let _ = pending.reply.send(Err(error));
        }
    }
}

//! Attribute server — handle table and request handling
//!
//! One table serves every connection; per-connection state (negotiated MTU,
//! the single outstanding indication) lives in `ServerSession`. Handles are
//! assigned ascending and stay stable for the table's lifetime.

use super::pdu::{AttPdu, AttUuid};
use super::{AttError, AttErrorCode, OP_WRITE_COMMAND};
use crate::config::ATT_MIN_MTU;
use crate::l2cap::channel::PduSender;
use crate::l2cap::CID_ATTRIBUTE;
use crate::types::{LinkSecurity, SecurityLevel};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Who may do what with an attribute, and above which security level.
#[derive(Debug, Clone, Copy)]
pub struct AttributePermissions {
    pub read: bool,
    pub write: bool,
    pub min_security: SecurityLevel,
}

impl Default for AttributePermissions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            min_security: SecurityLevel::Open,
        }
    }
}

impl AttributePermissions {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            min_security: SecurityLevel::Open,
        }
    }

    pub fn with_security(mut self, level: SecurityLevel) -> Self {
        self.min_security = level;
        self
    }
}

/// One entry in the server's table.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub handle: u16,
    pub attr_type: AttUuid,
    pub value: Vec<u8>,
    pub permissions: AttributePermissions,
}

struct TableInner {
    attributes: BTreeMap<u16, Attribute>,
    next_handle: u16,
}

/// The local attribute table, shared by all connections.
pub struct AttributeServer {
    inner: Mutex<TableInner>,
}

impl AttributeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TableInner {
                attributes: BTreeMap::new(),
                next_handle: 1,
            }),
        })
    }

    /// Add an attribute, assigning the next ascending handle.
    pub fn add(
        &self,
        attr_type: impl Into<AttUuid>,
        value: Vec<u8>,
        permissions: AttributePermissions,
    ) -> u16 {
        let mut inner = self.inner.lock();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.attributes.insert(
            handle,
            Attribute {
                handle,
                attr_type: attr_type.into(),
                value,
                permissions,
            },
        );
        handle
    }

    /// Current value, as the application sees it.
    pub fn value(&self, handle: u16) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .attributes
            .get(&handle)
            .map(|attr| attr.value.clone())
    }

    /// Replace a value locally (no notification is sent by this).
    pub fn set_value(&self, handle: u16, value: Vec<u8>) -> bool {
        match self.inner.lock().attributes.get_mut(&handle) {
            Some(attr) => {
                attr.value = value;
                true
            }
            None => false,
        }
    }

    fn access_error(
        attr: &Attribute,
        write: bool,
        security: SecurityLevel,
    ) -> Option<AttErrorCode> {
        if write && !attr.permissions.write {
            return Some(AttErrorCode::WriteNotPermitted);
        }
        if !write && !attr.permissions.read {
            return Some(AttErrorCode::ReadNotPermitted);
        }
        if security < attr.permissions.min_security {
            return Some(match attr.permissions.min_security {
                SecurityLevel::Authenticated => AttErrorCode::InsufficientAuthentication,
                _ => AttErrorCode::InsufficientEncryption,
            });
        }
        None
    }

    /// Answer one client request. Always produces exactly one response PDU;
    /// write commands are handled separately because they never answer.
    pub fn handle_request(&self, request: &AttPdu, mtu: usize, security: SecurityLevel) -> AttPdu {
        let error = |request_opcode: u8, handle: u16, code: AttErrorCode| AttPdu::ErrorResponse {
            request_opcode,
            handle,
            code,
        };

        match request {
            AttPdu::FindInformationRequest {
                starting_handle,
                ending_handle,
            } => {
                let opcode = request.opcode();
                if *starting_handle == 0 || starting_handle > ending_handle {
                    return error(opcode, *starting_handle, AttErrorCode::InvalidHandle);
                }
                let inner = self.inner.lock();
                let mut entries: Vec<(u16, AttUuid)> = Vec::new();
                let mut used = 2; // opcode + format byte
                for (handle, attr) in inner.attributes.range(starting_handle..=ending_handle) {
                    let entry_len = 2 + attr.attr_type.encoded_len();
                    // Entries in one response share a type width
                    if let Some((_, first)) = entries.first() {
                        if first.encoded_len() != attr.attr_type.encoded_len() {
                            break;
                        }
                    }
                    if used + entry_len > mtu {
                        break;
                    }
                    entries.push((*handle, attr.attr_type));
                    used += entry_len;
                }
                if entries.is_empty() {
                    error(opcode, *starting_handle, AttErrorCode::AttributeNotFound)
                } else {
                    AttPdu::FindInformationResponse { entries }
                }
            }
            AttPdu::ReadRequest { handle } => {
                let opcode = request.opcode();
                let inner = self.inner.lock();
                match inner.attributes.get(handle) {
                    None => error(opcode, *handle, AttErrorCode::InvalidHandle),
                    Some(attr) => match Self::access_error(attr, false, security) {
                        Some(code) => error(opcode, *handle, code),
                        None => AttPdu::ReadResponse {
                            value: attr.value[..attr.value.len().min(mtu - 1)].to_vec(),
                        },
                    },
                }
            }
            AttPdu::ReadBlobRequest { handle, offset } => {
                let opcode = request.opcode();
                let inner = self.inner.lock();
                match inner.attributes.get(handle) {
                    None => error(opcode, *handle, AttErrorCode::InvalidHandle),
                    Some(attr) => match Self::access_error(attr, false, security) {
                        Some(code) => error(opcode, *handle, code),
                        None => {
                            let offset = *offset as usize;
                            if offset > attr.value.len() {
                                return error(opcode, *handle, AttErrorCode::InvalidOffset);
                            }
                            let end = attr.value.len().min(offset + mtu - 1);
                            AttPdu::ReadBlobResponse {
                                value: attr.value[offset..end].to_vec(),
                            }
                        }
                    },
                }
            }
            AttPdu::WriteRequest { handle, value } => {
                let opcode = request.opcode();
                let mut inner = self.inner.lock();
                match inner.attributes.get_mut(handle) {
                    None => error(opcode, *handle, AttErrorCode::InvalidHandle),
                    Some(attr) => match Self::access_error(attr, true, security) {
                        Some(code) => error(opcode, *handle, code),
                        None => {
                            attr.value = value.clone();
                            AttPdu::WriteResponse
                        }
                    },
                }
            }
            other => {
                debug!("unsupported attribute request 0x{:02X}", other.opcode());
                error(other.opcode(), 0, AttErrorCode::RequestNotSupported)
            }
        }
    }

    /// Apply a write command. No response either way; failures only log.
    pub fn handle_write_command(&self, handle: u16, value: &[u8], security: SecurityLevel) {
        let mut inner = self.inner.lock();
        match inner.attributes.get_mut(&handle) {
            Some(attr) => match Self::access_error(attr, true, security) {
                None => attr.value = value.to_vec(),
                Some(code) => {
                    debug!("write command to 0x{:04X} refused: {:?}", handle, code)
                }
            },
            None => debug!("write command to unknown handle 0x{:04X}", handle),
        }
    }
}

/// Per-connection server side of the attribute channel.
pub struct ServerSession {
    server: Arc<AttributeServer>,
    io: Arc<PduSender>,
    security: Arc<LinkSecurity>,
    /// Effective MTU, shared with the client half of the bearer
    mtu: Arc<AtomicU16>,
    preferred_mtu: u16,
    request_timeout: Duration,
    /// Serializes indications: at most one unacknowledged at a time
    indication_lock: tokio::sync::Mutex<()>,
    confirm_waiter: Mutex<Option<oneshot::Sender<()>>>,
}

impl ServerSession {
    pub fn new(
        server: Arc<AttributeServer>,
        io: Arc<PduSender>,
        security: Arc<LinkSecurity>,
        mtu: Arc<AtomicU16>,
        preferred_mtu: u16,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            io,
            security,
            mtu,
            preferred_mtu,
            request_timeout,
            indication_lock: tokio::sync::Mutex::new(()),
            confirm_waiter: Mutex::new(None),
        })
    }

    fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed) as usize
    }

    async fn send(&self, pdu: AttPdu) {
        if let Err(err) = self.io.send_pdu(CID_ATTRIBUTE, &pdu.to_bytes()).await {
            warn!("failed to send attribute PDU: {}", err);
        }
    }

    /// Handle one inbound request-side PDU.
    pub async fn on_pdu(&self, bytes: &[u8]) {
        match AttPdu::from_bytes(bytes) {
            Ok(AttPdu::ExchangeMtuRequest { mtu }) => {
                let client_rx = mtu.max(ATT_MIN_MTU);
                let effective = client_rx.min(self.preferred_mtu);
                self.send(AttPdu::ExchangeMtuResponse {
                    mtu: self.preferred_mtu,
                })
                .await;
                self.mtu.store(effective, Ordering::Relaxed);
                debug!("attribute MTU now {}", effective);
            }
            Ok(AttPdu::Confirmation) => {
                if let Some(waiter) = self.confirm_waiter.lock().take() {
                    let _ = waiter.send(());
                } else {
                    warn!("confirmation with no indication outstanding");
                }
            }
            Ok(AttPdu::WriteCommand { handle, value }) => {
                self.server
                    .handle_write_command(handle, &value, self.security.level());
            }
            Ok(request) => {
                let response =
                    self.server
                        .handle_request(&request, self.mtu(), self.security.level());
                self.send(response).await;
            }
            Err(AttError::Malformed(opcode)) => {
                warn!("malformed attribute request 0x{:02X}", opcode);
                if opcode != OP_WRITE_COMMAND {
                    self.send(AttPdu::ErrorResponse {
                        request_opcode: opcode,
                        handle: 0,
                        code: AttErrorCode::RequestNotSupported,
                    })
                    .await;
                }
            }
            Err(err) => warn!("attribute request dropped: {}", err),
        }
    }

    /// Fire-and-forget value change. Truncated to what the MTU allows.
    pub async fn notify(&self, handle: u16, value: &[u8]) {
        let max = self.mtu().saturating_sub(3);
        self.send(AttPdu::Notification {
            handle,
            value: value[..value.len().min(max)].to_vec(),
        })
        .await;
    }

    /// Acknowledged value change. Suspends until the client confirms; a
    /// second indication queues behind the first.
    pub async fn indicate(&self, handle: u16, value: &[u8]) -> Result<(), AttError> {
        let _guard = self.indication_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.confirm_waiter.lock() = Some(tx);

        let max = self.mtu().saturating_sub(3);
        self.io
            .send_pdu(
                CID_ATTRIBUTE,
                &AttPdu::Indication {
                    handle,
                    value: value[..value.len().min(max)].to_vec(),
                }
                .to_bytes(),
            )
            .await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AttError::Closed),
            Err(_) => {
                self.confirm_waiter.lock().take();
                Err(AttError::Timeout)
            }
        }
    }

    /// Resolve the indication waiter on teardown.
    pub fn fail_pending(&self) {
        self.confirm_waiter.lock().take();
    }
}

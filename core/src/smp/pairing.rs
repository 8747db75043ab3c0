//! Pairing state machine
//!
//! One instance per connection. All PDU processing runs serialized on the
//! dispatch task; the context lock is only ever contended by a local
//! `pair()` call starting the exchange.
//!
//! Secure path (commit before reveal):
//! request/response -> public keys -> responder confirm -> nonces
//! -> key checks -> key distribution -> bonded.
//! Legacy path:
//! request/response -> confirms (both) -> nonces (cross-checked)
//! -> key distribution -> bonded.
//! Any mismatch aborts the session; pairing must restart from idle.

use super::crypto::{self, KeyPair, NONCE_SIZE};
use super::pdu::{PairingFeatures, SmpPdu};
use super::{
    BondingRecord, IoCapability, PairingFailedReason, PairingMethod, PeerIdentity, SmpError,
    AUTH_REQ_BONDING, AUTH_REQ_MITM, AUTH_REQ_SECURE_CONNECTIONS, KEY_DIST_ENCRYPTION,
    KEY_DIST_IDENTITY, KEY_DIST_SIGNING, MAX_KEY_SIZE,
};
use crate::config::StackConfig;
use crate::l2cap::channel::PduSender;
use crate::l2cap::CID_SECURITY;
use crate::types::{ConnectionHandle, LinkSecurity, PeerAddress, Role, SecurityLevel};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// User-interaction collaborator for pairing decisions.
///
/// Defaults accept everything except passkey input, which has no sensible
/// default and fails pairing if the method requires it.
#[async_trait]
pub trait PairingDelegate: Send + Sync {
    /// Accept or reject an unauthenticated (just-works) pairing.
    async fn confirm_pairing(&self, _conn: ConnectionHandle) -> bool {
        true
    }

    /// Show a passkey for the peer's user to type.
    async fn display_passkey(&self, _conn: ConnectionHandle, _passkey: u32) {}

    /// Collect the passkey shown on the peer.
    async fn input_passkey(&self, _conn: ConnectionHandle) -> Option<u32> {
        None
    }

    /// Ask the user whether both devices show the same code.
    async fn confirm_numeric(&self, _conn: ConnectionHandle, _code: u32) -> bool {
        true
    }
}

/// Accepts every interaction; used when the embedder installs no delegate.
pub struct AutoAcceptDelegate;

#[async_trait]
impl PairingDelegate for AutoAcceptDelegate {}

/// Pairing outcomes surfaced to the session registry. The bonding record
/// itself goes straight to the persistence collaborator, never through the
/// event surface.
#[derive(Debug, Clone)]
pub enum SecurityNotice {
    Completed { authenticated: bool },
    Failed { error: SmpError },
}

/// Synchronous notice delivery into the session registry's event bus.
pub type SecurityNoticeSink = Arc<dyn Fn(SecurityNotice) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitResponse,
    AwaitPublicKey,
    AwaitConfirm,
    AwaitRandom,
    AwaitDhKeyCheck,
    AwaitLegacyConfirm,
    AwaitLegacyRandom,
    KeyDistribution,
    Bonded,
    Failed(PairingFailedReason),
}

struct PairingContext {
    phase: Phase,
    /// Which side of this pairing sent the request (independent of the
    /// connection role: a responder can solicit via a security request)
    pairing_role: Role,
    method: PairingMethod,
    secure: bool,
    request_bytes: Vec<u8>,
    response_bytes: Vec<u8>,
    local_features: PairingFeatures,
    peer_features: Option<PairingFeatures>,
    key_size: u8,
    passkey: u32,
    keypair: Option<KeyPair>,
    peer_public: [u8; 32],
    local_nonce: [u8; NONCE_SIZE],
    peer_nonce: [u8; NONCE_SIZE],
    peer_confirm: [u8; 32],
    mac_key: [u8; 32],
    ltk: [u8; 16],
    temporary_key: [u8; 16],
    /// Key-distribution bookkeeping
    expected_peer_keys: u8,
    sent_own_keys: bool,
    peer_ltk: Option<[u8; 16]>,
    peer_ediv: Option<u16>,
    peer_rand: Option<[u8; 8]>,
    peer_irk: Option<[u8; 16]>,
    peer_identity_address: Option<PeerAddress>,
    peer_csrk: Option<[u8; 16]>,
}

impl PairingContext {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            pairing_role: Role::Initiator,
            method: PairingMethod::JustWorks,
            secure: false,
            request_bytes: Vec::new(),
            response_bytes: Vec::new(),
            local_features: PairingFeatures {
                io_capability: IoCapability::NoInputNoOutput,
                oob: false,
                auth_req: 0,
                max_key_size: MAX_KEY_SIZE,
                initiator_keys: 0,
                responder_keys: 0,
            },
            peer_features: None,
            key_size: MAX_KEY_SIZE,
            passkey: 0,
            keypair: None,
            peer_public: [0; 32],
            local_nonce: [0; NONCE_SIZE],
            peer_nonce: [0; NONCE_SIZE],
            peer_confirm: [0; 32],
            mac_key: [0; 32],
            ltk: [0; 16],
            temporary_key: [0; 16],
            expected_peer_keys: 0,
            sent_own_keys: false,
            peer_ltk: None,
            peer_ediv: None,
            peer_rand: None,
            peer_irk: None,
            peer_identity_address: None,
            peer_csrk: None,
        }
    }

    fn zeroize_secrets(&mut self) {
        self.mac_key.zeroize();
        self.ltk.zeroize();
        self.temporary_key.zeroize();
        self.local_nonce.zeroize();
        self.keypair = None;
        if let Some(ltk) = &mut self.peer_ltk {
            ltk.zeroize();
        }
    }

    fn is_initiator(&self) -> bool {
        self.pairing_role == Role::Initiator
    }

    /// (initiator address, responder address) for transcript binding.
    fn ordered_addresses(
        &self,
        local: PeerAddress,
        peer: PeerAddress,
    ) -> (PeerAddress, PeerAddress) {
        if self.is_initiator() {
            (local, peer)
        } else {
            (peer, local)
        }
    }

    /// (initiator nonce, responder nonce).
    fn ordered_nonces(&self) -> ([u8; NONCE_SIZE], [u8; NONCE_SIZE]) {
        if self.is_initiator() {
            (self.local_nonce, self.peer_nonce)
        } else {
            (self.peer_nonce, self.local_nonce)
        }
    }

    /// (initiator public key, responder public key).
    fn ordered_public_keys(&self) -> ([u8; 32], [u8; 32]) {
        let local = self.keypair.as_ref().map(|kp| kp.public).unwrap_or([0; 32]);
        if self.is_initiator() {
            (local, self.peer_public)
        } else {
            (self.peer_public, local)
        }
    }
}

/// The security manager for one connection.
pub struct SecurityManager {
    io: Arc<PduSender>,
    config: StackConfig,
    conn_role: Role,
    local_address: PeerAddress,
    peer_address: PeerAddress,
    security: Arc<LinkSecurity>,
    delegate: Arc<dyn PairingDelegate>,
    bond_store: Arc<dyn crate::host::BondingStore>,
    notices: SecurityNoticeSink,
    ctx: tokio::sync::Mutex<PairingContext>,
    waiters: parking_lot::Mutex<Vec<oneshot::Sender<Result<(), SmpError>>>>,
}

impl SecurityManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        io: Arc<PduSender>,
        config: StackConfig,
        conn_role: Role,
        local_address: PeerAddress,
        peer_address: PeerAddress,
        security: Arc<LinkSecurity>,
        delegate: Arc<dyn PairingDelegate>,
        bond_store: Arc<dyn crate::host::BondingStore>,
        notices: SecurityNoticeSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            io,
            config,
            conn_role,
            local_address,
            peer_address,
            security,
            delegate,
            bond_store,
            notices,
            ctx: tokio::sync::Mutex::new(PairingContext::new()),
            waiters: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn conn(&self) -> ConnectionHandle {
        self.io.conn
    }

    fn local_features(&self) -> PairingFeatures {
        let mut auth_req = 0;
        if self.config.bonding {
            auth_req |= AUTH_REQ_BONDING;
        }
        if self.config.mitm {
            auth_req |= AUTH_REQ_MITM;
        }
        if self.config.secure_connections {
            auth_req |= AUTH_REQ_SECURE_CONNECTIONS;
        }
        let keys = if self.config.bonding {
            KEY_DIST_ENCRYPTION | KEY_DIST_IDENTITY | KEY_DIST_SIGNING
        } else {
            0
        };
        PairingFeatures {
            io_capability: self.config.io_capability,
            oob: false,
            auth_req,
            max_key_size: MAX_KEY_SIZE,
            initiator_keys: keys,
            responder_keys: keys,
        }
    }

    async fn send(&self, pdu: SmpPdu) -> Result<(), SmpError> {
        self.io.send_pdu(CID_SECURITY, &pdu.to_bytes()).await?;
        Ok(())
    }

    fn classify(reason: PairingFailedReason) -> SmpError {
        match reason {
            PairingFailedReason::ConfirmValueFailed
            | PairingFailedReason::DhKeyCheckFailed
            | PairingFailedReason::NumericComparisonFailed
            | PairingFailedReason::PasskeyEntryFailed => SmpError::AuthenticationFailure(reason),
            PairingFailedReason::MethodMismatch => SmpError::MethodMismatch,
            other => SmpError::Failed(other),
        }
    }

    async fn fail(
        &self,
        ctx: &mut PairingContext,
        reason: PairingFailedReason,
        notify_peer: bool,
    ) {
        warn!("pairing on {} failed: {:?}", self.conn(), reason);
        if notify_peer {
            let _ = self.send(SmpPdu::PairingFailed { reason }).await;
        }
        ctx.zeroize_secrets();
        ctx.phase = Phase::Failed(reason);
        let error = Self::classify(reason);
        for waiter in self.waiters.lock().drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        (self.notices)(SecurityNotice::Failed { error });
    }

    /// Begin pairing (or wait for one already running). A connection
    /// initiator sends the pairing request itself; a responder solicits one
    /// with a security request and waits for the peer to drive.
    pub async fn pair(&self) -> Result<(), SmpError> {
        let rx = {
            let mut ctx = self.ctx.lock().await;
            match ctx.phase {
                Phase::Bonded => return Ok(()),
                Phase::Idle | Phase::Failed(_) => {}
                _ => return Err(SmpError::InProgress),
            }
            *ctx = PairingContext::new();
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().push(tx);

            let features = self.local_features();
            if self.conn_role == Role::Initiator {
                let request = SmpPdu::PairingRequest(features);
                ctx.pairing_role = Role::Initiator;
                ctx.local_features = features;
                ctx.request_bytes = request.to_bytes();
                ctx.phase = Phase::AwaitResponse;
                self.send(request).await?;
            } else {
                self.send(SmpPdu::SecurityRequest {
                    auth_req: features.auth_req,
                })
                .await?;
            }
            rx
        };

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SmpError::Disconnected),
            Err(_) => {
                let mut ctx = self.ctx.lock().await;
                if !matches!(ctx.phase, Phase::Bonded | Phase::Failed(_)) {
                    self.fail(&mut ctx, PairingFailedReason::UnspecifiedReason, true)
                        .await;
                }
                Err(SmpError::Timeout)
            }
        }
    }

    /// Resolve everything on connection teardown.
    pub async fn handle_disconnect(&self) {
        let mut ctx = self.ctx.lock().await;
        if !matches!(ctx.phase, Phase::Idle | Phase::Bonded | Phase::Failed(_)) {
            ctx.zeroize_secrets();
            ctx.phase = Phase::Failed(PairingFailedReason::UnspecifiedReason);
            (self.notices)(SecurityNotice::Failed {
                error: SmpError::Disconnected,
            });
        }
        for waiter in self.waiters.lock().drain(..) {
            let _ = waiter.send(Err(SmpError::Disconnected));
        }
    }

    /// Handle one inbound security-channel PDU.
    pub async fn handle_pdu(&self, bytes: &[u8]) {
        let pdu = match SmpPdu::from_bytes(bytes) {
            Ok(pdu) => pdu,
            Err(err) => {
                warn!("malformed pairing PDU on {}: {}", self.conn(), err);
                let mut ctx = self.ctx.lock().await;
                if !matches!(ctx.phase, Phase::Idle | Phase::Bonded | Phase::Failed(_)) {
                    self.fail(&mut ctx, PairingFailedReason::InvalidParameters, true)
                        .await;
                }
                return;
            }
        };

        let mut ctx = self.ctx.lock().await;
        match pdu {
            SmpPdu::SecurityRequest { .. } => {
                drop(ctx);
                self.on_security_request().await;
            }
            SmpPdu::PairingRequest(features) => {
                self.on_pairing_request(&mut ctx, features, bytes).await;
            }
            SmpPdu::PairingResponse(features) => {
                self.on_pairing_response(&mut ctx, features, bytes).await;
            }
            SmpPdu::PublicKey { key } => self.on_public_key(&mut ctx, key).await,
            SmpPdu::PairingConfirm { value } => self.on_confirm(&mut ctx, value).await,
            SmpPdu::PairingRandom { nonce } => self.on_random(&mut ctx, nonce).await,
            SmpPdu::DhKeyCheck { value } => self.on_dh_key_check(&mut ctx, value).await,
            SmpPdu::PairingFailed { reason } => {
                info!("peer failed pairing on {}: {:?}", self.conn(), reason);
                ctx.zeroize_secrets();
                ctx.phase = Phase::Failed(reason);
                let error = Self::classify(reason);
                for waiter in self.waiters.lock().drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
                (self.notices)(SecurityNotice::Failed { error });
            }
            SmpPdu::EncryptionInformation { .. }
            | SmpPdu::CentralIdentification { .. }
            | SmpPdu::IdentityInformation { .. }
            | SmpPdu::IdentityAddressInformation { .. }
            | SmpPdu::SigningInformation { .. } => {
                self.on_key_distribution(&mut ctx, pdu).await;
            }
        }
    }

    async fn on_security_request(&self) {
        if self.conn_role != Role::Initiator {
            warn!("security request received by the responder side, ignoring");
            return;
        }
        let mut ctx = self.ctx.lock().await;
        if !matches!(ctx.phase, Phase::Idle | Phase::Failed(_)) {
            debug!("security request while pairing is already underway");
            return;
        }
        *ctx = PairingContext::new();
        let features = self.local_features();
        let request = SmpPdu::PairingRequest(features);
        ctx.pairing_role = Role::Initiator;
        ctx.local_features = features;
        ctx.request_bytes = request.to_bytes();
        ctx.phase = Phase::AwaitResponse;
        if self.send(request).await.is_err() {
            self.fail(&mut ctx, PairingFailedReason::UnspecifiedReason, false)
                .await;
        }
    }

    /// Shared feature-exchange validation; fills in method/key size/passkey.
    /// Returns false if pairing has been failed.
    async fn establish_features(
        &self,
        ctx: &mut PairingContext,
        initiator: PairingFeatures,
        responder: PairingFeatures,
    ) -> bool {
        let key_size = initiator.max_key_size.min(responder.max_key_size);
        if !(7..=MAX_KEY_SIZE).contains(&key_size) {
            self.fail(ctx, PairingFailedReason::InvalidParameters, true)
                .await;
            return false;
        }
        if key_size < self.config.min_key_size {
            self.fail(ctx, PairingFailedReason::EncryptionKeySize, true)
                .await;
            return false;
        }
        ctx.key_size = key_size;
        ctx.secure = initiator.secure_connections() && responder.secure_connections();
        ctx.method = super::select_method(
            ctx.secure,
            initiator.io_capability,
            responder.io_capability,
            initiator.mitm(),
            responder.mitm(),
        );
        debug!(
            "pairing method on {}: {:?} (secure={})",
            self.conn(),
            ctx.method,
            ctx.secure
        );

        // A side that demands authentication cannot accept a method that
        // provides none
        if (initiator.mitm() || responder.mitm()) && ctx.method == PairingMethod::JustWorks {
            self.fail(ctx, PairingFailedReason::AuthenticationRequirements, true)
                .await;
            return false;
        }

        match ctx.method {
            PairingMethod::JustWorks => {
                if !self.delegate.confirm_pairing(self.conn()).await {
                    self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                        .await;
                    return false;
                }
            }
            PairingMethod::PasskeyEntry { initiator_displays } => {
                // When neither side can display, both users type a code
                // agreed out of band
                let neither_displays = !initiator.io_capability.can_display()
                    && !responder.io_capability.can_display();
                let we_display =
                    !neither_displays && initiator_displays == ctx.is_initiator();
                if we_display {
                    ctx.passkey = crypto::random_passkey();
                    self.delegate.display_passkey(self.conn(), ctx.passkey).await;
                } else {
                    match self.delegate.input_passkey(self.conn()).await {
                        Some(passkey) if passkey < 1_000_000 => ctx.passkey = passkey,
                        _ => {
                            self.fail(ctx, PairingFailedReason::PasskeyEntryFailed, true)
                                .await;
                            return false;
                        }
                    }
                }
            }
            PairingMethod::NumericComparison => {
                // Needs both nonces; confirmed later
            }
        }

        if !ctx.secure {
            let passkey = match ctx.method {
                PairingMethod::PasskeyEntry { .. } => Some(ctx.passkey),
                _ => None,
            };
            ctx.temporary_key = crypto::legacy_temporary_key(passkey);
        }
        true
    }

    async fn on_pairing_request(
        &self,
        ctx: &mut PairingContext,
        features: PairingFeatures,
        raw: &[u8],
    ) {
        if !matches!(ctx.phase, Phase::Idle | Phase::Failed(_)) {
            warn!("pairing request in phase {:?}", ctx.phase);
            self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                .await;
            return;
        }
        *ctx = PairingContext::new();
        ctx.pairing_role = Role::Responder;
        ctx.peer_features = Some(features);
        ctx.request_bytes = raw.to_vec();

        let local = self.local_features();
        ctx.local_features = local;
        let response = SmpPdu::PairingResponse(local);
        ctx.response_bytes = response.to_bytes();
        if self.send(response).await.is_err() {
            self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                .await;
            return;
        }

        if !self.establish_features(ctx, features, local).await {
            return;
        }

        if ctx.secure {
            ctx.keypair = Some(KeyPair::generate());
            ctx.phase = Phase::AwaitPublicKey;
        } else {
            ctx.local_nonce = crypto::random_nonce();
            // Initiator confirms first on the legacy path
            ctx.phase = Phase::AwaitLegacyConfirm;
        }
    }

    async fn on_pairing_response(
        &self,
        ctx: &mut PairingContext,
        features: PairingFeatures,
        raw: &[u8],
    ) {
        if ctx.phase != Phase::AwaitResponse {
            warn!("unexpected pairing response in phase {:?}", ctx.phase);
            self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                .await;
            return;
        }
        ctx.peer_features = Some(features);
        ctx.response_bytes = raw.to_vec();

        let local = ctx.local_features;
        if !self.establish_features(ctx, local, features).await {
            return;
        }

        if ctx.secure {
            let keypair = KeyPair::generate();
            let public = keypair.public;
            ctx.keypair = Some(keypair);
            ctx.phase = Phase::AwaitPublicKey;
            if self.send(SmpPdu::PublicKey { key: public }).await.is_err() {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
            }
        } else {
            ctx.local_nonce = crypto::random_nonce();
            let (addr_i, addr_r) = ctx.ordered_addresses(self.local_address, self.peer_address);
            let confirm = crypto::legacy_confirm(
                &ctx.temporary_key,
                &ctx.local_nonce,
                &ctx.request_bytes,
                &ctx.response_bytes,
                &addr_i,
                &addr_r,
            );
            ctx.phase = Phase::AwaitLegacyConfirm;
            if self
                .send(SmpPdu::PairingConfirm { value: confirm })
                .await
                .is_err()
            {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
            }
        }
    }

    async fn on_public_key(&self, ctx: &mut PairingContext, key: [u8; 32]) {
        if ctx.phase != Phase::AwaitPublicKey {
            self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                .await;
            return;
        }
        ctx.peer_public = key;

        if ctx.is_initiator() {
            // Our key is already out; wait for the responder's commitment
            ctx.phase = Phase::AwaitConfirm;
        } else {
            // Send our key, then commit to our nonce before any nonce is
            // revealed
            let public = ctx.keypair.as_ref().map(|kp| kp.public).unwrap_or([0; 32]);
            if self.send(SmpPdu::PublicKey { key: public }).await.is_err() {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
                return;
            }
            ctx.local_nonce = crypto::random_nonce();
            let (pk_i, pk_r) = ctx.ordered_public_keys();
            let passkey = match ctx.method {
                PairingMethod::PasskeyEntry { .. } => ctx.passkey,
                _ => 0,
            };
            let confirm = crypto::commitment(&ctx.local_nonce, &pk_i, &pk_r, passkey);
            ctx.phase = Phase::AwaitRandom;
            if self
                .send(SmpPdu::PairingConfirm { value: confirm })
                .await
                .is_err()
            {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
            }
        }
    }

    async fn on_confirm(&self, ctx: &mut PairingContext, value: [u8; 32]) {
        match ctx.phase {
            // Secure path, initiator: the responder committed; reveal our
            // nonce
            Phase::AwaitConfirm if ctx.is_initiator() => {
                ctx.peer_confirm = value;
                ctx.local_nonce = crypto::random_nonce();
                ctx.phase = Phase::AwaitRandom;
                if self
                    .send(SmpPdu::PairingRandom {
                        nonce: ctx.local_nonce,
                    })
                    .await
                    .is_err()
                {
                    self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                        .await;
                }
            }
            // Legacy path: confirms cross before any nonce
            Phase::AwaitLegacyConfirm => {
                ctx.peer_confirm = value;
                if ctx.is_initiator() {
                    // Both confirms are out; reveal our nonce first
                    ctx.phase = Phase::AwaitLegacyRandom;
                    if self
                        .send(SmpPdu::PairingRandom {
                            nonce: ctx.local_nonce,
                        })
                        .await
                        .is_err()
                    {
                        self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                            .await;
                    }
                } else {
                    // Answer with our own confirm
                    let (addr_i, addr_r) =
                        ctx.ordered_addresses(self.local_address, self.peer_address);
                    let confirm = crypto::legacy_confirm(
                        &ctx.temporary_key,
                        &ctx.local_nonce,
                        &ctx.request_bytes,
                        &ctx.response_bytes,
                        &addr_i,
                        &addr_r,
                    );
                    ctx.phase = Phase::AwaitLegacyRandom;
                    if self
                        .send(SmpPdu::PairingConfirm { value: confirm })
                        .await
                        .is_err()
                    {
                        self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                            .await;
                    }
                }
            }
            _ => {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                    .await;
            }
        }
    }

    async fn on_random(&self, ctx: &mut PairingContext, nonce: [u8; NONCE_SIZE]) {
        match ctx.phase {
            Phase::AwaitRandom => self.on_secure_random(ctx, nonce).await,
            Phase::AwaitLegacyRandom => self.on_legacy_random(ctx, nonce).await,
            _ => {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                    .await;
            }
        }
    }

    async fn on_secure_random(&self, ctx: &mut PairingContext, nonce: [u8; NONCE_SIZE]) {
        ctx.peer_nonce = nonce;
        let (pk_i, pk_r) = ctx.ordered_public_keys();
        let passkey = match ctx.method {
            PairingMethod::PasskeyEntry { .. } => ctx.passkey,
            _ => 0,
        };

        if ctx.is_initiator() {
            // Verify the responder's commitment now that its nonce is out
            let expected = crypto::commitment(&ctx.peer_nonce, &pk_i, &pk_r, passkey);
            if expected != ctx.peer_confirm {
                self.fail(ctx, PairingFailedReason::ConfirmValueFailed, true)
                    .await;
                return;
            }
        }

        if ctx.method == PairingMethod::NumericComparison {
            let (n_i, n_r) = ctx.ordered_nonces();
            let code = crypto::numeric_code(&pk_i, &pk_r, &n_i, &n_r);
            if !self.delegate.confirm_numeric(self.conn(), code).await {
                self.fail(ctx, PairingFailedReason::NumericComparisonFailed, true)
                    .await;
                return;
            }
        }

        // Both nonces known: derive the session keys
        let Some(keypair) = ctx.keypair.as_ref() else {
            self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                .await;
            return;
        };
        let mut shared = keypair.shared_secret(&ctx.peer_public);
        let (n_i, n_r) = ctx.ordered_nonces();
        let (addr_i, addr_r) = ctx.ordered_addresses(self.local_address, self.peer_address);
        let (mac_key, mut ltk) = crypto::derive_keys(&shared, &n_i, &n_r, &addr_i, &addr_r);
        shared.zeroize();
        crypto::truncate_key(&mut ltk, ctx.key_size);
        ctx.mac_key = mac_key;
        ctx.ltk = ltk;

        if ctx.is_initiator() {
            // Prove possession first
            let check = crypto::key_check(
                &ctx.mac_key,
                true,
                &ctx.request_bytes,
                &ctx.response_bytes,
                &n_i,
                &n_r,
                &addr_i,
                &addr_r,
            );
            ctx.phase = Phase::AwaitDhKeyCheck;
            if self.send(SmpPdu::DhKeyCheck { value: check }).await.is_err() {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
            }
        } else {
            // Reveal our nonce; the initiator verifies our earlier
            // commitment against it
            let local_nonce = ctx.local_nonce;
            ctx.phase = Phase::AwaitDhKeyCheck;
            if self
                .send(SmpPdu::PairingRandom { nonce: local_nonce })
                .await
                .is_err()
            {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
            }
        }
    }

    async fn on_legacy_random(&self, ctx: &mut PairingContext, nonce: [u8; NONCE_SIZE]) {
        ctx.peer_nonce = nonce;
        let (addr_i, addr_r) = ctx.ordered_addresses(self.local_address, self.peer_address);

        // The peer's confirm must match the nonce it just revealed
        let expected = crypto::legacy_confirm(
            &ctx.temporary_key,
            &ctx.peer_nonce,
            &ctx.request_bytes,
            &ctx.response_bytes,
            &addr_i,
            &addr_r,
        );
        if expected != ctx.peer_confirm {
            self.fail(ctx, PairingFailedReason::ConfirmValueFailed, true)
                .await;
            return;
        }

        let (n_i, n_r) = ctx.ordered_nonces();
        let mut stk = crypto::legacy_short_term_key(&ctx.temporary_key, &n_i, &n_r);
        crypto::truncate_key(&mut stk, ctx.key_size);
        ctx.ltk = stk;

        if ctx.is_initiator() {
            self.enter_key_distribution(ctx).await;
        } else {
            // Reveal our nonce, then distribute keys
            let local_nonce = ctx.local_nonce;
            if self
                .send(SmpPdu::PairingRandom { nonce: local_nonce })
                .await
                .is_err()
            {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
                return;
            }
            self.enter_key_distribution(ctx).await;
        }
    }

    async fn on_dh_key_check(&self, ctx: &mut PairingContext, value: [u8; 32]) {
        if ctx.phase != Phase::AwaitDhKeyCheck {
            self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                .await;
            return;
        }
        let (n_i, n_r) = ctx.ordered_nonces();
        let (addr_i, addr_r) = ctx.ordered_addresses(self.local_address, self.peer_address);

        // The peer's check uses its own role tag
        let expected = crypto::key_check(
            &ctx.mac_key,
            !ctx.is_initiator(),
            &ctx.request_bytes,
            &ctx.response_bytes,
            &n_i,
            &n_r,
            &addr_i,
            &addr_r,
        );
        if expected != value {
            self.fail(ctx, PairingFailedReason::DhKeyCheckFailed, true)
                .await;
            return;
        }

        if !ctx.is_initiator() {
            // Answer with our own proof
            let check = crypto::key_check(
                &ctx.mac_key,
                false,
                &ctx.request_bytes,
                &ctx.response_bytes,
                &n_i,
                &n_r,
                &addr_i,
                &addr_r,
            );
            if self.send(SmpPdu::DhKeyCheck { value: check }).await.is_err() {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
                return;
            }
        }
        self.enter_key_distribution(ctx).await;
    }

    /// Negotiated key-distribution mask for the given side.
    fn negotiated_keys(ctx: &PairingContext, initiator_side: bool) -> u8 {
        let Some(peer) = ctx.peer_features else {
            return 0;
        };
        // The response's masks are the negotiated set: both sides carry
        // them, the responder narrows
        let (request, response) = if ctx.is_initiator() {
            (ctx.local_features, peer)
        } else {
            (peer, ctx.local_features)
        };
        let mut mask = if initiator_side {
            request.initiator_keys & response.initiator_keys
        } else {
            request.responder_keys & response.responder_keys
        };
        if ctx.secure {
            // The long-term key is derived, never distributed
            mask &= !KEY_DIST_ENCRYPTION;
        }
        if !(request.bonding() && response.bonding()) {
            mask = 0;
        }
        mask
    }

    async fn enter_key_distribution(&self, ctx: &mut PairingContext) {
        ctx.phase = Phase::KeyDistribution;
        ctx.expected_peer_keys = Self::negotiated_keys(ctx, !ctx.is_initiator());

        // The responder distributes first; the initiator holds back until
        // everything expected has arrived
        if !ctx.is_initiator() {
            if self.distribute_own_keys(ctx).await.is_err() {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
                return;
            }
        }
        self.maybe_finish(ctx).await;
    }

    async fn distribute_own_keys(&self, ctx: &mut PairingContext) -> Result<(), SmpError> {
        let mask = Self::negotiated_keys(ctx, ctx.is_initiator());
        if mask & KEY_DIST_ENCRYPTION != 0 {
            // Legacy only: hand out a fresh long-term key with its
            // identifiers
            let ltk: [u8; 16] = crypto::random_bytes();
            let ediv = u16::from_le_bytes(crypto::random_bytes::<2>());
            let rand: [u8; 8] = crypto::random_bytes();
            self.send(SmpPdu::EncryptionInformation { ltk }).await?;
            self.send(SmpPdu::CentralIdentification { ediv, rand }).await?;
        }
        if mask & KEY_DIST_IDENTITY != 0 {
            let irk: [u8; 16] = crypto::random_bytes();
            self.send(SmpPdu::IdentityInformation { irk }).await?;
            self.send(SmpPdu::IdentityAddressInformation {
                address: self.local_address,
            })
            .await?;
        }
        if mask & KEY_DIST_SIGNING != 0 {
            let csrk: [u8; 16] = crypto::random_bytes();
            self.send(SmpPdu::SigningInformation { csrk }).await?;
        }
        ctx.sent_own_keys = true;
        Ok(())
    }

    async fn on_key_distribution(&self, ctx: &mut PairingContext, pdu: SmpPdu) {
        if ctx.phase != Phase::KeyDistribution {
            self.fail(ctx, PairingFailedReason::UnspecifiedReason, true)
                .await;
            return;
        }
        match pdu {
            SmpPdu::EncryptionInformation { ltk } => {
                ctx.peer_ltk = Some(ltk);
            }
            SmpPdu::CentralIdentification { ediv, rand } => {
                ctx.peer_ediv = Some(ediv);
                ctx.peer_rand = Some(rand);
                ctx.expected_peer_keys &= !KEY_DIST_ENCRYPTION;
            }
            SmpPdu::IdentityInformation { irk } => {
                ctx.peer_irk = Some(irk);
            }
            SmpPdu::IdentityAddressInformation { address } => {
                ctx.peer_identity_address = Some(address);
                ctx.expected_peer_keys &= !KEY_DIST_IDENTITY;
            }
            SmpPdu::SigningInformation { csrk } => {
                ctx.peer_csrk = Some(csrk);
                ctx.expected_peer_keys &= !KEY_DIST_SIGNING;
            }
            _ => unreachable!("routed by caller"),
        }
        self.maybe_finish(ctx).await;
    }

    async fn maybe_finish(&self, ctx: &mut PairingContext) {
        if ctx.expected_peer_keys != 0 {
            return;
        }
        if !ctx.sent_own_keys {
            if self.distribute_own_keys(ctx).await.is_err() {
                self.fail(ctx, PairingFailedReason::UnspecifiedReason, false)
                    .await;
                return;
            }
        }
        // The initiator finishes once it has sent; the responder finishes
        // once the initiator's keys are in (expected mask already empty)
        self.complete(ctx).await;
    }

    async fn complete(&self, ctx: &mut PairingContext) {
        let authenticated = ctx.method.is_authenticated();
        ctx.phase = Phase::Bonded;
        let level = if authenticated {
            SecurityLevel::Authenticated
        } else {
            SecurityLevel::Encrypted
        };
        self.security.set_level(level);
        info!(
            "pairing complete on {} ({:?}, security {})",
            self.conn(),
            ctx.method,
            level
        );

        let bonding = ctx
            .peer_features
            .map(|peer| peer.bonding() && ctx.local_features.bonding())
            .unwrap_or(false);
        let record = bonding.then(|| {
            // Prefer the distributed key (legacy); the secure path derives it
            let ltk = if ctx.secure {
                ctx.ltk
            } else {
                ctx.peer_ltk.unwrap_or(ctx.ltk)
            };
            BondingRecord {
                peer: PeerIdentity {
                    address: ctx.peer_identity_address.unwrap_or(self.peer_address),
                    irk: ctx.peer_irk,
                },
                ltk,
                ediv: ctx.peer_ediv,
                rand: ctx.peer_rand,
                csrk: ctx.peer_csrk,
                authenticated,
                secure: ctx.secure,
                key_size: ctx.key_size,
            }
        });

        // Hand the record to the persistence collaborator; the core keeps
        // nothing beyond this point
        if let Some(record) = record {
            self.bond_store.store(record).await;
        }

        for waiter in self.waiters.lock().drain(..) {
            let _ = waiter.send(Ok(()));
        }
        (self.notices)(SecurityNotice::Completed { authenticated });
        ctx.zeroize_secrets();
    }
}

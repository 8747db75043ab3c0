// Pairing cryptography: x25519 key agreement plus keyed-hash commitments
// and key derivation
//
// Secure path:
// 1. Exchange x25519 public keys
// 2. Responder commits to its nonce before either nonce is revealed:
//    C = keyed_hash(Nb, PKa || PKb || passkey || 0)
// 3. Nonces are exchanged, the commitment is verified
// 4. ECDH -> shared secret; MacKey and LTK derive from it, salted with both
//    nonces and both addresses
// 5. Each side proves possession with a key-check MAC under MacKey
//
// Legacy path: both confirms derive from a shared temporary key (zero for
// just-works, the passkey otherwise); the short-term key derives from the
// temporary key and both nonces.

use crate::types::PeerAddress;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// KDF context strings. Changing any of these breaks compatibility with all
/// previously produced bonds.
const CTX_MAC_KEY: &str = "bluehost smp v1 mac key";
const CTX_LONG_TERM_KEY: &str = "bluehost smp v1 long term key";
const CTX_LEGACY_CONFIRM_KEY: &str = "bluehost smp v1 legacy confirm key";
const CTX_LEGACY_SHORT_TERM_KEY: &str = "bluehost smp v1 short term key";

pub const NONCE_SIZE: usize = 32;

/// An ephemeral key-agreement key pair for one pairing session.
pub struct KeyPair {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = *X25519PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// ECDH with the peer's public key.
    pub fn shared_secret(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer_public));
        *shared.as_bytes()
    }
}

pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// A six-digit passkey for display/entry methods.
pub fn random_passkey() -> u32 {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    u32::from_le_bytes(bytes) % 1_000_000
}

/// Commitment over a nonce and both public keys, bound to the passkey when
/// one is in play. Sent before the nonce is revealed so neither side can
/// pick its random after seeing the peer's.
pub fn commitment(
    nonce: &[u8; NONCE_SIZE],
    initiator_pk: &[u8; 32],
    responder_pk: &[u8; 32],
    passkey: u32,
) -> [u8; 32] {
    let mut message = Vec::with_capacity(69);
    message.extend_from_slice(initiator_pk);
    message.extend_from_slice(responder_pk);
    message.extend_from_slice(&passkey.to_le_bytes());
    message.push(0);
    *blake3::keyed_hash(nonce, &message).as_bytes()
}

/// Derive the session MAC key and long-term key from the shared secret,
/// both nonces, and both addresses.
pub fn derive_keys(
    shared_secret: &[u8; 32],
    initiator_nonce: &[u8; NONCE_SIZE],
    responder_nonce: &[u8; NONCE_SIZE],
    initiator_address: &PeerAddress,
    responder_address: &PeerAddress,
) -> ([u8; 32], [u8; 16]) {
    let mut material = Vec::with_capacity(32 + 2 * NONCE_SIZE + 12);
    material.extend_from_slice(shared_secret);
    material.extend_from_slice(initiator_nonce);
    material.extend_from_slice(responder_nonce);
    material.extend_from_slice(initiator_address.as_bytes());
    material.extend_from_slice(responder_address.as_bytes());

    let mac_key = blake3::derive_key(CTX_MAC_KEY, &material);
    let mut ltk_full = blake3::derive_key(CTX_LONG_TERM_KEY, &material);
    let mut ltk = [0u8; 16];
    ltk.copy_from_slice(&ltk_full[..16]);

    ltk_full.zeroize();
    material.zeroize();
    (mac_key, ltk)
}

/// Key-check MAC proving both sides derived the same MacKey over the same
/// session transcript. The role tag keeps the two directions distinct.
#[allow(clippy::too_many_arguments)]
pub fn key_check(
    mac_key: &[u8; 32],
    initiator_check: bool,
    request: &[u8],
    response: &[u8],
    initiator_nonce: &[u8; NONCE_SIZE],
    responder_nonce: &[u8; NONCE_SIZE],
    initiator_address: &PeerAddress,
    responder_address: &PeerAddress,
) -> [u8; 32] {
    let mut message = Vec::new();
    message.push(if initiator_check { 0x01 } else { 0x02 });
    message.extend_from_slice(request);
    message.extend_from_slice(response);
    message.extend_from_slice(initiator_nonce);
    message.extend_from_slice(responder_nonce);
    message.extend_from_slice(initiator_address.as_bytes());
    message.extend_from_slice(responder_address.as_bytes());
    *blake3::keyed_hash(mac_key, &message).as_bytes()
}

/// Six-digit comparison code displayed to both users for the numeric
/// comparison method.
pub fn numeric_code(
    initiator_pk: &[u8; 32],
    responder_pk: &[u8; 32],
    initiator_nonce: &[u8; NONCE_SIZE],
    responder_nonce: &[u8; NONCE_SIZE],
) -> u32 {
    let mut message = Vec::with_capacity(64 + 2 * NONCE_SIZE);
    message.extend_from_slice(initiator_pk);
    message.extend_from_slice(responder_pk);
    message.extend_from_slice(initiator_nonce);
    message.extend_from_slice(responder_nonce);
    let digest = blake3::hash(&message);
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 1_000_000
}

/// Legacy confirm value under the temporary key, bound to the feature
/// exchange and both addresses.
pub fn legacy_confirm(
    temporary_key: &[u8; 16],
    nonce: &[u8; NONCE_SIZE],
    request: &[u8],
    response: &[u8],
    initiator_address: &PeerAddress,
    responder_address: &PeerAddress,
) -> [u8; 32] {
    let mut key = blake3::derive_key(CTX_LEGACY_CONFIRM_KEY, temporary_key);
    let mut message = Vec::new();
    message.extend_from_slice(nonce);
    message.extend_from_slice(request);
    message.extend_from_slice(response);
    message.extend_from_slice(initiator_address.as_bytes());
    message.extend_from_slice(responder_address.as_bytes());
    let confirm = *blake3::keyed_hash(&key, &message).as_bytes();
    key.zeroize();
    confirm
}

/// Legacy short-term key from the temporary key and both nonces.
pub fn legacy_short_term_key(
    temporary_key: &[u8; 16],
    initiator_nonce: &[u8; NONCE_SIZE],
    responder_nonce: &[u8; NONCE_SIZE],
) -> [u8; 16] {
    let mut material = Vec::with_capacity(16 + 2 * NONCE_SIZE);
    material.extend_from_slice(temporary_key);
    material.extend_from_slice(initiator_nonce);
    material.extend_from_slice(responder_nonce);
    let mut full = blake3::derive_key(CTX_LEGACY_SHORT_TERM_KEY, &material);
    let mut stk = [0u8; 16];
    stk.copy_from_slice(&full[..16]);
    full.zeroize();
    material.zeroize();
    stk
}

/// The temporary key for the legacy path: zero for just-works, the passkey
/// value otherwise.
pub fn legacy_temporary_key(passkey: Option<u32>) -> [u8; 16] {
    let mut tk = [0u8; 16];
    if let Some(passkey) = passkey {
        tk[..4].copy_from_slice(&passkey.to_le_bytes());
    }
    tk
}

/// Truncate a key to the negotiated size, zero-filling the tail.
pub fn truncate_key(key: &mut [u8; 16], key_size: u8) {
    for byte in key.iter_mut().skip(key_size as usize) {
        *byte = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_agreement() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(a.shared_secret(&b.public), b.shared_secret(&a.public));
    }

    #[test]
    fn test_commitment_binds_nonce_and_keys() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let nonce = random_nonce();

        let commit = commitment(&nonce, &a.public, &b.public, 0);
        assert_eq!(commit, commitment(&nonce, &a.public, &b.public, 0));
        assert_ne!(commit, commitment(&random_nonce(), &a.public, &b.public, 0));
        assert_ne!(commit, commitment(&nonce, &b.public, &a.public, 0));
        assert_ne!(commit, commitment(&nonce, &a.public, &b.public, 123456));
    }

    #[test]
    fn test_derived_keys_match_across_sides() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let na = random_nonce();
        let nb = random_nonce();
        let addr_a = PeerAddress([1; 6]);
        let addr_b = PeerAddress([2; 6]);

        let dh_a = a.shared_secret(&b.public);
        let dh_b = b.shared_secret(&a.public);
        assert_eq!(
            derive_keys(&dh_a, &na, &nb, &addr_a, &addr_b),
            derive_keys(&dh_b, &na, &nb, &addr_a, &addr_b)
        );
    }

    #[test]
    fn test_key_check_distinguishes_roles() {
        let mac_key = [7u8; 32];
        let na = random_nonce();
        let nb = random_nonce();
        let addr = PeerAddress([1; 6]);
        let ea = key_check(&mac_key, true, &[1], &[2], &na, &nb, &addr, &addr);
        let eb = key_check(&mac_key, false, &[1], &[2], &na, &nb, &addr, &addr);
        assert_ne!(ea, eb);
    }

    #[test]
    fn test_numeric_code_in_range() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let code = numeric_code(&a.public, &b.public, &random_nonce(), &random_nonce());
        assert!(code < 1_000_000);
    }

    #[test]
    fn test_legacy_confirm_depends_on_tk() {
        let nonce = random_nonce();
        let addr = PeerAddress([3; 6]);
        let tk_a = legacy_temporary_key(None);
        let tk_b = legacy_temporary_key(Some(123456));
        let ca = legacy_confirm(&tk_a, &nonce, &[1], &[2], &addr, &addr);
        let cb = legacy_confirm(&tk_b, &nonce, &[1], &[2], &addr, &addr);
        assert_ne!(ca, cb);
    }

    #[test]
    fn test_truncate_key_zeroes_tail() {
        let mut key = [0xFF; 16];
        truncate_key(&mut key, 7);
        assert!(key[..7].iter().all(|&b| b == 0xFF));
        assert!(key[7..].iter().all(|&b| b == 0));
    }
}

//! The `session_init` handshake.
//!
//! The initiator seals a random [`SessionKey`] under a key derived from an
//! ephemeral-static ECDH and signs the ciphertext with its identity key.  The
//! responder reverses the ECDH with its static key, opens the payload,
//! recovers the signer and checks authorization and freshness.  Either side
//! only ever returns a [`HandshakeResult`] when every check passed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use sw_domain::error::HandshakeError;
use sw_protocol::{SessionInitEnvelope, SessionInitPayload, SessionParams};

use crate::aead::{self, NONCE_LEN};
use crate::ecdh::{static_agree, EphemeralKeyPair};
use crate::error::{decode_fixed, CryptoError};
use crate::identity::{
    address_of, normalize_address, public_key_from_hex, public_key_to_hex, recover_address,
    IdentityKeyStore, RecoverableSignature,
};

/// HKDF `info` and AEAD label for the handshake.
pub const HANDSHAKE_INFO: &[u8] = b"sealwire/v1/session-init";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session key
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 32-byte symmetric key for one session.  Zeroized on drop.
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    pub fn random() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(key.as_mut());
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0.as_ref()))
    }

    fn from_hex(raw: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(decode_fixed::<32>("session_key", raw)?);
        Ok(Self::from_bytes(*bytes))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// External collaborators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolves a peer address to its long-term public key.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn get_public_key(&self, address: &str) -> Option<PublicKey>;
}

/// Decides whether a recovered signer may open a session.
#[async_trait]
pub trait AuthorizationCheck: Send + Sync {
    async fn is_authorized(&self, signer: &str) -> bool;
}

/// In-memory directory keyed by normalized address.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    keys: HashMap<String, PublicKey>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `public_key` under its derived address.
    pub fn insert(&mut self, public_key: PublicKey) -> String {
        let address = address_of(&public_key);
        self.keys.insert(address.clone(), public_key);
        address
    }

    /// Register a hex-encoded SEC1 key.
    pub fn insert_hex(&mut self, public_key_hex: &str) -> Result<String, CryptoError> {
        Ok(self.insert(public_key_from_hex(public_key_hex)?))
    }

    pub fn with_key(mut self, public_key: PublicKey) -> Self {
        self.insert(public_key);
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn get_public_key(&self, address: &str) -> Option<PublicKey> {
        self.keys.get(&normalize_address(address)).copied()
    }
}

/// Address allow-list.  An open list authorizes every signer.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    allowed: HashSet<String>,
    open: bool,
}

impl AllowList {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: addresses
                .into_iter()
                .map(|a| normalize_address(a.as_ref()))
                .collect(),
            open: false,
        }
    }

    pub fn open() -> Self {
        Self {
            allowed: HashSet::new(),
            open: true,
        }
    }

    pub fn allow(&mut self, address: &str) {
        self.allowed.insert(normalize_address(address));
    }

    pub fn contains(&self, address: &str) -> bool {
        self.open || self.allowed.contains(&normalize_address(address))
    }
}

#[async_trait]
impl AuthorizationCheck for AllowList {
    async fn is_authorized(&self, signer: &str) -> bool {
        self.contains(signer)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key agreement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A completed handshake, from either side.
#[derive(Debug)]
pub struct HandshakeResult {
    pub session_id: String,
    /// The host address (initiator side) or the recovered signer (responder side).
    pub peer_address: String,
    pub params: SessionParams,
    pub session_key: SessionKey,
    pub established_at: DateTime<Utc>,
}

/// Runs both halves of the handshake with one long-term identity.
#[derive(Debug, Clone)]
pub struct KeyAgreement {
    identity: Arc<IdentityKeyStore>,
}

impl KeyAgreement {
    pub fn new(identity: Arc<IdentityKeyStore>) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &Arc<IdentityKeyStore> {
        &self.identity
    }

    /// Initiator: resolve `peer_address` through `directory` and build the
    /// `session_init` envelope.
    pub async fn initiate_handshake(
        &self,
        directory: &dyn IdentityDirectory,
        peer_address: &str,
        session_id: &str,
        params: SessionParams,
    ) -> Result<(SessionInitEnvelope, HandshakeResult), HandshakeError> {
        let peer_public = directory
            .get_public_key(peer_address)
            .await
            .ok_or_else(|| HandshakeError::UnknownPeer(peer_address.to_string()))?;
        self.initiate_with_key(
            &peer_public,
            peer_address,
            session_id,
            params,
            Utc::now().timestamp_millis(),
        )
    }

    /// Initiator with an already-resolved peer key and an explicit clock.
    pub fn initiate_with_key(
        &self,
        peer_public: &PublicKey,
        peer_address: &str,
        session_id: &str,
        params: SessionParams,
        now_ms: i64,
    ) -> Result<(SessionInitEnvelope, HandshakeResult), HandshakeError> {
        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = *ephemeral.public_key();
        let nonce = aead::random_nonce();

        // The ephemeral secret is consumed here and never seen again.
        let handshake_key = ephemeral
            .agree(peer_public)
            .derive_key(&nonce, HANDSHAKE_INFO)
            .map_err(malformed)?;

        let session_key = SessionKey::random();
        let mut payload = SessionInitPayload {
            session_id: session_id.to_string(),
            session_key: session_key.to_hex().to_string(),
            params: params.clone(),
            timestamp: now_ms,
        };
        let plaintext = serde_json::to_vec(&payload).map(Zeroizing::new);
        payload.session_key.zeroize();
        let plaintext = plaintext.map_err(|e| HandshakeError::Malformed(e.to_string()))?;

        let ciphertext = aead::seal(
            &handshake_key,
            &nonce,
            &handshake_aad(&ephemeral_public),
            &plaintext,
        )
        .map_err(malformed)?;
        let signature = self.identity.sign(&ciphertext).map_err(malformed)?;

        let envelope = SessionInitEnvelope {
            ephemeral_public_key: public_key_to_hex(&ephemeral_public),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(&ciphertext),
            signature: signature.to_hex(),
        };
        let result = HandshakeResult {
            session_id: session_id.to_string(),
            peer_address: normalize_address(peer_address),
            params,
            session_key,
            established_at: Utc::now(),
        };
        Ok((envelope, result))
    }

    /// Responder: validate an inbound envelope against `authz` and a
    /// freshness window of `max_age_ms`.
    pub async fn respond_to_handshake(
        &self,
        envelope: &SessionInitEnvelope,
        authz: &dyn AuthorizationCheck,
        max_age_ms: u64,
    ) -> Result<HandshakeResult, HandshakeError> {
        self.respond_at(envelope, authz, max_age_ms, Utc::now().timestamp_millis())
            .await
    }

    /// Responder with an explicit clock.
    pub async fn respond_at(
        &self,
        envelope: &SessionInitEnvelope,
        authz: &dyn AuthorizationCheck,
        max_age_ms: u64,
        now_ms: i64,
    ) -> Result<HandshakeResult, HandshakeError> {
        let ephemeral_public =
            public_key_from_hex(&envelope.ephemeral_public_key).map_err(malformed)?;
        let nonce = decode_fixed::<NONCE_LEN>("nonce", &envelope.nonce).map_err(malformed)?;
        let ciphertext = hex::decode(&envelope.ciphertext)
            .map_err(|e| HandshakeError::Malformed(format!("ciphertext: {e}")))?;
        let signature = RecoverableSignature::from_hex(&envelope.signature).map_err(malformed)?;

        let handshake_key = static_agree(&self.identity, &ephemeral_public)
            .derive_key(&nonce, HANDSHAKE_INFO)
            .map_err(malformed)?;

        let plaintext = aead::open(
            &handshake_key,
            &nonce,
            &handshake_aad(&ephemeral_public),
            &ciphertext,
        )
        .map(Zeroizing::new)
        .map_err(|_| HandshakeError::DecryptionFailed)?;

        let mut payload: SessionInitPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| HandshakeError::Malformed(format!("payload: {e}")))?;
        let session_key = SessionKey::from_hex(&payload.session_key);
        payload.session_key.zeroize();
        let session_key = session_key.map_err(malformed)?;

        let signer = recover_address(&ciphertext, &signature)
            .map_err(|_| HandshakeError::SignatureInvalid)?;
        if !authz.is_authorized(&signer).await {
            return Err(HandshakeError::UnauthorizedSender { address: signer });
        }

        // Saturates on absurd timestamps, which then fall outside any window.
        let age_ms = now_ms.saturating_sub(payload.timestamp);
        if age_ms.unsigned_abs() > max_age_ms {
            return Err(HandshakeError::StaleHandshake {
                age_ms,
                window_ms: max_age_ms,
            });
        }

        Ok(HandshakeResult {
            session_id: payload.session_id,
            peer_address: signer,
            params: payload.params,
            session_key,
            established_at: Utc
                .timestamp_millis_opt(now_ms)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

/// AEAD associated data for the init payload: label plus the ephemeral key.
fn handshake_aad(ephemeral_public: &PublicKey) -> Vec<u8> {
    let mut aad = HANDSHAKE_INFO.to_vec();
    aad.extend_from_slice(&ephemeral_public.to_sec1_bytes());
    aad
}

fn malformed(e: CryptoError) -> HandshakeError {
    HandshakeError::Malformed(e.to_string())
}

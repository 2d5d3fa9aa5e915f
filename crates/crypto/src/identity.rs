//! Long-term signing identity.
//!
//! The private key never leaves this type: it is not `Serialize`, `Debug`
//! redacts it, and the only way to use it is to sign or to run the static
//! half of an ECDH.

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{NonZeroScalar, PublicKey};
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};

use crate::error::{decode_fixed, CryptoError};

pub const SIGNATURE_LEN: usize = 65;

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// `0x`-prefixed address: last 20 bytes of Keccak-256 over the uncompressed
/// public key without its SEC1 tag byte.
pub fn address_of(public_key: &PublicKey) -> String {
    let point = public_key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Normalize an address for comparison.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Parse a SEC1 public key (compressed or uncompressed) from hex.
pub fn public_key_from_hex(raw: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(raw)?;
    PublicKey::from_sec1_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Compressed SEC1 hex encoding.
pub fn public_key_to_hex(public_key: &PublicKey) -> String {
    hex::encode(public_key.to_sec1_bytes())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signatures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// ECDSA signature with recovery id, encoded `r || s || v`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature([u8; SIGNATURE_LEN]);

impl RecoverableSignature {
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(raw: &str) -> Result<Self, CryptoError> {
        decode_fixed::<SIGNATURE_LEN>("signature", raw).map(Self)
    }

    fn parts(&self) -> Result<(Signature, RecoveryId), CryptoError> {
        let signature = Signature::from_slice(&self.0[..64])
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        // Accept both raw (0/1) and Ethereum-style (27/28) recovery bytes.
        let v = self.0[64];
        let v = if v >= 27 { v - 27 } else { v };
        let recovery_id = RecoveryId::from_byte(v)
            .ok_or_else(|| CryptoError::InvalidSignature(format!("bad recovery byte {v}")))?;
        Ok((signature, recovery_id))
    }
}

impl std::fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecoverableSignature({}…)", &self.to_hex()[..16])
    }
}

/// Recover the signer address of `message` (Keccak-256 prehashed).
pub fn recover_address(message: &[u8], signature: &RecoverableSignature) -> Result<String, CryptoError> {
    let (sig, recovery_id) = signature.parts()?;
    let verifying_key = VerifyingKey::recover_from_prehash(&keccak256(message), &sig, recovery_id)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    Ok(address_of(&PublicKey::from(&verifying_key)))
}

/// Verify `signature` over `message` against a known public key.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &RecoverableSignature) -> bool {
    let Ok((sig, _)) = signature.parts() else {
        return false;
    };
    VerifyingKey::from(public_key)
        .verify_prehash(&keccak256(message), &sig)
        .is_ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The process-wide long-term keypair.  Shared read-only across sessions
/// behind an `Arc`.
pub struct IdentityKeyStore {
    signing_key: SigningKey,
    public_key: PublicKey,
    address: String,
}

impl IdentityKeyStore {
    /// Fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Load from a raw 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_slice(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Load from a hex secret, with or without `0x`.
    pub fn from_secret_hex(raw: &str) -> Result<Self, CryptoError> {
        let raw = raw.trim().trim_start_matches("0x");
        let bytes = zeroize::Zeroizing::new(hex::decode(raw)?);
        Self::from_secret_bytes(&bytes)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey::from(signing_key.verifying_key());
        let address = address_of(&public_key);
        Self {
            signing_key,
            public_key,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        public_key_to_hex(&self.public_key)
    }

    /// Sign the Keccak-256 prehash of `message`.
    pub fn sign(&self, message: &[u8]) -> Result<RecoverableSignature, CryptoError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&keccak256(message))
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(RecoverableSignature(out))
    }

    /// Static secret for the responder half of ECDH.
    pub(crate) fn secret_scalar(&self) -> &NonZeroScalar {
        self.signing_key.as_nonzero_scalar()
    }
}

impl std::fmt::Debug for IdentityKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyStore")
            .field("address", &self.address)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

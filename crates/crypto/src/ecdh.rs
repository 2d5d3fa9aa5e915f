//! Ephemeral-static ECDH on secp256k1 and HKDF key derivation.

use hkdf::Hkdf;
use k256::ecdh::{diffie_hellman, EphemeralSecret};
use k256::PublicKey;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::IdentityKeyStore;

/// A single-use ephemeral keypair.  [`agree`](Self::agree) consumes it, so
/// the private half cannot be reused for a second session; the secret is
/// zeroized when dropped.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public_key: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_key = secret.public_key();
        Self { secret, public_key }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// ECDH(ephemeral_private, peer_static_public).
    pub fn agree(self, peer_static: &PublicKey) -> SharedSecret {
        let shared = self.secret.diffie_hellman(peer_static);
        SharedSecret::from_raw(shared.raw_secret_bytes())
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &crate::identity::public_key_to_hex(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// ECDH(peer_ephemeral_public, own_static_private).
pub fn static_agree(identity: &IdentityKeyStore, peer_ephemeral: &PublicKey) -> SharedSecret {
    let shared = diffie_hellman(identity.secret_scalar(), peer_ephemeral.as_affine());
    SharedSecret::from_raw(shared.raw_secret_bytes())
}

/// The raw x-coordinate output of ECDH.  Never persisted; zeroized on drop.
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    fn from_raw(raw: &[u8]) -> Self {
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(raw);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// HKDF-SHA256(self, salt, info) → 32-byte key.
    pub fn derive_key(&self, salt: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.0.as_ref());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(info, okm.as_mut())
            .map_err(|e| CryptoError::InvalidKey(format!("hkdf expand failed: {e}")))?;
        Ok(okm)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

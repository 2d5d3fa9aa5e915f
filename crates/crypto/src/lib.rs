//! End-to-end encryption for sealwire sessions.
//!
//! - **Identity**: long-term secp256k1 keypair, Keccak-derived address,
//!   recoverable ECDSA signatures
//! - **ECDH**: ephemeral-static key agreement with single-use ephemeral keys
//! - **AEAD**: XChaCha20-Poly1305 with explicit associated data
//! - **KeyAgreement**: the signed, encrypted `session_init` handshake that
//!   transports a random session key
//! - **SessionCrypto**: per-message nonce/AAD construction, sequence
//!   tracking, and replay rejection on the post-handshake stream
//! - **Checkpoint signing**: signatures that bind progress proofs to a session
//!
//! ## Handshake flow
//!
//! 1. Initiator generates an ephemeral keypair, ECDHs with the host's static key
//! 2. HKDF-SHA256(shared, salt = nonce, info = protocol label) → handshake key
//! 3. A random session key is sealed under the handshake key and the
//!    ciphertext is signed with the initiator's identity key
//! 4. Responder repeats the ECDH with its static key, opens the payload,
//!    recovers the signer, and asks the authorization check
//! 5. Both sides hold the same session key; ephemeral secrets are gone

pub mod aead;
pub mod checkpoint;
pub mod ecdh;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod session_crypto;

pub use checkpoint::{recover_checkpoint_signer, sign_checkpoint, verify_checkpoint_signer};
pub use ecdh::{EphemeralKeyPair, SharedSecret};
pub use error::CryptoError;
pub use handshake::{
    AllowList, AuthorizationCheck, HandshakeResult, IdentityDirectory, KeyAgreement, SessionKey,
    StaticDirectory,
};
pub use identity::{address_of, keccak256, recover_address, IdentityKeyStore, RecoverableSignature};
pub use session_crypto::{MessageAad, SessionCrypto, StreamSide};

pub use k256::PublicKey;

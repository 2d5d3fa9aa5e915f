//! Checkpoint signatures.
//!
//! The signed message binds the session id, so a checkpoint lifted from one
//! session never verifies against another.

use sw_protocol::Checkpoint;

use crate::error::{decode_fixed, CryptoError};
use crate::identity::{normalize_address, recover_address, IdentityKeyStore, RecoverableSignature};

const CHECKPOINT_LABEL: &[u8] = b"sealwire/v1/checkpoint";

/// Bytes signed for a checkpoint (Keccak-256 prehashed by the signer).
pub fn checkpoint_message(
    session_id: &str,
    number: u64,
    token_count: u64,
    digest: &[u8; 32],
    timestamp: i64,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CHECKPOINT_LABEL.len() + session_id.len() + 56);
    msg.extend_from_slice(CHECKPOINT_LABEL);
    msg.extend_from_slice(session_id.as_bytes());
    msg.extend_from_slice(&number.to_be_bytes());
    msg.extend_from_slice(&token_count.to_be_bytes());
    msg.extend_from_slice(digest);
    msg.extend_from_slice(&timestamp.to_be_bytes());
    msg
}

pub fn sign_checkpoint(
    identity: &IdentityKeyStore,
    session_id: &str,
    number: u64,
    token_count: u64,
    digest: &[u8; 32],
    timestamp: i64,
) -> Result<Checkpoint, CryptoError> {
    let signature = identity.sign(&checkpoint_message(
        session_id,
        number,
        token_count,
        digest,
        timestamp,
    ))?;
    Ok(Checkpoint {
        number,
        token_count,
        digest: hex::encode(digest),
        timestamp,
        signature: signature.to_hex(),
    })
}

/// Address that signed `checkpoint` for `session_id`.
pub fn recover_checkpoint_signer(
    session_id: &str,
    checkpoint: &Checkpoint,
) -> Result<String, CryptoError> {
    let digest = decode_fixed::<32>("digest", &checkpoint.digest)?;
    let signature = RecoverableSignature::from_hex(&checkpoint.signature)?;
    let message = checkpoint_message(
        session_id,
        checkpoint.number,
        checkpoint.token_count,
        &digest,
        checkpoint.timestamp,
    );
    recover_address(&message, &signature)
}

/// True when `checkpoint` was signed by `expected_address` for `session_id`.
pub fn verify_checkpoint_signer(session_id: &str, checkpoint: &Checkpoint, expected_address: &str) -> bool {
    recover_checkpoint_signer(session_id, checkpoint)
        .map(|signer| signer == normalize_address(expected_address))
        .unwrap_or(false)
}

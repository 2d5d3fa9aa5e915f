/// Low-level cryptographic failures (key parsing, encoding, AEAD).
///
/// Handshake and stream code translate these into the protocol taxonomy
/// before they reach callers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("hex decode: {0}")]
    Hex(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("serialization: {0}")]
    Serialization(String),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        Self::Hex(e.to_string())
    }
}

/// Decode a hex field into a fixed-size array.
pub(crate) fn decode_fixed<const N: usize>(field: &str, raw: &str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(raw)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CryptoError::Hex(format!("{field}: expected {N} bytes, got {}", b.len())))
}

//! Post-handshake stream encryption.
//!
//! One [`SessionCrypto`] per session per side.  Outbound messages carry a
//! strictly increasing sequence number that is bound into the AAD together
//! with the sending side, the session id and a minute-granularity timestamp.
//! Inbound messages must authenticate, must come from the other side, and
//! must advance the high-water mark.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::Zeroizing;

use sw_domain::error::ProtocolError;
use sw_protocol::EncryptedEnvelope;

use crate::aead::{self, NONCE_LEN};
use crate::error::decode_fixed;
use crate::handshake::SessionKey;

const AAD_VERSION: u8 = 0x01;
const AAD_FIXED_LEN: usize = 1 + 1 + 8 + 8;

/// Which end of the session sealed a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    Initiator,
    Responder,
}

impl StreamSide {
    fn tag(self) -> u8 {
        match self {
            Self::Initiator => 0x49,
            Self::Responder => 0x52,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x49 => Some(Self::Initiator),
            0x52 => Some(Self::Responder),
            _ => None,
        }
    }

    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Associated data bound to every stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAad {
    pub sender: StreamSide,
    pub sequence: u64,
    /// Unix minutes at the sender.
    pub minute_bucket: i64,
    pub session_id: String,
}

impl MessageAad {
    pub fn new(sender: StreamSide, sequence: u64, session_id: &str, now_ms: i64) -> Self {
        Self {
            sender,
            sequence,
            minute_bucket: now_ms.div_euclid(60_000),
            session_id: session_id.to_string(),
        }
    }

    /// `0x01 || sender || sequence (BE) || minute bucket (BE) || session id`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AAD_FIXED_LEN + self.session_id.len());
        out.push(AAD_VERSION);
        out.push(self.sender.tag());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.minute_bucket.to_be_bytes());
        out.extend_from_slice(self.session_id.as_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() < AAD_FIXED_LEN {
            return Err(ProtocolError::MalformedEnvelope(format!(
                "aad too short: {} bytes",
                raw.len()
            )));
        }
        if raw[0] != AAD_VERSION {
            return Err(ProtocolError::MalformedEnvelope(format!(
                "unknown aad version {}",
                raw[0]
            )));
        }
        let sender = StreamSide::from_tag(raw[1]).ok_or_else(|| {
            ProtocolError::MalformedEnvelope(format!("unknown aad sender {:#04x}", raw[1]))
        })?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&raw[2..10]);
        let mut minute = [0u8; 8];
        minute.copy_from_slice(&raw[10..18]);
        let session_id = std::str::from_utf8(&raw[AAD_FIXED_LEN..])
            .map_err(|_| ProtocolError::MalformedEnvelope("aad session id is not utf-8".into()))?;
        Ok(Self {
            sender,
            sequence: u64::from_be_bytes(seq),
            minute_bucket: i64::from_be_bytes(minute),
            session_id: session_id.to_string(),
        })
    }
}

/// Symmetric engine for one session.  Owned by exactly one task; dropping it
/// zeroizes the key.
pub struct SessionCrypto {
    session_id: String,
    side: StreamSide,
    key: SessionKey,
    outbound_sequence: u64,
    inbound_high_water: u64,
}

impl SessionCrypto {
    /// The side that opened the session.
    pub fn initiator(session_id: impl Into<String>, key: SessionKey) -> Self {
        Self::new(session_id.into(), StreamSide::Initiator, key)
    }

    /// The side that accepted the session.
    pub fn responder(session_id: impl Into<String>, key: SessionKey) -> Self {
        Self::new(session_id.into(), StreamSide::Responder, key)
    }

    fn new(session_id: String, side: StreamSide, key: SessionKey) -> Self {
        Self {
            session_id,
            side,
            key,
            outbound_sequence: 0,
            inbound_high_water: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn side(&self) -> StreamSide {
        self.side
    }

    /// Last sequence number sent.
    pub fn outbound_sequence(&self) -> u64 {
        self.outbound_sequence
    }

    /// Highest inbound sequence number accepted.
    pub fn inbound_high_water(&self) -> u64 {
        self.inbound_high_water
    }

    pub fn encrypt_outbound(&mut self, plaintext: &[u8]) -> Result<EncryptedEnvelope, ProtocolError> {
        let sequence = self.outbound_sequence + 1;
        let aad = MessageAad::new(
            self.side,
            sequence,
            &self.session_id,
            Utc::now().timestamp_millis(),
        );
        let nonce = aead::random_nonce();
        let ciphertext = aead::seal(self.key.as_bytes(), &nonce, &aad.encode(), plaintext)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        // Only advance once the message exists.
        self.outbound_sequence = sequence;
        Ok(EncryptedEnvelope {
            session_id: self.session_id.clone(),
            sequence,
            nonce: hex::encode(nonce),
            aad: hex::encode(aad.encode()),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Authenticate and decrypt.  State only changes on success.
    pub fn decrypt_inbound(
        &mut self,
        envelope: &EncryptedEnvelope,
    ) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
        if envelope.session_id != self.session_id {
            return Err(ProtocolError::MalformedEnvelope(format!(
                "envelope for session {} on session {}",
                envelope.session_id, self.session_id
            )));
        }
        let aad_bytes = hex::decode(&envelope.aad)
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("aad: {e}")))?;
        let aad = MessageAad::decode(&aad_bytes)?;
        if aad.session_id != self.session_id {
            return Err(ProtocolError::MalformedEnvelope(
                "aad bound to a different session".into(),
            ));
        }
        if aad.sender != self.side.peer() {
            return Err(ProtocolError::MalformedEnvelope(
                "message sealed by this side reflected back".into(),
            ));
        }
        if aad.sequence != envelope.sequence {
            return Err(ProtocolError::SequenceViolation {
                envelope: envelope.sequence,
                aad: aad.sequence,
            });
        }
        let nonce = decode_fixed::<NONCE_LEN>("nonce", &envelope.nonce)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        let ciphertext = hex::decode(&envelope.ciphertext)
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("ciphertext: {e}")))?;

        let plaintext = aead::open(self.key.as_bytes(), &nonce, &aad_bytes, &ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailed)?;

        if aad.sequence <= self.inbound_high_water {
            return Err(ProtocolError::ReplayedMessage {
                sequence: aad.sequence,
                high_water: self.inbound_high_water,
            });
        }
        self.inbound_high_water = aad.sequence;
        Ok(Zeroizing::new(plaintext))
    }

    pub fn encrypt_json<T: Serialize>(&mut self, value: &T) -> Result<EncryptedEnvelope, ProtocolError> {
        let plaintext = serde_json::to_vec(value)
            .map(Zeroizing::new)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        self.encrypt_outbound(&plaintext)
    }

    pub fn decrypt_json<T: DeserializeOwned>(
        &mut self,
        envelope: &EncryptedEnvelope,
    ) -> Result<T, ProtocolError> {
        let plaintext = self.decrypt_inbound(envelope)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("payload: {e}")))
    }

    /// Consume and drop, zeroizing the key.
    pub fn purge(self) {
        tracing::debug!(session_id = %self.session_id, "session key purged");
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCrypto")
            .field("session_id", &self.session_id)
            .field("side", &self.side)
            .field("outbound_sequence", &self.outbound_sequence)
            .field("inbound_high_water", &self.inbound_high_water)
            .finish_non_exhaustive()
    }
}

//! Rolling transcript digest.
//!
//! `d_0 = SHA256(label || session_id)` and each checkpoint folds the content
//! produced since the previous one into the chain.  A verifier holding the
//! previous digest and the new content can check a link without replaying
//! the whole session.

use sha2::{Digest, Sha256};

const TRANSCRIPT_LABEL: &[u8] = b"sealwire/v1/transcript";

/// The chain head plus the hasher for the segment being accumulated.
#[derive(Clone)]
pub struct TranscriptDigest {
    head: [u8; 32],
    segment: Sha256,
}

impl TranscriptDigest {
    pub fn new(session_id: &str) -> Self {
        let head = Self::genesis(session_id);
        Self::resume_from(head)
    }

    /// Continue a chain whose last committed digest is `head`.
    pub fn resume_from(head: [u8; 32]) -> Self {
        let mut segment = Sha256::new();
        segment.update(head);
        Self { head, segment }
    }

    pub fn genesis(session_id: &str) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(TRANSCRIPT_LABEL);
        h.update(session_id.as_bytes());
        h.finalize().into()
    }

    /// Fold produced content into the open segment.
    pub fn absorb(&mut self, content: &[u8]) {
        self.segment.update(content);
    }

    /// Close the segment: the new head is returned and becomes the base of
    /// the next one.
    pub fn commit(&mut self) -> [u8; 32] {
        let head: [u8; 32] = std::mem::take(&mut self.segment).finalize().into();
        *self = Self::resume_from(head);
        head
    }

    /// Last committed digest.
    pub fn head(&self) -> &[u8; 32] {
        &self.head
    }

    /// One link of the chain, for verifiers: `SHA256(previous || content...)`.
    pub fn extend<'a, I>(previous: &[u8; 32], contents: I) -> [u8; 32]
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut h = Sha256::new();
        h.update(previous);
        for c in contents {
            h.update(c);
        }
        h.finalize().into()
    }
}

impl std::fmt::Debug for TranscriptDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptDigest")
            .field("head", &hex::encode(self.head))
            .finish_non_exhaustive()
    }
}

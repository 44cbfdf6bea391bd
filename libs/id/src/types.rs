//! The session identifier type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::IdError;

/// Per-process sequence mixed into every generated ID.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifier of one accepted client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId([u8; SessionId::BYTES]);

impl SessionId {
    /// Number of digest bytes kept.
    pub const BYTES: usize = 7;

    /// Length of the canonical string form.
    pub const ENCODED_LEN: usize = Self::BYTES * 2;

    /// Generates a fresh ID from the current time.
    #[must_use]
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self::from_seed(nanos, sequence)
    }

    /// Derives an ID from an explicit timestamp and sequence number.
    #[must_use]
    pub fn from_seed(nanos: u128, sequence: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(nanos.to_string().as_bytes());
        hasher.update(sequence.to_be_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; Self::BYTES];
        bytes.copy_from_slice(&digest[..Self::BYTES]);
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::BYTES] {
        &self.0
    }

    /// Parses an ID from its canonical lowercase hex form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if s.len() != Self::ENCODED_LEN {
            return Err(IdError::InvalidLength {
                expected: Self::ENCODED_LEN,
                actual: s.len(),
            });
        }

        if let Some((position, found)) = s
            .char_indices()
            .find(|(_, c)| !matches!(c, '0'..='9' | 'a'..='f'))
        {
            return Err(IdError::InvalidCharacter { found, position });
        }

        let mut bytes = [0u8; Self::BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| IdError::InvalidLength {
            expected: Self::ENCODED_LEN,
            actual: s.len(),
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::str::FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

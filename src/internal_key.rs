//! Internal key format of backed-up SST entries.
//!
//! Entries are ordered by `(user_key ASC, seqno DESC)`, the same order the
//! storage engine writes them in. Value stripping relies on this order being
//! preserved byte for byte when a file is rewritten.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input")]
    Truncated,

    #[error("unknown entry kind: {0}")]
    UnknownKind(u8),

    #[error("user key of {0} bytes cannot be encoded")]
    KeyTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyKind {
    /// Point tombstone.
    Del = 0,
    /// Point key/value.
    Put = 1,
}

impl KeyKind {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Del),
            1 => Ok(Self::Put),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    pub fn is_tombstone(self) -> bool {
        matches!(self, Self::Del)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seqno: u64,
    pub kind: KeyKind,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Bytes>, seqno: u64, kind: KeyKind) -> Self {
        Self {
            user_key: user_key.into(),
            seqno,
            kind,
        }
    }

    pub fn put(user_key: impl Into<Bytes>, seqno: u64) -> Self {
        Self::new(user_key, seqno, KeyKind::Put)
    }

    pub fn delete(user_key: impl Into<Bytes>, seqno: u64) -> Self {
        Self::new(user_key, seqno, KeyKind::Del)
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.user_key.len() + 8 + 1
    }

    /// Appends `[len u32][user_key][seqno u64][kind u8]` to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), DecodeError> {
        let user_key_len: u32 = self
            .user_key
            .len()
            .try_into()
            .map_err(|_| DecodeError::KeyTooLarge(self.user_key.len()))?;
        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&user_key_len.to_le_bytes());
        buf.extend_from_slice(self.user_key.as_ref());
        buf.extend_from_slice(&self.seqno.to_le_bytes());
        buf.push(self.kind as u8);
        Ok(())
    }

    pub fn decode(input: &[u8]) -> Result<(Self, usize), DecodeError> {
        let len_bytes: [u8; 4] = input
            .get(0..4)
            .and_then(|s| s.try_into().ok())
            .ok_or(DecodeError::Truncated)?;
        let user_key_len = u32::from_le_bytes(len_bytes) as usize;
        let needed = 4 + user_key_len + 8 + 1;
        if input.len() < needed {
            return Err(DecodeError::Truncated);
        }

        let user_key = Bytes::copy_from_slice(&input[4..(4 + user_key_len)]);
        let seqno_offset = 4 + user_key_len;
        let mut seqno_bytes = [0u8; 8];
        seqno_bytes.copy_from_slice(&input[seqno_offset..(seqno_offset + 8)]);
        let kind = KeyKind::from_u8(input[seqno_offset + 8])?;

        Ok((
            Self {
                user_key,
                seqno: u64::from_le_bytes(seqno_bytes),
                kind,
            },
            needed,
        ))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.seqno.cmp(&self.seqno))
            .then_with(|| (other.kind as u8).cmp(&(self.kind as u8)))
    }
}

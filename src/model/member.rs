//! Party member record
//!
//! Layout (little-endian, 60 bytes):
//! - 0..2   species id (0 = empty slot)
//! - 2      level
//! - 3      padding
//! - 4..14  nickname, null padded
//! - 14..58 reserved, kept opaque
//! - 58..60 sprite index

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SPECIES_OFFSET: usize = 0;
const LEVEL_OFFSET: usize = 2;
const NICKNAME_OFFSET: usize = 4;
const RESERVED_OFFSET: usize = NICKNAME_OFFSET + NICKNAME_LEN;
const IMAGE_INDEX_OFFSET: usize = RESERVED_OFFSET + RESERVED_LEN;

/// Width of the nickname buffer
pub const NICKNAME_LEN: usize = 10;

/// Width of the uninterpreted block
pub const RESERVED_LEN: usize = 44;

/// Bytes covered by the layout
pub const RECORD_LEN: usize = IMAGE_INDEX_OFFSET + 2;

/// Species id marking an unoccupied slot
pub const EMPTY_SPECIES: u16 = 0;

/// Decode errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record too short: {actual} bytes (need {})", RECORD_LEN)]
    TooShort { actual: usize },
}

/// One team slot as laid out in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyMember {
    pub species_id: u16,
    pub level: u8,
    pub nickname_raw: [u8; NICKNAME_LEN],
    pub reserved: [u8; RESERVED_LEN],
    pub image_index: u16,
}

impl PartyMember {
    /// Decode a record from at least `RECORD_LEN` bytes; anything past the
    /// layout is ignored
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < RECORD_LEN {
            return Err(DecodeError::TooShort {
                actual: bytes.len(),
            });
        }

        let mut nickname_raw = [0u8; NICKNAME_LEN];
        nickname_raw.copy_from_slice(&bytes[NICKNAME_OFFSET..RESERVED_OFFSET]);

        let mut reserved = [0u8; RESERVED_LEN];
        reserved.copy_from_slice(&bytes[RESERVED_OFFSET..IMAGE_INDEX_OFFSET]);

        Ok(Self {
            species_id: read_u16_le(bytes, SPECIES_OFFSET),
            level: bytes[LEVEL_OFFSET],
            nickname_raw,
            reserved,
            image_index: read_u16_le(bytes, IMAGE_INDEX_OFFSET),
        })
    }

    /// True if the slot holds no entity
    pub fn is_empty(&self) -> bool {
        self.species_id == EMPTY_SPECIES
    }

    /// Nickname with trailing nulls stripped
    pub fn nickname(&self) -> String {
        let end = self
            .nickname_raw
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |p| p + 1);
        String::from_utf8_lossy(&self.nickname_raw[..end]).into_owned()
    }

    /// Plain view used for JSON output
    pub fn summary(&self) -> MemberSummary {
        MemberSummary {
            species_id: self.species_id,
            level: self.level,
            nickname: self.nickname(),
            image_index: self.image_index,
        }
    }
}

/// Interpreted fields of a `PartyMember`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub species_id: u16,
    pub level: u8,
    pub nickname: String,
    pub image_index: u16,
}

fn read_u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

//! Team assembly
//!
//! Reads the fixed block of team slots and keeps the occupied ones.

use thiserror::Error;

use crate::model::{DecodeError, PartyMember, RECORD_LEN};
use crate::network::{ClientError, ReadMemory};

/// Number of slots in a team
pub const TEAM_SLOTS: usize = 6;

/// Team assembly errors
#[derive(Error, Debug)]
pub enum TeamError {
    #[error("Read failed for slot {slot} at {address:#x}: {source}")]
    Read {
        slot: usize,
        address: u64,
        #[source]
        source: ClientError,
    },

    #[error("Decode failed for slot {slot}: {source}")]
    Decode {
        slot: usize,
        #[source]
        source: DecodeError,
    },

    #[error("Record size {0} is smaller than the record layout")]
    RecordTooSmall(usize),

    #[error("Address of slot {slot} overflows")]
    AddressOverflow { slot: usize },
}

pub type TeamResult<T> = Result<T, TeamError>;

/// Where the team lives in the target's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamLayout {
    /// Address of slot 0
    pub base_offset: u64,
    /// Stride between slots, also the read length per slot
    pub record_size: usize,
}

impl TeamLayout {
    pub fn new(base_offset: u64, record_size: usize) -> TeamResult<Self> {
        if record_size < RECORD_LEN {
            return Err(TeamError::RecordTooSmall(record_size));
        }
        Ok(Self {
            base_offset,
            record_size,
        })
    }

    /// Address of `slot`
    pub fn slot_address(&self, slot: usize) -> TeamResult<u64> {
        (slot as u64)
            .checked_mul(self.record_size as u64)
            .and_then(|offset| self.base_offset.checked_add(offset))
            .ok_or(TeamError::AddressOverflow { slot })
    }

    /// Read and decode the occupied slots, in slot order
    pub async fn read_team<R>(&self, reader: &mut R) -> TeamResult<Vec<PartyMember>>
    where
        R: ReadMemory + ?Sized,
    {
        get_team(reader, self.base_offset, self.record_size).await
    }
}

/// Read all team slots starting at `base_offset`, skipping empty ones.
///
/// Any failed slot aborts the whole read; a partial team is never returned.
pub async fn get_team<R>(
    reader: &mut R,
    base_offset: u64,
    record_size: usize,
) -> TeamResult<Vec<PartyMember>>
where
    R: ReadMemory + ?Sized,
{
    let layout = TeamLayout::new(base_offset, record_size)?;
    let mut team = Vec::with_capacity(TEAM_SLOTS);

    for slot in 0..TEAM_SLOTS {
        let address = layout.slot_address(slot)?;
        let raw = reader
            .read_memory(address, record_size)
            .await
            .map_err(|source| TeamError::Read {
                slot,
                address,
                source,
            })?;

        let member =
            PartyMember::decode(&raw).map_err(|source| TeamError::Decode { slot, source })?;

        if member.is_empty() {
            tracing::trace!("Slot {} empty", slot);
            continue;
        }
        team.push(member);
    }

    Ok(team)
}

//! The Block Allocation Table: one big-endian u32 sector offset per block,
//! padded with unused entries up to a sector boundary.

use crate::util::be_u32;
use crate::{Result, SECTOR_SIZE, VhdError};

/// Marker for a block with no backing storage.
pub const BAT_UNUSED: u32 = 0xFFFF_FFFF;

/// Cap on `max_table_entries` when reading untrusted images: 16 MiB of BAT,
/// i.e. 8 TiB of disk at the canonical 2 MiB block size.
pub const MAX_BAT_ENTRIES: u32 = 4 * 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bat {
    entries: Vec<u32>,
    /// Largest sector offset held by any used entry. Blocks are allocated
    /// append-only, so this is the start of the last block in the file.
    highest_value: Option<u32>,
}

impl Bat {
    /// A fresh table of `entries` unused slots, padded to a sector boundary.
    pub fn new(entries: u32) -> Result<Self> {
        if entries > MAX_BAT_ENTRIES {
            return Err(VhdError::TableTooLarge {
                entries,
                max: MAX_BAT_ENTRIES,
            });
        }
        let padded = padded_entry_count(entries);
        Ok(Self {
            entries: vec![BAT_UNUSED; padded],
            highest_value: None,
        })
    }

    /// Parse a sector-padded BAT buffer of `entries` used slots.
    pub fn parse(buf: &[u8], entries: u32) -> Result<Self> {
        if entries > MAX_BAT_ENTRIES {
            return Err(VhdError::TableTooLarge {
                entries,
                max: MAX_BAT_ENTRIES,
            });
        }
        let padded = padded_entry_count(entries);
        if buf.len() < padded * 4 {
            return Err(VhdError::CorruptImage("allocation table truncated"));
        }

        let mut table = Vec::with_capacity(padded);
        let mut highest_value = None;
        for (i, chunk) in buf[..padded * 4].chunks_exact(4).enumerate() {
            let value = be_u32(chunk);
            if i < entries as usize && value != BAT_UNUSED {
                highest_value = Some(highest_value.map_or(value, |h: u32| h.max(value)));
            }
            table.push(value);
        }

        Ok(Self {
            entries: table,
            highest_value,
        })
    }

    /// Slot count including the sector padding.
    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.highest_value.is_none()
    }

    pub fn get(&self, block: u32) -> u32 {
        self.entries
            .get(block as usize)
            .copied()
            .unwrap_or(BAT_UNUSED)
    }

    pub fn set(&mut self, block: u32, sector: u32) {
        self.entries[block as usize] = sector;
        if sector != BAT_UNUSED {
            self.highest_value = Some(self.highest_value.map_or(sector, |h| h.max(sector)));
        }
    }

    /// Largest sector offset among used entries, if any block is allocated.
    pub fn highest_value(&self) -> Option<u32> {
        self.highest_value
    }

    /// Iterator over the used entries.
    pub fn iter_used(&self, entries: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries
            .iter()
            .take(entries as usize)
            .enumerate()
            .filter(|(_, v)| **v != BAT_UNUSED)
            .map(|(i, v)| (i as u32, *v))
    }

    /// The sector-padded on-disk form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 4);
        for entry in &self.entries {
            out.extend_from_slice(&entry.to_be_bytes());
        }
        out
    }

    /// On-disk size in bytes of a table with `entries` used slots.
    pub fn size_bytes(entries: u32) -> u64 {
        padded_entry_count(entries) as u64 * 4
    }
}

fn padded_entry_count(entries: u32) -> usize {
    let bytes = (entries as u64 * 4).div_ceil(SECTOR_SIZE as u64) * SECTOR_SIZE as u64;
    (bytes / 4) as usize
}

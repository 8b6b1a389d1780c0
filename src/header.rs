//! The 1024-byte sparse ("dynamic disk") header that follows the head footer
//! of dynamic and differencing images, including the parent locator table.

use uuid::Uuid;

use crate::util::{be_u32, be_u64};
use crate::{Result, SECTOR_SIZE, VhdError, checksum, utf16};

pub const HEADER_MAGIC: &[u8; 8] = b"cxsparse";
pub const HEADER_VERSION: u32 = 0x0001_0000;
/// The sparse header's `data_offset` is unused and always all-ones.
pub const HEADER_DATA_OFFSET: u64 = u64::MAX;

/// Canonical block size: 2 MiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

const CHECKSUM_FIELD: std::ops::Range<usize> = 36..40;
const NAME_FIELD: std::ops::Range<usize> = 64..576;
const LOCATOR_TABLE: usize = 576;
pub const LOCATOR_COUNT: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlatformCode {
    None,
    Wi2r,
    Wi2k,
    W2ru,
    W2ku,
    Mac,
    MacX,
}

impl PlatformCode {
    pub fn to_u32(self) -> u32 {
        match self {
            PlatformCode::None => 0,
            PlatformCode::Wi2r => u32::from_be_bytes(*b"Wi2r"),
            PlatformCode::Wi2k => u32::from_be_bytes(*b"Wi2k"),
            PlatformCode::W2ru => u32::from_be_bytes(*b"W2ru"),
            PlatformCode::W2ku => u32::from_be_bytes(*b"W2ku"),
            PlatformCode::Mac => u32::from_be_bytes(*b"Mac "),
            PlatformCode::MacX => u32::from_be_bytes(*b"MacX"),
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match &value.to_be_bytes() {
            [0, 0, 0, 0] => Ok(PlatformCode::None),
            b"Wi2r" => Ok(PlatformCode::Wi2r),
            b"Wi2k" => Ok(PlatformCode::Wi2k),
            b"W2ru" => Ok(PlatformCode::W2ru),
            b"W2ku" => Ok(PlatformCode::W2ku),
            b"Mac " => Ok(PlatformCode::Mac),
            b"MacX" => Ok(PlatformCode::MacX),
            _ => Err(VhdError::UnknownPlatformCode(value)),
        }
    }
}

/// One of the eight parent locator slots.
///
/// The format document defines `data_space` in sectors, but tools in the
/// wild also store a byte count there. The raw value is kept so re-encoding
/// is byte-faithful; [`ParentLocator::data_space_bytes`] applies the decode
/// rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParentLocator {
    pub code: PlatformCode,
    pub data_space_raw: u32,
    pub data_length: u32,
    pub data_offset: u64,
}

/// Bound on a locator's reserved payload space; real payloads are a path or
/// URI, well under a sector or two.
const MAX_LOCATOR_SPACE: u64 = 64 * 1024;

impl ParentLocator {
    pub const SIZE: usize = 24;

    pub fn null() -> Self {
        Self {
            code: PlatformCode::None,
            data_space_raw: 0,
            data_length: 0,
            data_offset: 0,
        }
    }

    /// Reserved space for the payload in bytes: raw values below 512 are
    /// sector counts, anything else is already bytes.
    pub fn data_space_bytes(&self) -> u64 {
        if self.data_space_raw < SECTOR_SIZE as u32 {
            self.data_space_raw as u64 * SECTOR_SIZE as u64
        } else {
            self.data_space_raw as u64
        }
    }

    fn marshal_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.code.to_u32().to_be_bytes());
        buf[4..8].copy_from_slice(&self.data_space_raw.to_be_bytes());
        buf[8..12].copy_from_slice(&self.data_length.to_be_bytes());
        // 12..16 reserved.
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
    }

    fn unmarshal(buf: &[u8]) -> Result<Self> {
        let locator = Self {
            code: PlatformCode::from_u32(be_u32(&buf[0..4]))?,
            data_space_raw: be_u32(&buf[4..8]),
            data_length: be_u32(&buf[8..12]),
            data_offset: be_u64(&buf[16..24]),
        };
        // Catch a corrupt slot at parse time instead of when the payload is
        // eventually read.
        if locator.code != PlatformCode::None {
            if locator.data_space_bytes() > MAX_LOCATOR_SPACE {
                return Err(VhdError::CorruptImage(
                    "parent locator space out of range",
                ));
            }
            if locator.data_length as u64 > locator.data_space_bytes() {
                return Err(VhdError::CorruptImage(
                    "parent locator length exceeds its space",
                ));
            }
        }
        Ok(locator)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SparseHeader {
    /// Absolute byte offset of the BAT.
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_unique_id: Uuid,
    pub parent_time_stamp: u32,
    pub parent_unicode_name: String,
    pub parent_locators: [ParentLocator; LOCATOR_COUNT],
}

impl SparseHeader {
    pub const SIZE: usize = 1024;

    /// Sectors per block.
    pub fn sectors_per_block(&self) -> u32 {
        self.block_size / SECTOR_SIZE as u32
    }

    /// log2 of sectors per block; valid because `block_size` is a power of
    /// two of at least 512.
    pub fn block_size_sectors_shift(&self) -> u32 {
        self.sectors_per_block().trailing_zeros()
    }

    /// Serialize, recomputing and storing the checksum.
    pub fn marshal(&mut self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(HEADER_MAGIC);
        buf[8..16].copy_from_slice(&HEADER_DATA_OFFSET.to_be_bytes());
        buf[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        buf[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        buf[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        // Checksum field is zero at this point.
        buf[40..56].copy_from_slice(self.parent_unique_id.as_bytes());
        buf[56..60].copy_from_slice(&self.parent_time_stamp.to_be_bytes());

        let name = utf16::encode_be(&self.parent_unicode_name);
        let name_len = name.len().min(NAME_FIELD.len());
        buf[NAME_FIELD.start..NAME_FIELD.start + name_len].copy_from_slice(&name[..name_len]);

        for (i, locator) in self.parent_locators.iter().enumerate() {
            let start = LOCATOR_TABLE + i * ParentLocator::SIZE;
            locator.marshal_into(&mut buf[start..start + ParentLocator::SIZE]);
        }

        self.checksum = checksum::of_bytes(&buf);
        buf[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(VhdError::CorruptImage("sparse header truncated"));
        }
        let buf = &buf[..Self::SIZE];
        if &buf[0..8] != HEADER_MAGIC {
            return Err(VhdError::BadMagic {
                expected: HEADER_MAGIC,
                found: buf[0..8].to_vec(),
            });
        }
        let version = be_u32(&buf[24..28]);
        if version != HEADER_VERSION {
            return Err(VhdError::BadVersion {
                expected: HEADER_VERSION,
                found: version,
            });
        }
        let stored = be_u32(&buf[36..40]);
        let computed = checksum::without_field(buf, CHECKSUM_FIELD);
        if stored != computed {
            return Err(VhdError::ChecksumMismatch { stored, computed });
        }

        let block_size = be_u32(&buf[32..36]);
        if block_size < SECTOR_SIZE as u32 || !block_size.is_power_of_two() {
            return Err(VhdError::InvalidBlockSize(block_size));
        }

        let mut parent_locators = [ParentLocator::null(); LOCATOR_COUNT];
        for (i, slot) in parent_locators.iter_mut().enumerate() {
            let start = LOCATOR_TABLE + i * ParentLocator::SIZE;
            *slot = ParentLocator::unmarshal(&buf[start..start + ParentLocator::SIZE])?;
        }

        Ok(Self {
            table_offset: be_u64(&buf[16..24]),
            max_table_entries: be_u32(&buf[28..32]),
            block_size,
            checksum: stored,
            parent_unique_id: Uuid::from_bytes(buf[40..56].try_into().expect("16-byte slice")),
            parent_time_stamp: be_u32(&buf[56..60]),
            parent_unicode_name: utf16::decode(&buf[NAME_FIELD])?,
            parent_locators,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SparseHeader {
        let mut locators = [ParentLocator::null(); LOCATOR_COUNT];
        locators[0] = ParentLocator {
            code: PlatformCode::MacX,
            data_space_raw: 1,
            data_length: 22,
            data_offset: 1536,
        };
        SparseHeader {
            table_offset: 2048,
            max_table_entries: 2,
            block_size: DEFAULT_BLOCK_SIZE,
            checksum: 0,
            parent_unique_id: Uuid::from_bytes([3; 16]),
            parent_time_stamp: 77,
            parent_unicode_name: "parent.vhd".to_string(),
            parent_locators: locators,
        }
    }

    #[test]
    fn marshal_unmarshal_round_trips() {
        let mut header = sample();
        let buf = header.marshal();
        let parsed = SparseHeader::unmarshal(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.clone().marshal(), buf);
    }

    #[test]
    fn checksum_tamper_is_detected() {
        let mut header = sample();
        let mut buf = header.marshal();
        buf[100] ^= 0x01;
        assert!(matches!(
            SparseHeader::unmarshal(&buf).unwrap_err(),
            VhdError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn non_power_of_two_block_size_is_rejected() {
        let mut header = sample();
        header.block_size = 3 * 1024 * 1024;
        let buf = header.marshal();
        assert!(matches!(
            SparseHeader::unmarshal(&buf).unwrap_err(),
            VhdError::InvalidBlockSize(_)
        ));
    }

    #[test]
    fn unknown_platform_code_is_rejected() {
        let mut header = sample();
        let mut buf = header.marshal();
        buf[LOCATOR_TABLE..LOCATOR_TABLE + 4].copy_from_slice(b"Qemu");
        let fixed = checksum::without_field(&buf, 36..40);
        buf[36..40].copy_from_slice(&fixed.to_be_bytes());
        assert!(matches!(
            SparseHeader::unmarshal(&buf).unwrap_err(),
            VhdError::UnknownPlatformCode(_)
        ));
    }

    #[test]
    fn locator_length_beyond_its_space_is_rejected() {
        let mut header = sample();
        header.parent_locators[0].data_length = 600; // space is 1 sector
        let buf = header.marshal();
        assert!(matches!(
            SparseHeader::unmarshal(&buf).unwrap_err(),
            VhdError::CorruptImage("parent locator length exceeds its space")
        ));
    }

    #[test]
    fn locator_with_absurd_space_is_rejected() {
        let mut header = sample();
        header.parent_locators[0].data_space_raw = 0xFFFF_FFFE;
        let buf = header.marshal();
        assert!(matches!(
            SparseHeader::unmarshal(&buf).unwrap_err(),
            VhdError::CorruptImage("parent locator space out of range")
        ));
    }

    #[test]
    fn locator_space_decode_tolerates_the_sectors_vs_bytes_deviation() {
        // The format document says sectors.
        let sectors = ParentLocator {
            code: PlatformCode::MacX,
            data_space_raw: 1,
            data_length: 20,
            data_offset: 1536,
        };
        assert_eq!(sectors.data_space_bytes(), 512);

        // Others write bytes; anything >= 512 is taken at face value.
        let bytes = ParentLocator {
            data_space_raw: 512,
            ..sectors
        };
        assert_eq!(bytes.data_space_bytes(), 512);

        let larger = ParentLocator {
            data_space_raw: 4096,
            ..sectors
        };
        assert_eq!(larger.data_space_bytes(), 4096);
    }

    #[test]
    fn block_size_shift_matches_canonical_block() {
        let header = sample();
        assert_eq!(header.sectors_per_block(), 4096);
        assert_eq!(header.block_size_sectors_shift(), 12);
    }
}

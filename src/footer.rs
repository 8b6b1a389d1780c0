//! The 512-byte footer present at the tail of every VHD (and mirrored at the
//! head of dynamic and differencing files).

use uuid::Uuid;

use crate::backend::StorageBackend;
use crate::geometry::Geometry;
use crate::util::{be_u16, be_u32, be_u64};
use crate::{Result, SECTOR_SIZE, VhdError, checksum};

pub const FOOTER_MAGIC: &[u8; 8] = b"conectix";
pub const FOOTER_VERSION: u32 = 0x0001_0000;
/// `data_offset` value marking a fixed disk (no sparse header follows).
pub const FIXED_DATA_OFFSET: u64 = u64::MAX;

const CHECKSUM_FIELD: std::ops::Range<usize> = 64..68;

/// Footer feature bits. Bit 1 is reserved and always set by producers; bit 0
/// marks a temporary disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Features(pub u32);

impl Features {
    pub const RESERVED: u32 = 0x2;
    pub const TEMPORARY: u32 = 0x1;

    pub fn new(temporary: bool) -> Self {
        Self(Self::RESERVED | if temporary { Self::TEMPORARY } else { 0 })
    }

    pub fn is_temporary(&self) -> bool {
        self.0 & Self::TEMPORARY != 0
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::new(false)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    pub fn to_u32(self) -> u32 {
        match self {
            DiskType::Fixed => 2,
            DiskType::Dynamic => 3,
            DiskType::Differencing => 4,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            other => Err(VhdError::UnknownDiskType(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostOs {
    Windows,
    Macintosh,
    Other(u32),
}

impl HostOs {
    const WINDOWS: u32 = 0x5769_326B; // "Wi2k"
    const MACINTOSH: u32 = 0x4D61_6320; // "Mac "

    pub fn to_u32(self) -> u32 {
        match self {
            HostOs::Windows => Self::WINDOWS,
            HostOs::Macintosh => Self::MACINTOSH,
            HostOs::Other(raw) => raw,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            Self::WINDOWS => HostOs::Windows,
            Self::MACINTOSH => HostOs::Macintosh,
            other => HostOs::Other(other),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Footer {
    pub features: Features,
    /// Byte offset of the sparse header, or [`FIXED_DATA_OFFSET`].
    pub data_offset: u64,
    /// Seconds since 2000-01-01 00:00:00 UTC.
    pub time_stamp: u32,
    pub creator_application: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: HostOs,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub uid: Uuid,
    pub saved_state: bool,
}

impl Footer {
    pub const SIZE: usize = SECTOR_SIZE;

    /// Creator tag written into images produced by this library.
    pub const CREATOR_APPLICATION: [u8; 4] = *b"vhds";
    pub const CREATOR_VERSION: u32 = 0x0001_0000;

    /// Serialize, recomputing and storing the checksum.
    pub fn marshal(&mut self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(FOOTER_MAGIC);
        buf[8..12].copy_from_slice(&self.features.0.to_be_bytes());
        buf[12..16].copy_from_slice(&FOOTER_VERSION.to_be_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.time_stamp.to_be_bytes());
        buf[28..32].copy_from_slice(&self.creator_application);
        buf[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        buf[36..40].copy_from_slice(&self.creator_host_os.to_u32().to_be_bytes());
        buf[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..58].copy_from_slice(&self.geometry.cylinders.to_be_bytes());
        buf[58] = self.geometry.heads;
        buf[59] = self.geometry.sectors;
        buf[60..64].copy_from_slice(&self.disk_type.to_u32().to_be_bytes());
        // Checksum field is zero at this point.
        buf[68..84].copy_from_slice(self.uid.as_bytes());
        buf[84] = self.saved_state as u8;

        self.checksum = checksum::of_bytes(&buf);
        buf[64..68].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(VhdError::CorruptImage("footer truncated"));
        }
        let buf = &buf[..Self::SIZE];
        if &buf[0..8] != FOOTER_MAGIC {
            return Err(VhdError::BadMagic {
                expected: FOOTER_MAGIC,
                found: buf[0..8].to_vec(),
            });
        }
        let version = be_u32(&buf[12..16]);
        if version != FOOTER_VERSION {
            return Err(VhdError::BadVersion {
                expected: FOOTER_VERSION,
                found: version,
            });
        }
        let stored = be_u32(&buf[64..68]);
        let computed = checksum::without_field(buf, CHECKSUM_FIELD);
        if stored != computed {
            return Err(VhdError::ChecksumMismatch { stored, computed });
        }

        Ok(Self {
            features: Features(be_u32(&buf[8..12])),
            data_offset: be_u64(&buf[16..24]),
            time_stamp: be_u32(&buf[24..28]),
            creator_application: [buf[28], buf[29], buf[30], buf[31]],
            creator_version: be_u32(&buf[32..36]),
            creator_host_os: HostOs::from_u32(be_u32(&buf[36..40])),
            original_size: be_u64(&buf[40..48]),
            current_size: be_u64(&buf[48..56]),
            geometry: Geometry {
                cylinders: be_u16(&buf[56..58]),
                heads: buf[58],
                sectors: buf[59],
            },
            disk_type: DiskType::from_u32(be_u32(&buf[60..64]))?,
            checksum: stored,
            uid: Uuid::from_bytes(buf[68..84].try_into().expect("16-byte slice")),
            saved_state: buf[84] != 0,
        })
    }

    /// Check whether a backend looks like a VHD: the cookie at the tail (all
    /// variants) or at the head (dynamic and differencing).
    pub fn probe<B: StorageBackend>(backend: &mut B) -> Result<bool> {
        let len = backend.size()?;
        if len < Self::SIZE as u64 {
            return Ok(false);
        }
        let mut cookie = [0u8; 8];
        backend.read_exact_at(len - Self::SIZE as u64, &mut cookie)?;
        if &cookie == FOOTER_MAGIC {
            return Ok(true);
        }
        backend.read_exact_at(0, &mut cookie)?;
        Ok(&cookie == FOOTER_MAGIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    fn sample(disk_type: DiskType) -> Footer {
        let size = 4 * 1024 * 1024u64;
        Footer {
            features: Features::default(),
            data_offset: if disk_type == DiskType::Fixed {
                FIXED_DATA_OFFSET
            } else {
                512
            },
            time_stamp: 0x0123_4567,
            creator_application: Footer::CREATOR_APPLICATION,
            creator_version: Footer::CREATOR_VERSION,
            creator_host_os: HostOs::Other(0),
            original_size: size,
            current_size: size,
            geometry: Geometry::of_sectors(size / SECTOR_SIZE as u64),
            disk_type,
            checksum: 0,
            uid: Uuid::from_bytes([9; 16]),
            saved_state: false,
        }
    }

    #[test]
    fn marshal_unmarshal_round_trips() {
        let mut footer = sample(DiskType::Dynamic);
        let buf = footer.marshal();
        let parsed = Footer::unmarshal(&buf).unwrap();
        assert_eq!(parsed, footer);

        // And the buffer itself round-trips.
        assert_eq!(parsed.clone().marshal(), buf);
    }

    #[test]
    fn fixed_footers_parse_even_though_fixed_io_is_unsupported() {
        let mut footer = sample(DiskType::Fixed);
        let parsed = Footer::unmarshal(&footer.marshal()).unwrap();
        assert_eq!(parsed.data_offset, FIXED_DATA_OFFSET);
        assert_eq!(parsed.disk_type, DiskType::Fixed);
    }

    #[test]
    fn tampering_any_byte_is_detected() {
        let mut footer = sample(DiskType::Dynamic);
        let good = footer.marshal();
        for position in [8, 30, 47, 84, 200, 511] {
            let mut bad = good;
            bad[position] ^= 0x40;
            match Footer::unmarshal(&bad) {
                Err(VhdError::ChecksumMismatch { stored, computed }) => {
                    assert_ne!(stored, computed)
                }
                other => panic!("expected checksum mismatch at {position}, got {other:?}"),
            }
        }
    }

    #[test]
    fn wrong_magic_and_version_are_reported_first() {
        let mut footer = sample(DiskType::Dynamic);
        let good = footer.marshal();

        let mut bad = good;
        bad[0..8].copy_from_slice(b"notavhd!");
        assert!(matches!(
            Footer::unmarshal(&bad).unwrap_err(),
            VhdError::BadMagic { .. }
        ));

        let mut bad = good;
        bad[12..16].copy_from_slice(&0x0002_0000u32.to_be_bytes());
        assert!(matches!(
            Footer::unmarshal(&bad).unwrap_err(),
            VhdError::BadVersion { .. }
        ));
    }

    #[test]
    fn unknown_disk_type_is_rejected() {
        let mut footer = sample(DiskType::Dynamic);
        let mut buf = footer.marshal();
        buf[60..64].copy_from_slice(&7u32.to_be_bytes());
        // Fix the checksum so the disk type check is what trips.
        let fixed = checksum::without_field(&buf, 64..68);
        buf[64..68].copy_from_slice(&fixed.to_be_bytes());
        assert!(matches!(
            Footer::unmarshal(&buf).unwrap_err(),
            VhdError::UnknownDiskType(7)
        ));
    }

    #[test]
    fn probe_detects_head_and_tail_cookies() {
        let mut footer = sample(DiskType::Dynamic);
        let buf = footer.marshal();

        let mut head = MemBackend::with_len(4096).unwrap();
        head.write_all_at(0, &buf).unwrap();
        assert!(Footer::probe(&mut head).unwrap());

        let mut tail = MemBackend::with_len(4096).unwrap();
        tail.write_all_at(4096 - 512, &buf).unwrap();
        assert!(Footer::probe(&mut tail).unwrap());

        let mut neither = MemBackend::with_len(4096).unwrap();
        assert!(!Footer::probe(&mut neither).unwrap());
    }
}

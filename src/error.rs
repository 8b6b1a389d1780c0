use thiserror::Error;

pub type Result<T> = std::result::Result<T, VhdError>;

#[derive(Debug, Error)]
pub enum VhdError {
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic {
        expected: &'static [u8],
        found: Vec<u8>,
    },

    #[error("unsupported structure version {found:#010x} (expected {expected:#010x})")]
    BadVersion { expected: u32, found: u32 },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("unknown disk type {0}")]
    UnknownDiskType(u32),

    #[error("unknown parent locator platform code {0:#010x}")]
    UnknownPlatformCode(u32),

    #[error("block size {0} is not a power of two of at least 512")]
    InvalidBlockSize(u32),

    #[error("allocation table has {entries} entries, more than the supported {max}")]
    TableTooLarge { entries: u32, max: u32 },

    #[error("virtual size {size} exceeds table capacity {capacity}")]
    SizeExceedsTable { size: u64, capacity: u64 },

    #[error("invalid virtual sector {sector} (disk has {max} sectors)")]
    InvalidSector { sector: u64, max: u64 },

    #[error("parent image {0:?} not found via any locator or search path")]
    ParentNotFound(String),

    #[error("parent uuid mismatch: child expects {expected}, parent file has {found}")]
    ParentUuidMismatch {
        expected: uuid::Uuid,
        found: uuid::Uuid,
    },

    #[error("invalid UTF-16 in parent name: {0}")]
    InvalidUtf16(&'static str),

    #[error("operation not supported on a fixed disk")]
    FixedDiskUnsupported,

    #[error("corrupt image: {0}")]
    CorruptImage(&'static str),

    #[error("on-disk structures overlap: [{a_start}, {a_end}) and [{b_start}, {b_end})")]
    ExtentsOverlap {
        a_start: u64,
        a_end: u64,
        b_start: u64,
        b_end: u64,
    },

    #[error("buffer length {len} is not a whole number of sectors")]
    UnalignedBuffer { len: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VhdError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

//! Read, write, and stream VHD images in the Connectix/Microsoft format.
//!
//! The three standard variants are supported: fixed (codec only), dynamic
//! (sparse, zero holes), and differencing (copy-on-write over a parent
//! chain). The crate provides:
//!
//! - [`Footer`], [`SparseHeader`], [`Bat`], [`Batmap`], [`SectorBitmap`]:
//!   byte-exact codecs for the on-disk structures, checksums included
//! - [`Vhd`]: an opened image with its parent chain, sector resolution
//!   (`locate`/`read_sector`) and lazily-allocating writes (`write_sector`)
//! - [`stream`]: `Sectors`/`Empty`/`Copy` element plans that reconstruct the
//!   disk as a raw image or a VHD file, with delta output against an
//!   ancestor in the chain
//!
//! All I/O goes through the [`StorageBackend`]/[`StorageHost`] capability
//! traits; [`MemBackend`]/[`MemHost`] serve tests and [`FileBackend`]/
//! [`FileHost`] the native filesystem.

mod backend;
mod bat;
mod batmap;
mod bitmap;
pub mod checksum;
mod error;
mod footer;
mod geometry;
mod header;
pub mod stream;
mod utf16;
mod util;
mod vhd;

pub use backend::{
    FileBackend, FileHost, MemBackend, MemHost, StorageBackend, StorageHost, VHD_EPOCH_UNIX,
};
pub use bat::{BAT_UNUSED, Bat, MAX_BAT_ENTRIES};
pub use batmap::{Batmap, BatmapHeader};
pub use bitmap::{SectorBitmap, bitmap_bytes};
pub use error::{Result, VhdError};
pub use footer::{DiskType, FIXED_DATA_OFFSET, Features, Footer, HostOs};
pub use geometry::Geometry;
pub use header::{DEFAULT_BLOCK_SIZE, ParentLocator, PlatformCode, SparseHeader};
pub use vhd::{CreateOptions, Extent, FILE_URI_PREFIX, Vhd};

/// The atomic unit of VHD I/O.
pub const SECTOR_SIZE: usize = 512;

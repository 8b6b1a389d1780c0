//! The assembled VHD object: footer + sparse header + BAT (+ optional
//! BATmap) over an open backend, with an optional recursively-opened parent
//! for differencing disks.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{StorageBackend, StorageHost};
use crate::bat::{BAT_UNUSED, Bat};
use crate::batmap::{Batmap, BatmapHeader};
use crate::bitmap::{SectorBitmap, bitmap_bytes};
use crate::footer::{DiskType, Features, Footer, HostOs};
use crate::geometry::Geometry;
use crate::header::{
    DEFAULT_BLOCK_SIZE, LOCATOR_COUNT, ParentLocator, PlatformCode, SparseHeader,
};
use crate::util::sectors_ceil;
use crate::{Result, SECTOR_SIZE, VhdError, utf16};

/// URI prefix used in parent locator payloads for sibling-relative paths.
pub const FILE_URI_PREFIX: &str = "file://./";

/// Byte offset of the sparse header in files this library creates.
const HEADER_OFFSET: u64 = 512;
/// Byte offset of the parent locator payload in files this library creates.
const LOCATOR_PAYLOAD_OFFSET: u64 = 1536;
/// Byte offset of the BAT in files this library creates.
const TABLE_OFFSET: u64 = 2048;

/// Zero-fill chunk for freshly allocated block regions.
const ZERO_CHUNK: usize = 2 * 1024 * 1024;

/// Options for creating a new image. For a differencing disk the size and
/// block size are inherited from the parent.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    pub path: String,
    /// Virtual size in bytes; must be a multiple of 512.
    pub size: u64,
    pub block_size: u32,
    /// Defaults to a fresh v4 UUID.
    pub uuid: Option<Uuid>,
    pub saved_state: bool,
    pub features: Features,
}

impl CreateOptions {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            block_size: DEFAULT_BLOCK_SIZE,
            uuid: None,
            saved_state: false,
            features: Features::default(),
        }
    }
}

/// A named on-disk region of the image, produced by [`Vhd::check_extents`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
    pub kind: &'static str,
}

#[derive(Debug)]
pub struct Vhd<B> {
    filename: String,
    backend: B,
    footer: Footer,
    header: SparseHeader,
    bat: Bat,
    batmap: Option<Batmap>,
    parent: Option<Box<Vhd<B>>>,
    /// One-entry memo of the last bitmap read, for sequential access.
    bitmap_cache: Option<(u32, SectorBitmap)>,
}

impl<B: StorageBackend> Vhd<B> {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    pub fn bat(&self) -> &Bat {
        &self.bat
    }

    pub fn batmap(&self) -> Option<&Batmap> {
        self.batmap.as_ref()
    }

    pub fn parent(&self) -> Option<&Vhd<B>> {
        self.parent.as_deref()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.footer.current_size
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Depth of the parent chain including this layer.
    pub fn layer_count(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.layer_count())
    }

    pub(crate) fn nth_layer_mut(&mut self, depth: usize) -> Option<&mut Vhd<B>> {
        if depth == 0 {
            Some(self)
        } else {
            self.parent.as_mut()?.nth_layer_mut(depth - 1)
        }
    }

    /// (filename, BAT) pairs from this layer down to the root of the chain.
    pub(crate) fn chain_bats(&self) -> Vec<(&str, &Bat)> {
        let mut out = vec![(self.filename.as_str(), &self.bat)];
        if let Some(parent) = &self.parent {
            out.extend(parent.chain_bats());
        }
        out
    }

    /// Open `path` and, for differencing disks, the whole parent chain.
    pub fn open<H>(host: &H, path: &str) -> Result<Self>
    where
        H: StorageHost<Backend = B>,
    {
        Self::open_with_search(host, path, &[])
    }

    /// As [`Vhd::open`], trying each of `search_paths` when a parent locator
    /// names a file that is not reachable as-is.
    pub fn open_with_search<H>(host: &H, path: &str, search_paths: &[&str]) -> Result<Self>
    where
        H: StorageHost<Backend = B>,
    {
        let mut backend = host.open(path)?;

        let mut footer_buf = [0u8; Footer::SIZE];
        backend.read_exact_at(0, &mut footer_buf)?;
        let footer = Footer::unmarshal(&footer_buf)?;
        if footer.disk_type == DiskType::Fixed {
            return Err(VhdError::FixedDiskUnsupported);
        }

        let mut header_buf = [0u8; SparseHeader::SIZE];
        backend.read_exact_at(footer.data_offset, &mut header_buf)?;
        let header = SparseHeader::unmarshal(&header_buf)?;

        let capacity = header.max_table_entries as u64 * header.block_size as u64;
        if footer.current_size > capacity {
            return Err(VhdError::SizeExceedsTable {
                size: footer.current_size,
                capacity,
            });
        }

        let bat_bytes = Bat::size_bytes(header.max_table_entries);
        let bat_bytes_usize: usize = bat_bytes.try_into().map_err(|_| VhdError::OffsetOverflow)?;
        let mut bat_buf = vec![0u8; bat_bytes_usize];
        backend.read_exact_at(header.table_offset, &mut bat_buf)?;
        let bat = Bat::parse(&bat_buf, header.max_table_entries)?;

        let batmap = read_batmap(&mut backend, &header)?;

        let parent = if footer.disk_type == DiskType::Differencing {
            let parent_path = resolve_parent(host, &mut backend, &header, search_paths)?;
            debug!(child = path, parent = %parent_path, "opening parent");
            let parent = Self::open_with_search(host, &parent_path, search_paths)?;
            if parent.footer.uid != header.parent_unique_id {
                return Err(VhdError::ParentUuidMismatch {
                    expected: header.parent_unique_id,
                    found: parent.footer.uid,
                });
            }
            Some(Box::new(parent))
        } else {
            None
        };

        debug!(
            path,
            disk_type = ?footer.disk_type,
            size = footer.current_size,
            "opened vhd"
        );

        Ok(Self {
            filename: path.to_string(),
            backend,
            footer,
            header,
            bat,
            batmap,
            parent,
            bitmap_cache: None,
        })
    }

    /// Create an empty dynamic disk.
    pub fn create_dynamic<H>(host: &H, opts: &CreateOptions) -> Result<Self>
    where
        H: StorageHost<Backend = B>,
    {
        if opts.size == 0 || !opts.size.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::InvalidConfig(
                "size must be a non-zero multiple of 512",
            ));
        }
        if opts.block_size < SECTOR_SIZE as u32 || !opts.block_size.is_power_of_two() {
            return Err(VhdError::InvalidBlockSize(opts.block_size));
        }

        let footer = Footer {
            features: opts.features,
            data_offset: HEADER_OFFSET,
            time_stamp: host.now(),
            creator_application: Footer::CREATOR_APPLICATION,
            creator_version: Footer::CREATOR_VERSION,
            creator_host_os: HostOs::Other(0),
            original_size: opts.size,
            current_size: opts.size,
            geometry: Geometry::of_sectors(opts.size / SECTOR_SIZE as u64),
            disk_type: DiskType::Dynamic,
            checksum: 0,
            uid: opts.uuid.unwrap_or_else(Uuid::new_v4),
            saved_state: opts.saved_state,
        };
        let header = SparseHeader {
            table_offset: TABLE_OFFSET,
            max_table_entries: opts.size.div_ceil(opts.block_size as u64) as u32,
            block_size: opts.block_size,
            checksum: 0,
            parent_unique_id: Uuid::nil(),
            parent_time_stamp: 0,
            parent_unicode_name: String::new(),
            parent_locators: [ParentLocator::null(); LOCATOR_COUNT],
        };

        Self::write_fresh(host, opts, footer, header, None, None)
    }

    /// Create an empty differencing disk over `parent`. Size and block size
    /// are taken from the parent; the child re-opens the parent file with its
    /// own handle.
    pub fn create_difference<H>(host: &H, opts: &CreateOptions, parent: &Vhd<B>) -> Result<Self>
    where
        H: StorageHost<Backend = B>,
    {
        let size = parent.footer.current_size;
        let uri = format!("{FILE_URI_PREFIX}{}", parent.filename);
        let uri_len: u32 = uri
            .len()
            .try_into()
            .map_err(|_| VhdError::InvalidConfig("parent filename too long"))?;
        if uri.len() > SECTOR_SIZE {
            return Err(VhdError::InvalidConfig("parent filename too long"));
        }

        let footer = Footer {
            features: opts.features,
            data_offset: HEADER_OFFSET,
            time_stamp: host.now(),
            creator_application: Footer::CREATOR_APPLICATION,
            creator_version: Footer::CREATOR_VERSION,
            creator_host_os: HostOs::Other(0),
            original_size: size,
            current_size: size,
            geometry: Geometry::of_sectors(size / SECTOR_SIZE as u64),
            disk_type: DiskType::Differencing,
            checksum: 0,
            uid: opts.uuid.unwrap_or_else(Uuid::new_v4),
            saved_state: opts.saved_state,
        };

        let mut locators = [ParentLocator::null(); LOCATOR_COUNT];
        locators[0] = ParentLocator {
            code: PlatformCode::MacX,
            // Recorded in sectors, as the format document asks.
            data_space_raw: 1,
            data_length: uri_len,
            data_offset: LOCATOR_PAYLOAD_OFFSET,
        };
        let header = SparseHeader {
            table_offset: TABLE_OFFSET,
            max_table_entries: size.div_ceil(parent.header.block_size as u64) as u32,
            block_size: parent.header.block_size,
            checksum: 0,
            parent_unique_id: parent.footer.uid,
            parent_time_stamp: host.modification_time(&parent.filename)?,
            parent_unicode_name: parent.filename.clone(),
            parent_locators: locators,
        };

        let parent_chain = Self::open(host, &parent.filename)?;
        Self::write_fresh(
            host,
            opts,
            footer,
            header,
            Some(uri.into_bytes()),
            Some(Box::new(parent_chain)),
        )
    }

    fn write_fresh<H>(
        host: &H,
        opts: &CreateOptions,
        mut footer: Footer,
        mut header: SparseHeader,
        locator_payload: Option<Vec<u8>>,
        parent: Option<Box<Vhd<B>>>,
    ) -> Result<Self>
    where
        H: StorageHost<Backend = B>,
    {
        let bat = Bat::new(header.max_table_entries)?;
        let mut backend = host.create(&opts.path)?;

        let footer_buf = footer.marshal();
        let bat_end = header.table_offset + 4 * header.max_table_entries as u64;
        let top = sectors_ceil(bat_end)? * SECTOR_SIZE as u64;

        // Head footer first, then the trailing footer so the file takes its
        // full shape before the structures in between land.
        backend.write_all_at(0, &footer_buf)?;
        backend.write_all_at(top, &footer_buf)?;
        backend.write_all_at(HEADER_OFFSET, &header.marshal())?;
        if let Some(payload) = &locator_payload {
            backend.write_all_at(LOCATOR_PAYLOAD_OFFSET, payload)?;
        }
        backend.write_all_at(header.table_offset, &bat.to_bytes())?;
        backend.flush()?;

        debug!(
            path = %opts.path,
            disk_type = ?footer.disk_type,
            size = footer.current_size,
            "created vhd"
        );

        Ok(Self {
            filename: opts.path.clone(),
            backend,
            footer,
            header,
            bat,
            batmap: None,
            parent,
            bitmap_cache: None,
        })
    }

    /// Flush and close this layer and its whole parent chain, child first.
    pub fn close(mut self) -> Result<()> {
        self.backend.flush()?;
        if let Some(parent) = self.parent.take() {
            parent.close()?;
        }
        Ok(())
    }

    /// Where does `virtual_sector` live? `None` means a hole (zero for a
    /// dynamic disk); `Some((depth, physical_sector))` names the serving
    /// layer (0 = this one) and the physical sector within its file.
    pub fn locate(&mut self, virtual_sector: u64) -> Result<Option<(usize, u64)>> {
        self.locate_from(virtual_sector, 0)
    }

    fn locate_from(&mut self, virtual_sector: u64, depth: usize) -> Result<Option<(usize, u64)>> {
        if self.footer.disk_type == DiskType::Fixed {
            return Err(VhdError::FixedDiskUnsupported);
        }

        // A layer only serves sectors inside its own size; chains may mix
        // sizes, so out-of-range simply delegates.
        let in_range = virtual_sector
            .checked_mul(SECTOR_SIZE as u64)
            .is_some_and(|byte| byte < self.footer.current_size);
        if !in_range {
            return match &mut self.parent {
                Some(parent) => parent.locate_from(virtual_sector, depth + 1),
                None => Ok(None),
            };
        }

        let shift = self.header.block_size_sectors_shift();
        let block = (virtual_sector >> shift) as u32;
        let sector_in_block = (virtual_sector & ((1u64 << shift) - 1)) as u32;

        let entry = self.bat.get(block);
        if entry == BAT_UNUSED {
            return match (self.footer.disk_type, &mut self.parent) {
                (DiskType::Differencing, Some(parent)) => {
                    parent.locate_from(virtual_sector, depth + 1)
                }
                _ => Ok(None),
            };
        }

        self.ensure_bitmap_cached(block)?;
        let set = match &self.bitmap_cache {
            Some((_, bitmap)) => bitmap.get(sector_in_block),
            None => return Err(VhdError::CorruptImage("bitmap cache missing")),
        };
        if set {
            let bitmap_sectors = bitmap_bytes(self.header.block_size) / SECTOR_SIZE as u64;
            let physical = entry as u64 + bitmap_sectors + sector_in_block as u64;
            return Ok(Some((depth, physical)));
        }

        match (self.footer.disk_type, &mut self.parent) {
            (DiskType::Differencing, Some(parent)) => {
                parent.locate_from(virtual_sector, depth + 1)
            }
            _ => Ok(None),
        }
    }

    /// Read one virtual sector. `Ok(None)` is a hole.
    pub fn read_sector(&mut self, virtual_sector: u64) -> Result<Option<Vec<u8>>> {
        let max = self.footer.current_size / SECTOR_SIZE as u64;
        if virtual_sector >= max {
            return Err(VhdError::InvalidSector {
                sector: virtual_sector,
                max,
            });
        }

        match self.locate(virtual_sector)? {
            None => Ok(None),
            Some((depth, physical)) => {
                let layer = self
                    .nth_layer_mut(depth)
                    .ok_or(VhdError::CorruptImage("resolved layer out of chain"))?;
                let mut buf = vec![0u8; SECTOR_SIZE];
                let offset = physical
                    .checked_mul(SECTOR_SIZE as u64)
                    .ok_or(VhdError::OffsetOverflow)?;
                layer.backend.read_exact_at(offset, &mut buf)?;
                Ok(Some(buf))
            }
        }
    }

    /// First sector past the end of the last allocated block; where the next
    /// block (and the trailing footer) go.
    pub fn first_unused_sector(&self) -> Result<u64> {
        let top = match self.bat.highest_value() {
            Some(highest) => (highest as u64)
                .checked_mul(SECTOR_SIZE as u64)
                .and_then(|byte| byte.checked_add(bitmap_bytes(self.header.block_size)))
                .and_then(|byte| byte.checked_add(self.header.block_size as u64))
                .ok_or(VhdError::OffsetOverflow)?,
            None => self.header.table_offset + 4 * self.header.max_table_entries as u64,
        };
        sectors_ceil(top)
    }

    /// Write one virtual sector, allocating its block on first touch.
    pub fn write_sector(&mut self, virtual_sector: u64, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE {
            return Err(VhdError::UnalignedBuffer { len: data.len() });
        }
        if self.footer.disk_type == DiskType::Fixed {
            return Err(VhdError::FixedDiskUnsupported);
        }
        let max = self.footer.current_size / SECTOR_SIZE as u64;
        if virtual_sector >= max {
            return Err(VhdError::InvalidSector {
                sector: virtual_sector,
                max,
            });
        }

        let shift = self.header.block_size_sectors_shift();
        let block = (virtual_sector >> shift) as u32;
        let sector_in_block = (virtual_sector & ((1u64 << shift) - 1)) as u32;
        let bitmap_len = bitmap_bytes(self.header.block_size);

        let mut entry = self.bat.get(block);
        if entry == BAT_UNUSED {
            entry = self.allocate_block(block)?;
        }

        let payload_offset = (entry as u64 + bitmap_len / SECTOR_SIZE as u64
            + sector_in_block as u64)
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        self.backend.write_all_at(payload_offset, data)?;

        self.ensure_bitmap_cached(block)?;
        let (written_sector, changed) = match &mut self.bitmap_cache {
            Some((_, bitmap)) => (bitmap.sector_of(sector_in_block), bitmap.set(sector_in_block)),
            None => return Err(VhdError::CorruptImage("bitmap cache missing")),
        };
        if changed {
            // Only the 512-byte slice of the bitmap holding the touched byte
            // goes back to disk.
            let slice_offset = (entry as u64 + written_sector as u64)
                .checked_mul(SECTOR_SIZE as u64)
                .ok_or(VhdError::OffsetOverflow)?;
            match &self.bitmap_cache {
                Some((_, bitmap)) => {
                    let slice = bitmap.sector_slice(written_sector).to_vec();
                    self.backend.write_all_at(slice_offset, &slice)?;
                }
                None => return Err(VhdError::CorruptImage("bitmap cache missing")),
            }
        }

        Ok(())
    }

    /// Allocate a zero-filled block and publish it: block region, then BAT,
    /// then the trailing footer at the new top. Returns the block's sector.
    fn allocate_block(&mut self, block: u32) -> Result<u32> {
        let sector = self.first_unused_sector()?;
        let sector_u32: u32 = sector.try_into().map_err(|_| VhdError::OffsetOverflow)?;
        let bitmap_len = bitmap_bytes(self.header.block_size);
        let region_len = bitmap_len
            .checked_add(self.header.block_size as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        let region_start = sector
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(VhdError::OffsetOverflow)?;

        debug!(block, sector, "allocating block");

        write_zeros(&mut self.backend, region_start, region_len)?;

        self.bat.set(block, sector_u32);
        self.backend
            .write_all_at(self.header.table_offset, &self.bat.to_bytes())?;

        let top = region_start
            .checked_add(region_len)
            .ok_or(VhdError::OffsetOverflow)?;
        let footer_buf = self.footer.marshal();
        self.backend.write_all_at(top, &footer_buf)?;

        Ok(sector_u32)
    }

    fn ensure_bitmap_cached(&mut self, block: u32) -> Result<()> {
        if matches!(&self.bitmap_cache, Some((cached, _)) if *cached == block) {
            return Ok(());
        }
        let entry = self.bat.get(block);
        if entry == BAT_UNUSED {
            return Err(VhdError::CorruptImage("bitmap read for unallocated block"));
        }
        let len: usize = bitmap_bytes(self.header.block_size)
            .try_into()
            .map_err(|_| VhdError::OffsetOverflow)?;
        let mut buf = vec![0u8; len];
        let offset = (entry as u64)
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        self.backend.read_exact_at(offset, &mut buf)?;
        self.bitmap_cache = Some((block, SectorBitmap::from_bytes(buf)));
        Ok(())
    }

    /// Bitmap of an allocated block, through the one-entry cache.
    pub fn block_bitmap(&mut self, block: u32) -> Result<&SectorBitmap> {
        self.ensure_bitmap_cached(block)?;
        match &self.bitmap_cache {
            Some((_, bitmap)) => Ok(bitmap),
            None => Err(VhdError::CorruptImage("bitmap cache missing")),
        }
    }

    /// Conformance check: every on-disk structure as a sorted extent list,
    /// failing if any two overlap.
    pub fn check_extents(&self) -> Result<Vec<Extent>> {
        let bitmap_len = bitmap_bytes(self.header.block_size);
        let mut extents = vec![
            Extent {
                start: 0,
                end: Footer::SIZE as u64,
                kind: "footer",
            },
            Extent {
                start: self.footer.data_offset,
                end: self
                    .footer
                    .data_offset
                    .checked_add(SparseHeader::SIZE as u64)
                    .ok_or(VhdError::OffsetOverflow)?,
                kind: "header",
            },
            Extent {
                start: self.header.table_offset,
                end: self
                    .header
                    .table_offset
                    .checked_add(Bat::size_bytes(self.header.max_table_entries))
                    .ok_or(VhdError::OffsetOverflow)?,
                kind: "bat",
            },
        ];

        if let Some(batmap) = &self.batmap {
            let header_start = self.header.table_offset
                + Bat::size_bytes(self.header.max_table_entries);
            extents.push(Extent {
                start: header_start,
                end: header_start + BatmapHeader::SIZE as u64,
                kind: "batmap header",
            });
            extents.push(Extent {
                start: batmap.header.offset,
                end: batmap
                    .header
                    .offset
                    .checked_add(batmap.header.size_in_sectors as u64 * SECTOR_SIZE as u64)
                    .ok_or(VhdError::OffsetOverflow)?,
                kind: "batmap",
            });
        }

        for locator in &self.header.parent_locators {
            if locator.code == PlatformCode::None || locator.data_space_bytes() == 0 {
                continue;
            }
            extents.push(Extent {
                start: locator.data_offset,
                end: locator
                    .data_offset
                    .checked_add(locator.data_space_bytes())
                    .ok_or(VhdError::OffsetOverflow)?,
                kind: "parent locator",
            });
        }

        for (_, sector) in self.bat.iter_used(self.header.max_table_entries) {
            let start = sector as u64 * SECTOR_SIZE as u64;
            extents.push(Extent {
                start,
                end: start
                    .checked_add(bitmap_len + self.header.block_size as u64)
                    .ok_or(VhdError::OffsetOverflow)?,
                kind: "block",
            });
        }

        extents.sort_by_key(|e| (e.start, e.end));
        for pair in extents.windows(2) {
            if pair[0].end > pair[1].start {
                return Err(VhdError::ExtentsOverlap {
                    a_start: pair[0].start,
                    a_end: pair[0].end,
                    b_start: pair[1].start,
                    b_end: pair[1].end,
                });
            }
        }

        Ok(extents)
    }
}

fn write_zeros<B: StorageBackend>(backend: &mut B, mut offset: u64, mut len: u64) -> Result<()> {
    let zeros = vec![0u8; len.min(ZERO_CHUNK as u64) as usize];
    while len > 0 {
        let chunk = len.min(zeros.len() as u64) as usize;
        backend.write_all_at(offset, &zeros[..chunk])?;
        offset = offset
            .checked_add(chunk as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        len -= chunk as u64;
    }
    Ok(())
}

fn read_batmap<B: StorageBackend>(
    backend: &mut B,
    header: &SparseHeader,
) -> Result<Option<Batmap>> {
    let header_offset = header
        .table_offset
        .checked_add(Bat::size_bytes(header.max_table_entries))
        .ok_or(VhdError::OffsetOverflow)?;
    let len = backend.size()?;
    let header_end = header_offset
        .checked_add(BatmapHeader::SIZE as u64)
        .ok_or(VhdError::OffsetOverflow)?;
    if header_end > len {
        return Ok(None);
    }

    let mut cookie = [0u8; 8];
    backend.read_exact_at(header_offset, &mut cookie)?;
    if &cookie != crate::batmap::BATMAP_MAGIC {
        return Ok(None);
    }

    let mut header_buf = [0u8; BatmapHeader::SIZE];
    backend.read_exact_at(header_offset, &mut header_buf)?;
    let batmap_header = BatmapHeader::unmarshal(&header_buf)?;

    let payload_len = (batmap_header.size_in_sectors as u64)
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(VhdError::OffsetOverflow)?;
    let payload_len_usize: usize = payload_len
        .try_into()
        .map_err(|_| VhdError::OffsetOverflow)?;
    let mut payload = vec![0u8; payload_len_usize];
    backend.read_exact_at(batmap_header.offset, &mut payload)?;

    Ok(Some(Batmap::from_parts(batmap_header, payload)?))
}

fn resolve_parent<H: StorageHost>(
    host: &H,
    backend: &mut H::Backend,
    header: &SparseHeader,
    search_paths: &[&str],
) -> Result<String> {
    let mut candidates = Vec::new();
    if !header.parent_unicode_name.is_empty() {
        candidates.push(header.parent_unicode_name.clone());
    }

    for locator in &header.parent_locators {
        if locator.code == PlatformCode::None || locator.data_length == 0 {
            continue;
        }
        // Length was bounded against the slot's reserved space at parse time.
        let mut payload = vec![0u8; locator.data_length as usize];
        if let Err(err) = backend.read_exact_at(locator.data_offset, &mut payload) {
            warn!(code = ?locator.code, %err, "skipping unreadable parent locator");
            continue;
        }
        let decoded = match locator.code {
            PlatformCode::W2ku | PlatformCode::W2ru => utf16::decode_le(&payload),
            _ => String::from_utf8(payload)
                .map_err(|_| VhdError::InvalidUtf16("parent locator payload is not UTF-8")),
        };
        match decoded {
            Ok(candidate) => candidates.push(candidate),
            Err(err) => {
                warn!(code = ?locator.code, %err, "skipping undecodable parent locator");
            }
        }
    }

    for candidate in &candidates {
        let name = candidate
            .strip_prefix(FILE_URI_PREFIX)
            .unwrap_or(candidate.as_str());
        if host.exists(name) {
            return Ok(name.to_string());
        }
        for dir in search_paths {
            let joined = format!("{dir}/{name}");
            if host.exists(&joined) {
                return Ok(joined);
            }
        }
    }

    Err(VhdError::ParentNotFound(
        candidates
            .first()
            .cloned()
            .unwrap_or_else(|| "<no locator>".to_string()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemBackend, MemHost};

    fn create(host: &MemHost, path: &str, size: u64) -> Vhd<MemBackend> {
        Vhd::create_dynamic(host, &CreateOptions::new(path, size)).unwrap()
    }

    #[test]
    fn create_dynamic_layout_matches_the_format() {
        let host = MemHost::new();
        let vhd = create(&host, "a.vhd", 4 * 1024 * 1024);

        assert_eq!(vhd.header().max_table_entries, 2);
        assert_eq!(vhd.header().table_offset, 2048);
        assert_eq!(vhd.first_unused_sector().unwrap(), 5);

        let raw = host.snapshot("a.vhd").unwrap();
        // Head footer, header, BAT, trailing footer at sector 5.
        assert_eq!(&raw[0..8], b"conectix");
        assert_eq!(&raw[512..520], b"cxsparse");
        assert_eq!(&raw[2048..2056], &[0xFF; 8]);
        assert_eq!(&raw[2560..2568], b"conectix");
        assert_eq!(raw.len(), 2560 + 512);
    }

    #[test]
    fn fresh_dynamic_disk_reads_as_holes() {
        let host = MemHost::new();
        let mut vhd = create(&host, "a.vhd", 4 * 1024 * 1024);
        assert_eq!(vhd.read_sector(0).unwrap(), None);
        assert_eq!(vhd.locate(8191).unwrap(), None);
    }

    #[test]
    fn reads_past_the_disk_fail() {
        let host = MemHost::new();
        let mut vhd = create(&host, "a.vhd", 4 * 1024 * 1024);
        assert!(matches!(
            vhd.read_sector(8192).unwrap_err(),
            VhdError::InvalidSector { sector: 8192, max: 8192 }
        ));
    }

    #[test]
    fn write_allocates_after_the_trailing_footer() {
        let host = MemHost::new();
        let mut vhd = create(&host, "a.vhd", 4 * 1024 * 1024);
        vhd.write_sector(0, &[0xAA; 512]).unwrap();

        // The block displaced the old trailing footer at sector 5.
        assert_eq!(vhd.bat().get(0), 5);
        assert_eq!(vhd.bat().get(1), BAT_UNUSED);
        assert_eq!(vhd.read_sector(0).unwrap(), Some(vec![0xAA; 512]));
        assert_eq!(vhd.read_sector(1).unwrap(), None);

        // New trailing footer past the block: sector 5 + 1 bitmap + 4096 data.
        let raw = host.snapshot("a.vhd").unwrap();
        let top = (5 + 1 + 4096) * 512;
        assert_eq!(&raw[top..top + 8], b"conectix");
    }

    #[test]
    fn reopen_after_writes_sees_the_same_data() {
        let host = MemHost::new();
        let mut vhd = create(&host, "a.vhd", 4 * 1024 * 1024);
        vhd.write_sector(0, &[0xAA; 512]).unwrap();
        vhd.write_sector(4096, &[0xBB; 512]).unwrap();
        vhd.close().unwrap();

        let mut reopened = Vhd::open(&host, "a.vhd").unwrap();
        assert_eq!(reopened.read_sector(0).unwrap(), Some(vec![0xAA; 512]));
        assert_eq!(reopened.read_sector(4096).unwrap(), Some(vec![0xBB; 512]));
        assert_eq!(reopened.read_sector(1).unwrap(), None);
        reopened.check_extents().unwrap();
    }

    #[test]
    fn rewriting_a_sector_does_not_reallocate() {
        let host = MemHost::new();
        let mut vhd = create(&host, "a.vhd", 4 * 1024 * 1024);
        vhd.write_sector(7, &[1; 512]).unwrap();
        let bat_after_first = vhd.bat().get(0);
        vhd.write_sector(7, &[2; 512]).unwrap();
        assert_eq!(vhd.bat().get(0), bat_after_first);
        assert_eq!(vhd.read_sector(7).unwrap(), Some(vec![2; 512]));
    }

    #[test]
    fn difference_child_delegates_to_parent() {
        let host = MemHost::new();
        let mut parent = create(&host, "parent.vhd", 4 * 1024 * 1024);
        parent.write_sector(0, &[0xAA; 512]).unwrap();

        let mut child =
            Vhd::create_difference(&host, &CreateOptions::new("child.vhd", 0), &parent).unwrap();
        assert_eq!(child.footer().disk_type, DiskType::Differencing);
        assert_eq!(child.capacity_bytes(), 4 * 1024 * 1024);

        // Sector 0 is served by the parent layer.
        assert_eq!(child.read_sector(0).unwrap(), Some(vec![0xAA; 512]));
        let (depth, _) = child.locate(0).unwrap().unwrap();
        assert_eq!(depth, 1);

        child.write_sector(1, &[0x55; 512]).unwrap();
        assert_eq!(child.read_sector(1).unwrap(), Some(vec![0x55; 512]));
        let (depth, _) = child.locate(1).unwrap().unwrap();
        assert_eq!(depth, 0);

        // The parent is untouched.
        assert_eq!(parent.read_sector(1).unwrap(), None);
    }

    #[test]
    fn child_reopens_through_the_locator() {
        let host = MemHost::new();
        let mut parent = create(&host, "parent.vhd", 4 * 1024 * 1024);
        parent.write_sector(9, &[9; 512]).unwrap();
        let child =
            Vhd::create_difference(&host, &CreateOptions::new("child.vhd", 0), &parent).unwrap();
        child.close().unwrap();

        let mut reopened = Vhd::open(&host, "child.vhd").unwrap();
        assert_eq!(reopened.layer_count(), 2);
        assert_eq!(reopened.read_sector(9).unwrap(), Some(vec![9; 512]));
    }

    #[test]
    fn missing_parent_is_reported() {
        let host = MemHost::new();
        let parent = create(&host, "parent.vhd", 4 * 1024 * 1024);
        let child =
            Vhd::create_difference(&host, &CreateOptions::new("child.vhd", 0), &parent).unwrap();
        child.close().unwrap();

        let orphan = MemHost::new();
        orphan.insert("child.vhd", host.snapshot("child.vhd").unwrap());
        assert!(matches!(
            Vhd::<MemBackend>::open(&orphan, "child.vhd").unwrap_err(),
            VhdError::ParentNotFound(_)
        ));
    }

    #[test]
    fn swapped_parent_fails_the_uuid_check() {
        let host = MemHost::new();
        let parent = create(&host, "parent.vhd", 4 * 1024 * 1024);
        let child =
            Vhd::create_difference(&host, &CreateOptions::new("child.vhd", 0), &parent).unwrap();
        child.close().unwrap();

        // Replace the parent with a different image of the same name.
        let impostor = create(&host, "parent.vhd", 4 * 1024 * 1024);
        impostor.close().unwrap();

        assert!(matches!(
            Vhd::<MemBackend>::open(&host, "child.vhd").unwrap_err(),
            VhdError::ParentUuidMismatch { .. }
        ));
    }

    #[test]
    fn corrupt_footer_fails_open_with_checksum_details() {
        let host = MemHost::new();
        create(&host, "a.vhd", 4 * 1024 * 1024).close().unwrap();

        let mut raw = host.snapshot("a.vhd").unwrap();
        raw[40] ^= 0xFF;
        host.insert("a.vhd", raw);

        match Vhd::<MemBackend>::open(&host, "a.vhd").unwrap_err() {
            VhdError::ChecksumMismatch { stored, computed } => assert_ne!(stored, computed),
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn extent_overlap_is_detected() {
        let host = MemHost::new();
        let mut vhd = create(&host, "a.vhd", 4 * 1024 * 1024);
        vhd.write_sector(0, &[1; 512]).unwrap();
        vhd.write_sector(4096, &[2; 512]).unwrap();
        vhd.check_extents().unwrap();

        // Point block 1 into block 0's region.
        vhd.bat.set(1, vhd.bat.get(0));
        assert!(matches!(
            vhd.check_extents().unwrap_err(),
            VhdError::ExtentsOverlap { .. }
        ));
    }

    #[test]
    fn fixed_images_are_rejected_by_open() {
        use crate::footer::FIXED_DATA_OFFSET;
        let host = MemHost::new();
        let size = 1024u64 * 1024;
        let mut footer = Footer {
            features: Features::default(),
            data_offset: FIXED_DATA_OFFSET,
            time_stamp: 0,
            creator_application: Footer::CREATOR_APPLICATION,
            creator_version: Footer::CREATOR_VERSION,
            creator_host_os: HostOs::Other(0),
            original_size: size,
            current_size: size,
            geometry: Geometry::of_sectors(size / 512),
            disk_type: DiskType::Fixed,
            checksum: 0,
            uid: Uuid::nil(),
            saved_state: false,
        };
        let buf = footer.marshal();
        let mut raw = vec![0u8; size as usize + 512];
        raw[0..512].copy_from_slice(&buf);
        let end = raw.len() - 512;
        raw[end..].copy_from_slice(&buf);
        host.insert("fixed.vhd", raw);

        assert!(matches!(
            Vhd::<MemBackend>::open(&host, "fixed.vhd").unwrap_err(),
            VhdError::FixedDiskUnsupported
        ));
    }
}

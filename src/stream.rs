//! Lazy export streams: an ordered plan of `Sectors`/`Empty`/`Copy` elements
//! that reconstructs a disk as a raw image or as a VHD file, optionally as a
//! delta against an ancestor in the parent chain.
//!
//! Generation touches metadata only (BATs and bitmaps); the bytes behind
//! `Copy` elements are read when the stream is consumed, so read failures
//! surface to the consumer, not the generator.

use tracing::warn;

use crate::backend::StorageBackend;
use crate::bat::{BAT_UNUSED, Bat};
use crate::batmap::Batmap;
use crate::bitmap::{SectorBitmap, bitmap_bytes};
use crate::header::PlatformCode;
use crate::vhd::Vhd;
use crate::{Result, SECTOR_SIZE, VhdError};

/// Expansion window: 2 MiB.
const EXPAND_CHUNK: usize = 2 * 1024 * 1024;

/// Identity of the file a [`Element::Copy`] reads from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopySource {
    /// A layer of the source chain; 0 is the disk the stream was built from.
    Layer(usize),
    /// The pre-expanded raw image backing a hybrid stream.
    Raw,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Element {
    /// Literal bytes produced by the generator itself (metadata, bitmaps).
    Sectors(Vec<u8>),
    /// Implicit zero sectors.
    Empty(u64),
    /// Sectors to be read from `source` at consumption time.
    Copy {
        source: CopySource,
        sector: u64,
        len: u64,
    },
}

impl Element {
    pub fn len_sectors(&self) -> u64 {
        match self {
            Element::Sectors(buf) => buf.len() as u64 / SECTOR_SIZE as u64,
            Element::Empty(n) => *n,
            Element::Copy { len, .. } => *len,
        }
    }
}

/// Byte accounting for a stream. `metadata + empty + copy` is the byte length
/// of the serialized stream; `total` is the logical disk size.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StreamSize {
    pub total: u64,
    pub metadata: u64,
    pub empty: u64,
    pub copy: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Stream {
    pub elements: Vec<Element>,
    pub size: StreamSize,
}

impl Stream {
    fn push_sectors(&mut self, buf: Vec<u8>) {
        self.size.metadata += buf.len() as u64;
        self.elements.push(Element::Sectors(buf));
    }

    fn push_empty(&mut self, sectors: u64) {
        if sectors == 0 {
            return;
        }
        self.size.empty += sectors * SECTOR_SIZE as u64;
        self.elements.push(Element::Empty(sectors));
    }

    fn push_copy(&mut self, source: CopySource, sector: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.size.copy += len * SECTOR_SIZE as u64;
        self.elements.push(Element::Copy {
            source,
            sector,
            len,
        });
    }

    /// Stream length in sectors.
    pub fn len_sectors(&self) -> u64 {
        self.elements.iter().map(Element::len_sectors).sum()
    }

    /// Merge adjacent `Empty` runs and adjacent same-source contiguous
    /// `Copy` runs (forward or backward). `Sectors` never merges. Idempotent.
    pub fn coalesce(mut self) -> Self {
        let mut out: Vec<Element> = Vec::with_capacity(self.elements.len());
        for element in self.elements.drain(..) {
            let merged = match (out.last_mut(), &element) {
                (Some(Element::Empty(run)), Element::Empty(n)) => {
                    *run += n;
                    true
                }
                (
                    Some(Element::Copy {
                        source: a_source,
                        sector: a_sector,
                        len: a_len,
                    }),
                    Element::Copy {
                        source,
                        sector,
                        len,
                    },
                ) if a_source == source => {
                    if *a_sector + *a_len == *sector {
                        *a_len += len;
                        true
                    } else if sector + len == *a_sector {
                        *a_sector = *sector;
                        *a_len += len;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if !merged {
                out.push(element);
            }
        }
        Self {
            elements: out,
            size: self.size,
        }
    }

    /// Rewrite every `Empty` into explicit zero `Sectors` in chunks of at
    /// most 2 MiB, moving the accounting from `empty` to `metadata`.
    pub fn expand_empty(mut self) -> Self {
        let chunk_sectors = (EXPAND_CHUNK / SECTOR_SIZE) as u64;
        let mut out = Vec::with_capacity(self.elements.len());
        for element in self.elements.drain(..) {
            match element {
                Element::Empty(mut n) => {
                    self.size.empty -= n * SECTOR_SIZE as u64;
                    while n > 0 {
                        let here = n.min(chunk_sectors);
                        self.size.metadata += here * SECTOR_SIZE as u64;
                        out.push(Element::Sectors(vec![0u8; here as usize * SECTOR_SIZE]));
                        n -= here;
                    }
                }
                other => out.push(other),
            }
        }
        Self {
            elements: out,
            size: self.size,
        }
    }
}

/// Blocks that must appear in a stream of `vhd`, optionally relative to the
/// ancestor `from`: without `from` every block allocated anywhere in the
/// chain, with `from` every block allocated in a layer on exactly one side
/// of the two chains.
fn included_blocks<B: StorageBackend>(vhd: &Vhd<B>, from: Option<&Vhd<B>>) -> Vec<bool> {
    let entries = vhd.header().max_table_entries;
    let ours = vhd.chain_bats();

    let mut relevant: Vec<&Bat> = Vec::new();
    match from {
        None => relevant.extend(ours.iter().map(|(_, bat)| *bat)),
        Some(ancestor) => {
            let theirs = ancestor.chain_bats();
            for pair in &ours {
                if !theirs.contains(pair) {
                    relevant.push(pair.1);
                }
            }
            for pair in &theirs {
                if !ours.contains(pair) {
                    relevant.push(pair.1);
                }
            }
        }
    }

    (0..entries)
        .map(|block| relevant.iter().any(|bat| bat.get(block) != BAT_UNUSED))
        .collect()
}

/// Stream the logical disk image: per included block one element per sector
/// (`Copy` where a layer owns it, `Empty` for holes), whole-block `Empty`
/// elsewhere.
pub fn raw<B: StorageBackend>(vhd: &mut Vhd<B>, from: Option<&Vhd<B>>) -> Result<Stream> {
    let included = included_blocks(vhd, from);
    let sectors_per_block = vhd.header().sectors_per_block() as u64;
    let total_sectors = vhd.capacity_bytes() / SECTOR_SIZE as u64;

    let mut stream = Stream {
        size: StreamSize {
            total: vhd.capacity_bytes(),
            ..StreamSize::default()
        },
        ..Stream::default()
    };

    let blocks = total_sectors.div_ceil(sectors_per_block);
    for block in 0..blocks {
        let first = block * sectors_per_block;
        let here = sectors_per_block.min(total_sectors - first);
        if !included[block as usize] {
            stream.push_empty(here);
            continue;
        }
        for s in 0..here {
            match vhd.locate(first + s)? {
                Some((depth, physical)) => {
                    stream.push_copy(CopySource::Layer(depth), physical, 1)
                }
                None => stream.push_empty(1),
            }
        }
    }

    Ok(stream)
}

/// Stream a complete VHD file: head footer, header, locator payload pad,
/// densified BAT, optional BATmap, per included block an all-ones bitmap and
/// the block's sectors, then the trailing footer.
pub fn vhd<B: StorageBackend>(
    vhd: &mut Vhd<B>,
    from: Option<&Vhd<B>>,
    emit_batmap: bool,
) -> Result<Stream> {
    plan_vhd(vhd, from, emit_batmap, None)
}

/// As [`vhd`], but every included block is one whole-block `Copy` against a
/// pre-expanded raw image of the same disk.
pub fn hybrid<B: StorageBackend>(
    vhd: &mut Vhd<B>,
    from: Option<&Vhd<B>>,
    emit_batmap: bool,
) -> Result<Stream> {
    plan_vhd(vhd, from, emit_batmap, Some(CopySource::Raw))
}

fn plan_vhd<B: StorageBackend>(
    vhd: &mut Vhd<B>,
    from: Option<&Vhd<B>>,
    emit_batmap: bool,
    whole_block_source: Option<CopySource>,
) -> Result<Stream> {
    let included = included_blocks(vhd, from);
    let entries = vhd.header().max_table_entries;
    let block_size = vhd.header().block_size;
    let sectors_per_block = vhd.header().sectors_per_block() as u64;
    let bitmap_sectors = bitmap_bytes(block_size) / SECTOR_SIZE as u64;
    let total_sectors = vhd.capacity_bytes() / SECTOR_SIZE as u64;

    let mut footer = vhd.footer().clone();
    footer.data_offset = 512;
    let mut header = vhd.header().clone();
    header.table_offset = 2048;

    // Locator payloads move into the pad sector between header and BAT.
    let mut pad = vec![0u8; SECTOR_SIZE];
    let mut pad_used = 0usize;
    for locator in header.parent_locators.iter_mut() {
        if locator.code == PlatformCode::None || locator.data_length == 0 {
            continue;
        }
        let len = locator.data_length as usize;
        if pad_used + len > SECTOR_SIZE {
            warn!(code = ?locator.code, "dropping parent locator that does not fit the pad sector");
            *locator = crate::header::ParentLocator::null();
            continue;
        }
        let mut payload = vec![0u8; len];
        vhd.backend_mut().read_exact_at(locator.data_offset, &mut payload)?;
        pad[pad_used..pad_used + len].copy_from_slice(&payload);
        locator.data_offset = 1536 + pad_used as u64;
        pad_used += locator.data_space_bytes().max(len as u64) as usize;
        if pad_used > SECTOR_SIZE {
            pad_used = SECTOR_SIZE;
        }
    }

    // Densified BAT: included blocks are laid out contiguously after the BAT
    // (and BATmap, when emitted).
    let bat_sectors = Bat::size_bytes(entries) / SECTOR_SIZE as u64;
    let mut cursor = 4 + bat_sectors;

    let batmap = if emit_batmap {
        let payload_sectors = Batmap::payload_sectors(entries) as u64;
        let payload_offset = (cursor + 1) * SECTOR_SIZE as u64;
        let full = (0..entries).filter(|b| included[*b as usize]);
        let batmap = Batmap::of_full_blocks(entries, payload_offset, full);
        cursor += 1 + payload_sectors;
        Some(batmap)
    } else {
        None
    };

    let mut out_bat = Bat::new(entries)?;
    for block in 0..entries {
        if included[block as usize] {
            let sector: u32 = cursor.try_into().map_err(|_| VhdError::OffsetOverflow)?;
            out_bat.set(block, sector);
            cursor += bitmap_sectors + sectors_per_block;
        }
    }

    let mut stream = Stream {
        size: StreamSize {
            total: vhd.capacity_bytes(),
            ..StreamSize::default()
        },
        ..Stream::default()
    };

    let footer_buf = footer.marshal().to_vec();
    stream.push_sectors(footer_buf.clone());
    stream.push_sectors(header.marshal().to_vec());
    stream.push_sectors(pad);
    stream.push_sectors(out_bat.to_bytes());
    if let Some(batmap) = &batmap {
        stream.push_sectors(batmap.header.marshal().to_vec());
        stream.push_sectors(batmap.payload().to_vec());
    }

    for block in 0..entries as u64 {
        if !included[block as usize] {
            continue;
        }
        stream.push_sectors(SectorBitmap::full(block_size).as_bytes().to_vec());

        let first = block * sectors_per_block;
        let in_range = sectors_per_block.min(total_sectors.saturating_sub(first));
        match whole_block_source {
            Some(source) => {
                stream.push_copy(source, first, in_range);
            }
            None => {
                for s in 0..in_range {
                    match vhd.locate(first + s)? {
                        Some((depth, physical)) => {
                            stream.push_copy(CopySource::Layer(depth), physical, 1)
                        }
                        None => stream.push_empty(1),
                    }
                }
            }
        }
        // Pad out blocks that straddle the end of the disk.
        stream.push_empty(sectors_per_block - in_range);
    }

    stream.push_sectors(footer_buf);
    Ok(stream)
}

/// How `Empty` elements are applied to the output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EmptyMode {
    /// Write literal zero sectors; produces a complete image on a fresh
    /// target.
    ZeroFill,
    /// Seek over the run, leaving existing target bytes; used when replaying
    /// a delta over a snapshot of the `from` image.
    Skip,
}

/// Serialize `stream` onto `out`: `Sectors` verbatim, `Empty` per `mode`,
/// `Copy` read from the chain (or `raw` for hybrid streams) in 2 MiB
/// windows. Returns the number of sectors advanced.
pub fn apply<B: StorageBackend, Out: StorageBackend>(
    stream: &Stream,
    vhd: &mut Vhd<B>,
    mut raw: Option<&mut B>,
    out: &mut Out,
    mode: EmptyMode,
) -> Result<u64> {
    let chunk_sectors = (EXPAND_CHUNK / SECTOR_SIZE) as u64;
    let mut cursor = 0u64;

    for element in &stream.elements {
        match element {
            Element::Sectors(buf) => {
                out.write_all_at(cursor * SECTOR_SIZE as u64, buf)?;
                cursor += buf.len() as u64 / SECTOR_SIZE as u64;
            }
            Element::Empty(n) => {
                match mode {
                    EmptyMode::ZeroFill => {
                        let mut remaining = *n;
                        let zeros = vec![0u8; remaining.min(chunk_sectors) as usize * SECTOR_SIZE];
                        let mut at = cursor;
                        while remaining > 0 {
                            let here = remaining.min(chunk_sectors);
                            out.write_all_at(
                                at * SECTOR_SIZE as u64,
                                &zeros[..here as usize * SECTOR_SIZE],
                            )?;
                            at += here;
                            remaining -= here;
                        }
                    }
                    EmptyMode::Skip => {}
                }
                cursor += n;
            }
            Element::Copy {
                source,
                sector,
                len,
            } => {
                let mut done = 0u64;
                while done < *len {
                    let here = (*len - done).min(chunk_sectors);
                    let buf =
                        read_copy(vhd, raw.as_deref_mut(), *source, sector + done, here)?;
                    out.write_all_at((cursor + done) * SECTOR_SIZE as u64, &buf)?;
                    done += here;
                }
                cursor += len;
            }
        }
    }

    Ok(cursor)
}

/// Rewrite every `Copy` into literal `Sectors` read in 2 MiB windows, moving
/// the accounting from `copy` to `metadata`.
pub fn expand_copy<B: StorageBackend>(
    mut stream: Stream,
    vhd: &mut Vhd<B>,
    mut raw: Option<&mut B>,
) -> Result<Stream> {
    let chunk_sectors = (EXPAND_CHUNK / SECTOR_SIZE) as u64;
    let mut out = Vec::with_capacity(stream.elements.len());
    for element in stream.elements.drain(..) {
        match element {
            Element::Copy {
                source,
                sector,
                len,
            } => {
                stream.size.copy -= len * SECTOR_SIZE as u64;
                let mut done = 0u64;
                while done < len {
                    let here = (len - done).min(chunk_sectors);
                    let buf = read_copy(vhd, raw.as_deref_mut(), source, sector + done, here)?;
                    stream.size.metadata += buf.len() as u64;
                    out.push(Element::Sectors(buf));
                    done += here;
                }
            }
            other => out.push(other),
        }
    }
    Ok(Stream {
        elements: out,
        size: stream.size,
    })
}

fn read_copy<B: StorageBackend>(
    vhd: &mut Vhd<B>,
    raw: Option<&mut B>,
    source: CopySource,
    sector: u64,
    len: u64,
) -> Result<Vec<u8>> {
    let bytes: usize = (len * SECTOR_SIZE as u64)
        .try_into()
        .map_err(|_| VhdError::OffsetOverflow)?;
    let mut buf = vec![0u8; bytes];
    let offset = sector
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(VhdError::OffsetOverflow)?;
    match source {
        CopySource::Layer(depth) => {
            let layer = vhd
                .nth_layer_mut(depth)
                .ok_or(VhdError::CorruptImage("copy source layer out of chain"))?;
            layer.backend_mut().read_exact_at(offset, &mut buf)?;
        }
        CopySource::Raw => {
            let raw = raw.ok_or(VhdError::InvalidConfig(
                "stream references a raw source but none was provided",
            ))?;
            raw.read_exact_at(offset, &mut buf)?;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(layer: usize, sector: u64, len: u64) -> Element {
        Element::Copy {
            source: CopySource::Layer(layer),
            sector,
            len,
        }
    }

    fn stream_of(elements: Vec<Element>) -> Stream {
        let mut size = StreamSize::default();
        for e in &elements {
            match e {
                Element::Sectors(b) => size.metadata += b.len() as u64,
                Element::Empty(n) => size.empty += n * SECTOR_SIZE as u64,
                Element::Copy { len, .. } => size.copy += len * SECTOR_SIZE as u64,
            }
        }
        Stream { elements, size }
    }

    #[test]
    fn coalesce_merges_empty_runs() {
        let stream = stream_of(vec![
            Element::Empty(1),
            Element::Empty(2),
            Element::Empty(3),
        ]);
        let coalesced = stream.coalesce();
        assert_eq!(coalesced.elements, vec![Element::Empty(6)]);
    }

    #[test]
    fn coalesce_merges_forward_and_backward_copies() {
        let stream = stream_of(vec![copy(0, 10, 2), copy(0, 12, 3), copy(0, 7, 3)]);
        let coalesced = stream.coalesce();
        assert_eq!(coalesced.elements, vec![copy(0, 7, 8)]);
    }

    #[test]
    fn coalesce_keeps_copies_from_different_sources_apart() {
        let stream = stream_of(vec![copy(0, 10, 2), copy(1, 12, 3)]);
        let coalesced = stream.coalesce();
        assert_eq!(coalesced.elements.len(), 2);
    }

    #[test]
    fn coalesce_never_merges_sectors() {
        let stream = stream_of(vec![
            Element::Sectors(vec![0; 512]),
            Element::Sectors(vec![0; 512]),
        ]);
        let coalesced = stream.coalesce();
        assert_eq!(coalesced.elements.len(), 2);
    }

    #[test]
    fn coalesce_is_idempotent() {
        let stream = stream_of(vec![
            copy(0, 0, 1),
            copy(0, 1, 1),
            Element::Empty(1),
            Element::Empty(4),
            copy(1, 9, 1),
            copy(1, 8, 1),
        ]);
        let once = stream.coalesce();
        let twice = once.clone().coalesce();
        assert_eq!(once, twice);
    }

    #[test]
    fn expand_empty_preserves_length_and_accounting() {
        let stream = stream_of(vec![Element::Empty(4096 + 10)]);
        let before = stream.len_sectors();
        let expanded = stream.expand_empty();

        assert_eq!(expanded.len_sectors(), before);
        assert_eq!(expanded.size.empty, 0);
        assert_eq!(expanded.size.metadata, before * SECTOR_SIZE as u64);
        // One full 2 MiB chunk and a 10-sector tail.
        assert_eq!(expanded.elements.len(), 2);
        assert!(
            expanded
                .elements
                .iter()
                .all(|e| matches!(e, Element::Sectors(_)))
        );
    }
}

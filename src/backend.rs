use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Result, VhdError};

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 00:00:00 UTC).
pub const VHD_EPOCH_UNIX: u64 = 946_684_800;

/// One open image file, byte-addressed.
///
/// The engine never tolerates short transfers: `read_exact_at` and
/// `write_all_at` either move every requested byte or return an error, so a
/// partially-applied operation is only ever observable as a failure. Writes
/// past the current end grow the file.
pub trait StorageBackend {
    /// File size in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Grow or shrink the file to exactly `size` bytes; growth reads as
    /// zeros.
    fn resize(&mut self, size: u64) -> Result<()>;

    /// Fill `buf` from the file starting at `offset`, or fail without a
    /// partial result.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Put all of `buf` at `offset`, extending the file when the range ends
    /// past its current size.
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Push buffered writes down to the underlying storage.
    fn flush(&mut self) -> Result<()>;
}

/// What the engine needs from the surrounding filesystem: handles for image
/// files, existence probes while hunting for a parent, and a clock for the
/// footer timestamps.
///
/// Times are seconds since the VHD epoch (2000-01-01 UTC).
pub trait StorageHost {
    type Backend: StorageBackend;

    fn open(&self, path: &str) -> Result<Self::Backend>;
    fn create(&self, path: &str) -> Result<Self::Backend>;
    fn exists(&self, path: &str) -> bool;
    fn file_size(&self, path: &str) -> Result<u64>;
    fn modification_time(&self, path: &str) -> Result<u32>;
    fn now(&self) -> u32;
}

/// In-memory storage backend used for tests and synthetic images.
///
/// Cloning shares the underlying buffer, which is what [`MemHost`] relies on
/// to hand out multiple handles to the same "file".
#[derive(Clone, Debug, Default)]
pub struct MemBackend {
    data: Rc<RefCell<Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let len_usize: usize = len.try_into().map_err(|_| VhdError::OffsetOverflow)?;
        Ok(Self {
            data: Rc::new(RefCell::new(vec![0; len_usize])),
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Rc::new(RefCell::new(data)),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

impl StorageBackend for MemBackend {
    fn size(&mut self) -> Result<u64> {
        Ok(self.data.borrow().len() as u64)
    }

    fn resize(&mut self, size: u64) -> Result<()> {
        let len: usize = size.try_into().map_err(|_| VhdError::OffsetOverflow)?;
        self.data.borrow_mut().resize(len, 0);
        Ok(())
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.borrow();
        let start: usize = offset.try_into().map_err(|_| VhdError::OffsetOverflow)?;
        let end = start
            .checked_add(buf.len())
            .ok_or(VhdError::OffsetOverflow)?;
        if end > data.len() {
            return Err(VhdError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: data.len() as u64,
            });
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.borrow_mut();
        let start: usize = offset.try_into().map_err(|_| VhdError::OffsetOverflow)?;
        let end = start
            .checked_add(buf.len())
            .ok_or(VhdError::OffsetOverflow)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory filesystem for tests: a name → buffer map plus a settable clock.
#[derive(Clone, Default)]
pub struct MemHost {
    files: Rc<RefCell<HashMap<String, MemBackend>>>,
    mtimes: Rc<RefCell<HashMap<String, u32>>>,
    clock: Rc<Cell<u32>>,
}

impl MemHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_now(&self, now: u32) {
        self.clock.set(now);
    }

    /// Install a pre-built file, for constructing corrupt or hand-rolled images.
    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.files
            .borrow_mut()
            .insert(path.to_string(), MemBackend::from_vec(data));
        self.mtimes
            .borrow_mut()
            .insert(path.to_string(), self.clock.get());
    }

    pub fn snapshot(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).map(|b| b.snapshot())
    }
}

impl StorageHost for MemHost {
    type Backend = MemBackend;

    fn open(&self, path: &str) -> Result<MemBackend> {
        self.files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| VhdError::Io(format!("no such file: {path}")))
    }

    fn create(&self, path: &str) -> Result<MemBackend> {
        let backend = MemBackend::new();
        self.files
            .borrow_mut()
            .insert(path.to_string(), backend.clone());
        self.mtimes
            .borrow_mut()
            .insert(path.to_string(), self.clock.get());
        Ok(backend)
    }

    fn exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        self.open(path)?.size()
    }

    fn modification_time(&self, path: &str) -> Result<u32> {
        self.mtimes
            .borrow()
            .get(path)
            .copied()
            .ok_or_else(|| VhdError::Io(format!("no such file: {path}")))
    }

    fn now(&self) -> u32 {
        self.clock.get()
    }
}

/// File-backed storage for native use.
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self { file })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }
}

impl StorageBackend for FileBackend {
    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn resize(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        // Reject the range up front so a read that would run off the end
        // reports OutOfBounds rather than a bare io error from read_exact.
        let file_len = self.file.metadata()?.len();
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        if end > file_len {
            return Err(VhdError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: file_len,
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Host over the real filesystem. Paths are interpreted as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileHost;

fn vhd_time(time: SystemTime) -> u32 {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(VHD_EPOCH_UNIX).min(u32::MAX as u64) as u32
}

impl StorageHost for FileHost {
    type Backend = FileBackend;

    fn open(&self, path: &str) -> Result<FileBackend> {
        FileBackend::open(path)
    }

    fn create(&self, path: &str) -> Result<FileBackend> {
        FileBackend::create(path, 0)
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn modification_time(&self, path: &str) -> Result<u32> {
        Ok(vhd_time(std::fs::metadata(path)?.modified()?))
    }

    fn now(&self) -> u32 {
        vhd_time(SystemTime::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_read_write_round_trip() {
        let mut backend = MemBackend::new();
        backend.write_all_at(4, b"abcd").unwrap();
        assert_eq!(backend.size().unwrap(), 8);

        let mut buf = [0u8; 4];
        backend.read_exact_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn mem_backend_read_past_end_is_out_of_bounds() {
        let mut backend = MemBackend::with_len(8).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            backend.read_exact_at(6, &mut buf).unwrap_err(),
            VhdError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn mem_backend_resize_grows_with_zeros() {
        let mut backend = MemBackend::from_vec(vec![7; 2]);
        backend.resize(4).unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, &[7, 7, 0, 0]);
    }

    #[test]
    fn mem_host_shares_contents_between_handles() {
        let host = MemHost::new();
        let mut a = host.create("disk.vhd").unwrap();
        a.write_all_at(0, b"hello").unwrap();

        let mut b = host.open("disk.vhd").unwrap();
        let mut buf = [0u8; 5];
        b.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(host.file_size("disk.vhd").unwrap(), 5);
    }

    #[test]
    fn mem_host_open_missing_file_fails() {
        let host = MemHost::new();
        assert!(!host.exists("missing.vhd"));
        assert!(host.open("missing.vhd").is_err());
    }
}

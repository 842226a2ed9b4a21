//! Shared memory-mapped regions
//!
//! A [`MappedRegion`] is a read-write `MAP_SHARED` mapping of a whole file.
//! Every process that maps the same file sees the same bytes, so 64-bit and
//! 32-bit words inside the region can be driven with hardware atomics and act
//! as cross-process coordination points.
//!
//! Regions never grow or remap: the file is sized once at open. Handles keep
//! the region alive through an `Arc`, so nothing is unmapped while a slot
//! handle still points into it.

use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use strata_queue_core::{Error, Result};

/// State word value while the first opener formats the file
pub(crate) const FORMATTING: u32 = 1;

/// A shared read-write mapping of one file.
pub struct MappedRegion {
    /// Keeps the mapping alive; all access goes through `ptr`
    mmap: MmapMut,
    /// Base of the mapping
    ptr: *mut u8,
    /// Length of the mapping in bytes
    len: usize,
    /// Path of the backing file
    path: PathBuf,
    /// Kept open for the lifetime of the mapping
    _file: File,
}

// SAFETY: the mapping is never remapped or resized while the region lives, and
// shared words are only touched through atomics. Plain byte writes go to
// regions that are not yet published through an atomic (staged padding, key
// bytes of an unpublished table entry).
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Open or create `path` and map at least `min_len` bytes of it.
    ///
    /// A shorter file is extended (zero-filled); a longer file is mapped whole.
    pub fn open(path: &Path, min_len: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() < min_len {
            file.set_len(min_len)?;
        }
        let len = file.metadata()?.len() as usize;

        // SAFETY: the file is opened read-write and sized above. Other
        // processes may change the bytes underneath us, which is the point;
        // we never hand out `&[u8]` views that assume immutability.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }?;
        let ptr = mmap.as_mut_ptr();

        Ok(MappedRegion {
            mmap,
            ptr,
            len,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Length of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length mapping
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The 64-bit word at `offset`.
    ///
    /// # Panics
    ///
    /// If `offset` is not 8-byte aligned or the word is out of bounds.
    pub fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        assert_eq!(offset % 8, 0, "unaligned i64 slot at {}", offset);
        assert!(offset + 8 <= self.len, "i64 slot {} out of bounds", offset);
        // SAFETY: in bounds, aligned (mmap base is page aligned), and the
        // reference lives no longer than `self`, which owns the mapping.
        unsafe { &*(self.ptr.add(offset) as *const AtomicI64) }
    }

    /// The 32-bit word at `offset`.
    ///
    /// # Panics
    ///
    /// If `offset` is not 4-byte aligned or the word is out of bounds.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert_eq!(offset % 4, 0, "unaligned u32 word at {}", offset);
        assert!(offset + 4 <= self.len, "u32 word {} out of bounds", offset);
        // SAFETY: as for `atomic_i64`.
        unsafe { &*(self.ptr.add(offset) as *const AtomicU32) }
    }

    /// Copy `bytes` into the region at `offset`.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        // SAFETY: range checked above; the destination is not aliased by any
        // Rust reference because all published words are read atomically.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Fill `len` bytes at `offset` with `value`.
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: as for `write_bytes`.
        unsafe {
            std::ptr::write_bytes(self.ptr.add(offset), value, len);
        }
        Ok(())
    }

    /// Copy `len` bytes out of the region starting at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Flush dirty pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Run `format` exactly once across every process mapping this file.
    ///
    /// The u32 at `state_offset` goes `0 -> FORMATTING -> magic`. The opener
    /// that wins the first CAS runs `format` and publishes `magic`; everyone
    /// else waits up to `timeout` for the magic to appear.
    pub(crate) fn initialize_once<F>(
        &self,
        state_offset: usize,
        magic: u32,
        timeout: Duration,
        format: F,
    ) -> Result<()>
    where
        F: FnOnce(&MappedRegion) -> Result<()>,
    {
        let state = self.atomic_u32(state_offset);
        let start = Instant::now();
        loop {
            if state
                .compare_exchange(0, FORMATTING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Err(e) = format(self) {
                    // let the next opener try again
                    state.store(0, Ordering::Release);
                    return Err(e);
                }
                state.store(magic, Ordering::Release);
                return Ok(());
            }

            match state.load(Ordering::Acquire) {
                m if m == magic => return Ok(()),
                0 => continue,
                FORMATTING => {
                    if start.elapsed() > timeout {
                        return Err(Error::Timeout(format!(
                            "{} is still being formatted by another process",
                            self.path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => {
                    return Err(Error::corruption(format!(
                        "{} has unexpected magic {:#010x}",
                        self.path.display(),
                        other
                    )))
                }
            }
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::invalid(format!(
                "range {}..{} outside mapping of {} bytes",
                offset,
                offset.saturating_add(len),
                self.len
            ))),
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_extends_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region.bin");
        let region = MappedRegion::open(&path, 4096).unwrap();
        assert_eq!(region.len(), 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn test_two_mappings_share_words() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region.bin");
        let a = MappedRegion::open(&path, 4096).unwrap();
        let b = MappedRegion::open(&path, 4096).unwrap();

        a.atomic_i64(8).store(42, Ordering::Release);
        assert_eq!(b.atomic_i64(8).load(Ordering::Acquire), 42);

        b.write_bytes(100, b"hello").unwrap();
        assert_eq!(a.read_bytes(100, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_out_of_range_write_is_rejected() {
        let dir = TempDir::new().unwrap();
        let region = MappedRegion::open(&dir.path().join("r.bin"), 1024).unwrap();
        assert!(region.write_bytes(1020, &[0u8; 8]).is_err());
        assert!(region.read_bytes(usize::MAX, 2).is_err());
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn test_unaligned_slot_panics() {
        let dir = TempDir::new().unwrap();
        let region = MappedRegion::open(&dir.path().join("r.bin"), 1024).unwrap();
        region.atomic_i64(4);
    }

    #[test]
    fn test_initialize_once_runs_format_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.bin");
        let a = MappedRegion::open(&path, 1024).unwrap();
        let b = MappedRegion::open(&path, 1024).unwrap();
        let magic = u32::from_le_bytes(*b"TEST");

        a.initialize_once(0, magic, Duration::from_millis(100), |r| {
            r.atomic_i64(8).store(7, Ordering::Release);
            Ok(())
        })
        .unwrap();
        b.initialize_once(0, magic, Duration::from_millis(100), |r| {
            r.atomic_i64(8).store(99, Ordering::Release);
            Ok(())
        })
        .unwrap();

        assert_eq!(b.atomic_i64(8).load(Ordering::Acquire), 7);
    }

    #[test]
    fn test_initialize_once_rejects_foreign_magic() {
        let dir = TempDir::new().unwrap();
        let region = MappedRegion::open(&dir.path().join("r.bin"), 1024).unwrap();
        region.atomic_u32(0).store(0xDEAD_BEEF, Ordering::Release);
        let err = region
            .initialize_once(0, 0x1234_5678, Duration::from_millis(10), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}

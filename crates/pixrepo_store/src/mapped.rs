//! An owned memory-mapped view of a backing file.
//!
//! All pixel and metadata addressing in the engine goes through
//! [`MappedFile`]: a byte slice with bounds-checked range accessors, never a
//! raw pointer. The mapping is kept consistent with the file's on-disk
//! length by construction; [`MappedFile::resize`] is the only way to change
//! the length, and it unmaps, resizes, and remaps in one step.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use pixrepo_lock::LockMode;

use crate::error::StoreError;

/// The mapping itself. Zero-length files are represented without a kernel
/// mapping at all, since `mmap(2)` rejects a zero length.
enum Mapping {
    Empty,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// An open file together with a memory map of its full contents.
pub struct MappedFile {
    file: File,
    map: Mapping,
    path: PathBuf,
    writable: bool,
}

impl MappedFile {
    /// Opens the file at `path` read-only and maps it.
    pub fn open_ro(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new().read(true).open(&path)?;
        Self::from_file(file, path, false)
    }

    /// Opens the file at `path` for reading and writing and maps it.
    pub fn open_rw(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)?;
        Self::from_file(file, path, true)
    }

    /// Maps an already open descriptor. `writable` must match the mode the
    /// file was opened with.
    pub fn from_file(file: File, path: PathBuf, writable: bool) -> std::io::Result<Self> {
        let map = map_file(&file, writable)?;
        Ok(Self {
            file,
            map,
            path,
            writable,
        })
    }

    /// The mapped length in bytes.
    pub fn len(&self) -> u64 {
        match &self.map {
            Mapping::Empty => 0,
            Mapping::ReadOnly(m) => m.len() as u64,
            Mapping::ReadWrite(m) => m.len() as u64,
        }
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The underlying descriptor, for range locking.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// The path this mapping was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The full mapped contents.
    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Mapping::Empty => &[],
            Mapping::ReadOnly(m) => m.as_ref(),
            Mapping::ReadWrite(m) => m.as_ref(),
        }
    }

    /// The full mapped contents, mutably. Fails on a read-only mapping.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8], StoreError> {
        match &mut self.map {
            Mapping::ReadWrite(m) => Ok(m.as_mut()),
            Mapping::Empty if self.writable => Ok(&mut []),
            _ => Err(StoreError::ReadOnlyMap(self.path.clone())),
        }
    }

    /// A bounds-checked subslice of the mapping.
    pub fn range(&self, offset: u64, len: u64) -> Result<&[u8], StoreError> {
        let (start, end) = self.check_range(offset, len)?;
        Ok(&self.as_slice()[start..end])
    }

    /// A bounds-checked mutable subslice of the mapping.
    pub fn range_mut(&mut self, offset: u64, len: u64) -> Result<&mut [u8], StoreError> {
        let (start, end) = self.check_range(offset, len)?;
        Ok(&mut self.as_mut_slice()?[start..end])
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(usize, usize), StoreError> {
        let map_len = self.len();
        let out_of_range = || StoreError::MapOutOfRange {
            path: self.path.clone(),
            offset,
            len,
            map_len,
        };
        let end = offset.checked_add(len).ok_or_else(out_of_range)?;
        if end > map_len {
            return Err(out_of_range());
        }
        Ok((offset as usize, end as usize))
    }

    /// Changes the file's length and remaps it.
    ///
    /// The previous mapping is dropped before the file is resized, so no
    /// view of the old length survives the call. Only writable mappings can
    /// be resized.
    pub fn resize(&mut self, new_len: u64) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnlyMap(self.path.clone()));
        }
        self.map = Mapping::Empty;
        self.file.set_len(new_len)?;
        self.map = map_file(&self.file, true)?;
        Ok(())
    }

    /// Takes an advisory lock on a byte range of the backing file, blocking
    /// if another process holds a conflicting lock.
    ///
    /// Filesystems without record-locking support are treated as if the
    /// lock succeeded. The caller pairs this with [`MappedFile::unlock_range`]
    /// over the same range.
    pub fn lock_range(
        &self,
        mode: LockMode,
        offset: u64,
        len: u64,
        what: &str,
    ) -> std::io::Result<()> {
        match pixrepo_lock::try_lock(&self.file, mode, offset, len) {
            Ok(()) => Ok(()),
            Err(e) if pixrepo_lock::is_unsupported(&e) => Ok(()),
            Err(e) if pixrepo_lock::is_contended(&e) => {
                tracing::info!("waiting for byte-range lock on {what}");
                pixrepo_lock::lock(&self.file, mode, offset, len)
            }
            Err(e) => Err(e),
        }
    }

    /// Releases an advisory lock on a byte range of the backing file.
    pub fn unlock_range(&self, offset: u64, len: u64) -> std::io::Result<()> {
        match pixrepo_lock::unlock(&self.file, offset, len) {
            Ok(()) => Ok(()),
            Err(e) if pixrepo_lock::is_unsupported(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Flushes mapped writes to disk.
    pub fn flush(&self) -> std::io::Result<()> {
        match &self.map {
            Mapping::ReadWrite(m) => m.flush(),
            _ => Ok(()),
        }
    }

    /// Drops the mapping and returns the path, for callers that are about to
    /// remove the backing file.
    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("writable", &self.writable)
            .finish()
    }
}

fn map_file(file: &File, writable: bool) -> std::io::Result<Mapping> {
    if file.metadata()?.len() == 0 {
        return Ok(Mapping::Empty);
    }
    if writable {
        let map = unsafe { MmapMut::map_mut(file) }?;
        Ok(Mapping::ReadWrite(map))
    } else {
        let map = unsafe { Mmap::map(file) }?;
        Ok(Mapping::ReadOnly(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn write_resize_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        std::fs::write(&path, vec![0u8; 16]).unwrap();

        let mut map = MappedFile::open_rw(&path).unwrap();
        map.range_mut(4, 4).unwrap().copy_from_slice(b"abcd");
        map.flush().unwrap();

        map.resize(32).unwrap();
        assert_eq!(map.len(), 32);
        // Existing content survives a grow, new bytes read as zero.
        assert_eq!(map.range(4, 4).unwrap(), b"abcd");
        assert_eq!(map.range(16, 16).unwrap(), &[0u8; 16]);

        drop(map);
        let ro = MappedFile::open_ro(&path).unwrap();
        assert_eq!(ro.range(4, 4).unwrap(), b"abcd");
    }

    #[test]
    fn read_only_mapping_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        std::fs::write(&path, vec![7u8; 8]).unwrap();

        let mut map = MappedFile::open_ro(&path).unwrap();
        assert_matches!(map.as_mut_slice(), Err(StoreError::ReadOnlyMap(_)));
        assert_matches!(map.resize(16), Err(StoreError::ReadOnlyMap(_)));
    }

    #[test]
    fn range_checks_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        std::fs::write(&path, vec![0u8; 8]).unwrap();

        let map = MappedFile::open_ro(&path).unwrap();
        assert_matches!(map.range(4, 8), Err(StoreError::MapOutOfRange { .. }));
        assert_matches!(
            map.range(u64::MAX, 2),
            Err(StoreError::MapOutOfRange { .. })
        );
        assert_eq!(map.range(8, 0).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn zero_length_files_map_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let map = MappedFile::open_ro(&path).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.as_slice(), &[] as &[u8]);
    }
}

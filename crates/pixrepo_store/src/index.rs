//! The digest-index collaborator.
//!
//! The engine identifies duplicate content by looking a SHA-1 digest up in a
//! keyed store mapping digest → object id. The store itself is external to
//! the engine: anything implementing [`Sha1Index`] will do. Two
//! implementations ship with the crate: [`MemoryIndex`] for tests and
//! [`FsIndex`], a flat file of fixed-size records guarded by whole-file
//! range locks. `FsIndex` is deliberately simple — the contract is the
//! trait, not its file format.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pixrepo_digest::Sha1Hash;
use pixrepo_lock::{LockMode, RangeGuard};

use crate::error::IndexError;
use crate::oid::Oid;

/// The outcome of recording a digest in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The digest was not present and has been recorded.
    Inserted,
    /// The digest was already present, mapped to this object.
    Exists(Oid),
}

/// A keyed store mapping content digests to object identifiers.
///
/// All methods take `&self`: implementations are expected to do their own
/// synchronization, since in the repository's process model the same index
/// is mutated by many processes at once.
pub trait Sha1Index {
    /// Looks up the object recorded for `digest`.
    fn get(&self, digest: &Sha1Hash) -> Result<Option<Oid>, IndexError>;

    /// Records `digest → oid` unless the digest is already present.
    fn put(&self, digest: &Sha1Hash, oid: Oid) -> Result<PutOutcome, IndexError>;

    /// Points `digest` at `oid`, inserting or overwriting.
    fn update(&self, digest: &Sha1Hash, oid: Oid) -> Result<(), IndexError>;

    /// Removes the entry for `digest`. Removing an absent digest is a no-op.
    fn delete(&self, digest: &Sha1Hash) -> Result<(), IndexError>;
}

/// An in-memory index for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: Mutex<HashMap<[u8; 20], u64>>,
}

impl MemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

fn digest_key(digest: &Sha1Hash) -> [u8; 20] {
    let mut key = [0u8; 20];
    key.copy_from_slice(&digest[..]);
    key
}

impl Sha1Index for MemoryIndex {
    fn get(&self, digest: &Sha1Hash) -> Result<Option<Oid>, IndexError> {
        let entries = self.entries.lock().expect("index mutex poisoned");
        Ok(entries.get(&digest_key(digest)).copied().map(Oid::new))
    }

    fn put(&self, digest: &Sha1Hash, oid: Oid) -> Result<PutOutcome, IndexError> {
        let mut entries = self.entries.lock().expect("index mutex poisoned");
        match entries.entry(digest_key(digest)) {
            std::collections::hash_map::Entry::Occupied(e) => {
                Ok(PutOutcome::Exists(Oid::new(*e.get())))
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(oid.raw());
                Ok(PutOutcome::Inserted)
            }
        }
    }

    fn update(&self, digest: &Sha1Hash, oid: Oid) -> Result<(), IndexError> {
        let mut entries = self.entries.lock().expect("index mutex poisoned");
        entries.insert(digest_key(digest), oid.raw());
        Ok(())
    }

    fn delete(&self, digest: &Sha1Hash) -> Result<(), IndexError> {
        let mut entries = self.entries.lock().expect("index mutex poisoned");
        entries.remove(&digest_key(digest));
        Ok(())
    }
}

/// Record layout: 20 digest bytes followed by the object id, little endian.
const RECORD_SIZE: u64 = 28;

/// A flat-file index: a sequence of fixed-size records scanned linearly.
///
/// Reads take a shared whole-file lock, mutations an exclusive one, so the
/// index can be shared between processes like every other repository
/// structure. Deletion moves the final record over the removed one and
/// truncates.
#[derive(Debug, Clone)]
pub struct FsIndex {
    path: PathBuf,
}

impl FsIndex {
    /// Creates a handle for the index file at `path`. The file itself is
    /// created lazily on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> IndexError {
        IndexError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn open(&self) -> Result<std::fs::File, IndexError> {
        std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_err(e))
    }

    /// Reads every record while holding the given lock mode. I/O goes
    /// through `&File` so a lock guard can keep its borrow of the
    /// descriptor.
    fn read_records(&self, mut file: &std::fs::File) -> Result<Vec<u8>, IndexError> {
        let mut records = Vec::new();
        file.read_to_end(&mut records).map_err(|e| self.io_err(e))?;
        if records.len() as u64 % RECORD_SIZE != 0 {
            return Err(IndexError::Corrupt {
                path: self.path.clone(),
                reason: format!(
                    "length {} is not a multiple of the {RECORD_SIZE}-byte record size",
                    records.len()
                ),
            });
        }
        Ok(records)
    }

    fn find(records: &[u8], digest: &Sha1Hash) -> Option<usize> {
        records
            .chunks_exact(RECORD_SIZE as usize)
            .position(|rec| &rec[..20] == &digest[..])
    }

    fn record_oid(records: &[u8], index: usize) -> Oid {
        let start = index * RECORD_SIZE as usize + 20;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&records[start..start + 8]);
        Oid::new(u64::from_le_bytes(raw))
    }
}

impl Sha1Index for FsIndex {
    fn get(&self, digest: &Sha1Hash) -> Result<Option<Oid>, IndexError> {
        let file = self.open()?;
        let guard = RangeGuard::acquire(&file, LockMode::Shared, 0, 0, "digest index")
            .map_err(|e| self.io_err(e))?;
        let records = self.read_records(&file)?;
        guard.release().map_err(|e| self.io_err(e))?;
        Ok(Self::find(&records, digest).map(|i| Self::record_oid(&records, i)))
    }

    fn put(&self, digest: &Sha1Hash, oid: Oid) -> Result<PutOutcome, IndexError> {
        let file = self.open()?;
        let guard = RangeGuard::acquire(&file, LockMode::Exclusive, 0, 0, "digest index")
            .map_err(|e| self.io_err(e))?;
        let records = self.read_records(&file)?;
        if let Some(i) = Self::find(&records, digest) {
            return Ok(PutOutcome::Exists(Self::record_oid(&records, i)));
        }
        let mut f = &file;
        f.seek(SeekFrom::End(0)).map_err(|e| self.io_err(e))?;
        f.write_all(&digest[..]).map_err(|e| self.io_err(e))?;
        f.write_all(&oid.raw().to_le_bytes())
            .map_err(|e| self.io_err(e))?;
        f.flush().map_err(|e| self.io_err(e))?;
        guard.release().map_err(|e| self.io_err(e))?;
        Ok(PutOutcome::Inserted)
    }

    fn update(&self, digest: &Sha1Hash, oid: Oid) -> Result<(), IndexError> {
        let file = self.open()?;
        let guard = RangeGuard::acquire(&file, LockMode::Exclusive, 0, 0, "digest index")
            .map_err(|e| self.io_err(e))?;
        let records = self.read_records(&file)?;
        let offset = match Self::find(&records, digest) {
            Some(i) => i as u64 * RECORD_SIZE,
            // Upsert: an absent digest is appended.
            None => records.len() as u64,
        };
        let mut f = &file;
        f.seek(SeekFrom::Start(offset)).map_err(|e| self.io_err(e))?;
        f.write_all(&digest[..]).map_err(|e| self.io_err(e))?;
        f.write_all(&oid.raw().to_le_bytes())
            .map_err(|e| self.io_err(e))?;
        f.flush().map_err(|e| self.io_err(e))?;
        guard.release().map_err(|e| self.io_err(e))
    }

    fn delete(&self, digest: &Sha1Hash) -> Result<(), IndexError> {
        let file = self.open()?;
        let guard = RangeGuard::acquire(&file, LockMode::Exclusive, 0, 0, "digest index")
            .map_err(|e| self.io_err(e))?;
        let records = self.read_records(&file)?;
        let Some(i) = Self::find(&records, digest) else {
            return guard.release().map_err(|e| self.io_err(e));
        };

        let record_count = records.len() / RECORD_SIZE as usize;
        let mut f = &file;
        if i + 1 < record_count {
            // Move the final record over the removed one.
            let last = &records[(record_count - 1) * RECORD_SIZE as usize..];
            f.seek(SeekFrom::Start(i as u64 * RECORD_SIZE))
                .map_err(|e| self.io_err(e))?;
            f.write_all(last).map_err(|e| self.io_err(e))?;
        }
        file.set_len((record_count as u64 - 1) * RECORD_SIZE)
            .map_err(|e| self.io_err(e))?;
        f.flush().map_err(|e| self.io_err(e))?;
        guard.release().map_err(|e| self.io_err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixrepo_digest::{compute_bytes_digest, Sha1};

    fn digest(content: &[u8]) -> Sha1Hash {
        compute_bytes_digest::<Sha1>(content)
    }

    fn fs_index() -> (tempfile::TempDir, FsIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = FsIndex::new(dir.path().join("sha1.idx"));
        (dir, index)
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, index) = fs_index();
        let d = digest(b"some content");

        assert_eq!(index.get(&d).unwrap(), None);
        assert_eq!(index.put(&d, Oid::new(42)).unwrap(), PutOutcome::Inserted);
        assert_eq!(index.get(&d).unwrap(), Some(Oid::new(42)));

        // A second put reports the existing mapping instead of clobbering.
        assert_eq!(
            index.put(&d, Oid::new(43)).unwrap(),
            PutOutcome::Exists(Oid::new(42))
        );
        assert_eq!(index.get(&d).unwrap(), Some(Oid::new(42)));
    }

    #[test]
    fn update_repoints_and_upserts() {
        let (_dir, index) = fs_index();
        let d1 = digest(b"one");
        let d2 = digest(b"two");

        index.put(&d1, Oid::new(1)).unwrap();
        index.update(&d1, Oid::new(9)).unwrap();
        assert_eq!(index.get(&d1).unwrap(), Some(Oid::new(9)));

        index.update(&d2, Oid::new(2)).unwrap();
        assert_eq!(index.get(&d2).unwrap(), Some(Oid::new(2)));
    }

    #[test]
    fn delete_compacts_the_file() {
        let (_dir, index) = fs_index();
        let digests: Vec<_> = (0u8..5).map(|i| digest(&[i])).collect();
        for (i, d) in digests.iter().enumerate() {
            index.put(d, Oid::new(i as u64 + 1)).unwrap();
        }

        index.delete(&digests[1]).unwrap();
        // Deleting something absent is a no-op.
        index.delete(&digests[1]).unwrap();

        assert_eq!(index.get(&digests[1]).unwrap(), None);
        for (i, d) in digests.iter().enumerate() {
            if i != 1 {
                assert_eq!(index.get(d).unwrap(), Some(Oid::new(i as u64 + 1)));
            }
        }
        let len = std::fs::metadata(index.path()).unwrap().len();
        assert_eq!(len, 4 * RECORD_SIZE);
    }

    #[test]
    fn memory_index_matches_trait_contract() {
        let index = MemoryIndex::new();
        let d = digest(b"content");
        assert_eq!(index.get(&d).unwrap(), None);
        assert_eq!(index.put(&d, Oid::new(5)).unwrap(), PutOutcome::Inserted);
        assert_eq!(
            index.put(&d, Oid::new(6)).unwrap(),
            PutOutcome::Exists(Oid::new(5))
        );
        index.update(&d, Oid::new(7)).unwrap();
        assert_eq!(index.get(&d).unwrap(), Some(Oid::new(7)));
        index.delete(&d).unwrap();
        assert_eq!(index.get(&d).unwrap(), None);
    }
}

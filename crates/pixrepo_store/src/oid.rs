//! Object identifiers, the sharded path layout, and exact-size backing-file
//! allocation.
//!
//! Identifiers are issued from a per-kind counter file guarded by an
//! exclusive byte-range lock, so any number of processes can allocate
//! concurrently. An identifier maps to a balanced directory path by base-1000
//! digit grouping: `1` lives at `1`, `1000` at `Dir-001/1000`, `1234567` at
//! `Dir-001/Dir-234/1234567`. Directory fan-out stays below a thousand
//! entries per level without pre-declaring a directory count.

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use pixrepo_lock::{LockMode, RangeGuard};

use crate::error::AllocError;

/// A 64-bit object identifier, unique within one object kind.
///
/// Identifier `0` is never allocated; it is used on disk to mean "no
/// object" (for example in the alias-of field of a file object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(u64);

impl Oid {
    /// Wraps a raw identifier value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Issues the next identifier from the counter file at `path`.
///
/// The counter file is created on first use; an empty or absent counter
/// reads as zero, so the first identifier issued is `1`. The read-increment
/// -write cycle runs under an exclusive whole-file lock.
pub fn next_id(path: &Path) -> Result<Oid, AllocError> {
    let counter_err = |source| AllocError::Counter {
        path: path.to_path_buf(),
        source,
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(counter_err)?;

    let guard = RangeGuard::acquire(&file, LockMode::Exclusive, 0, 0, "object id counter")
        .map_err(counter_err)?;

    // An empty (or freshly created) counter reads as zero. I/O goes through
    // `&File` so the guard can keep its borrow of the descriptor.
    let mut f = &file;
    let mut buf = [0u8; 8];
    let current = match f.read_exact(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
        Err(e) => return Err(counter_err(e)),
    };

    if current == u64::MAX {
        return Err(AllocError::IdSpaceExhausted);
    }
    let next = current + 1;

    f.seek(SeekFrom::Start(0)).map_err(counter_err)?;
    f.write_all(&next.to_le_bytes()).map_err(counter_err)?;
    f.flush().map_err(counter_err)?;

    guard.release().map_err(counter_err)?;
    Ok(Oid(next))
}

/// Returns the repository-relative path of an object's backing file.
///
/// This is a pure function of the identifier: the base-1000 digit groups of
/// `oid / 1000`, most significant first, each named `Dir-<NNN>`, with a leaf
/// file named by the full decimal identifier.
pub fn shard_path(oid: Oid) -> PathBuf {
    let mut groups = Vec::new();
    let mut n = oid.raw() / 1000;
    while n > 0 {
        groups.push(n % 1000);
        n /= 1000;
    }

    let mut path = PathBuf::new();
    for group in groups.iter().rev() {
        path.push(format!("Dir-{group:03}"));
    }
    path.push(oid.raw().to_string());
    path
}

/// Returns the absolute path of an object's backing file under `base`,
/// creating the `Dir-*` chain as a side effect.
///
/// Directory creation is idempotent; "already exists" is success.
pub fn ensure_shard_dirs(base: &Path, oid: Oid) -> Result<PathBuf, AllocError> {
    let full = base.join(shard_path(oid));
    if let Some(parent) = full.parent() {
        fs_err::create_dir_all(parent).map_err(|source| AllocError::Allocate {
            path: full.clone(),
            source,
        })?;
    }
    Ok(full)
}

/// Creates a new backing file of exactly `size` bytes for `oid` under
/// `base`, returning the open descriptor and the file's path.
///
/// The file is created exclusively (a pre-existing file is an error),
/// sparse-extended by seeking to `size - 1` and writing a single byte, and
/// write-locked whole before the descriptor is returned at offset zero. The
/// caller is responsible for releasing that initial lock once the object's
/// structure has been written. Any failure after creation removes the
/// partial file.
pub fn allocate_exact_file(
    base: &Path,
    oid: Oid,
    size: u64,
    suffix: Option<&str>,
) -> Result<(std::fs::File, PathBuf), AllocError> {
    let mut path = ensure_shard_dirs(base, oid)?;
    if let Some(suffix) = suffix {
        path.set_extension(suffix);
    }

    let file = match std::fs::OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(AllocError::AlreadyExists { path });
        }
        Err(source) => return Err(AllocError::Allocate { path, source }),
    };

    // From here on a failure must not leave a partial file behind.
    match init_exact(&file, size) {
        Ok(()) => Ok((file, path)),
        Err(source) => {
            drop(file);
            if let Err(e) = fs_err::remove_file(&path) {
                tracing::warn!(
                    "failed to remove partially allocated file '{}': {e}",
                    path.display()
                );
            }
            Err(AllocError::Allocate { path, source })
        }
    }
}

fn init_exact(file: &std::fs::File, size: u64) -> std::io::Result<()> {
    let mut f = file;
    if size > 0 {
        f.seek(SeekFrom::Start(size - 1))?;
        f.write_all(&[0])?;
    }
    match pixrepo_lock::lock(f, LockMode::Exclusive, 0, 0) {
        Ok(()) => {}
        Err(e) if pixrepo_lock::is_unsupported(&e) => {}
        Err(e) => return Err(e),
    }
    f.seek(SeekFrom::Start(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case(1, "1")]
    #[case(999, "999")]
    #[case(1000, "Dir-001/1000")]
    #[case(999_999, "Dir-999/999999")]
    #[case(1_000_000, "Dir-001/Dir-000/1000000")]
    #[case(1_234_567, "Dir-001/Dir-234/1234567")]
    fn shard_path_digit_grouping(#[case] oid: u64, #[case] expected: &str) {
        assert_eq!(shard_path(Oid::new(oid)), PathBuf::from(expected));
    }

    #[test]
    fn next_id_is_monotonic_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("last_id");
        assert_eq!(next_id(&counter).unwrap(), Oid::new(1));
        assert_eq!(next_id(&counter).unwrap(), Oid::new(2));
        assert_eq!(next_id(&counter).unwrap(), Oid::new(3));
    }

    #[test]
    fn next_id_detects_wraparound() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("last_id");
        std::fs::write(&counter, u64::MAX.to_le_bytes()).unwrap();
        assert_matches!(next_id(&counter), Err(AllocError::IdSpaceExhausted));
    }

    #[test]
    fn allocate_exact_file_is_exact_and_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let oid = Oid::new(1_234_567);

        let (file, path) = allocate_exact_file(dir.path(), oid, 4096, None).unwrap();
        assert_eq!(path, dir.path().join("Dir-001/Dir-234/1234567"));
        assert_eq!(file.metadata().unwrap().len(), 4096);
        pixrepo_lock::unlock(&file, 0, 0).unwrap();
        drop(file);

        // A second allocation of the same identifier must fail and leave the
        // original file untouched.
        assert_matches!(
            allocate_exact_file(dir.path(), oid, 16, None),
            Err(AllocError::AlreadyExists { .. })
        );
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn allocate_exact_file_suffix_names_the_info_file() {
        let dir = tempfile::tempdir().unwrap();
        let (_file, path) = allocate_exact_file(dir.path(), Oid::new(7), 64, Some("info")).unwrap();
        assert_eq!(path, dir.path().join("7.info"));
    }
}

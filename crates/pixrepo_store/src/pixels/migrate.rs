//! In-place migration of older pixels info files.
//!
//! Each on-disk version upgrades to its successor through a pure
//! byte-to-byte conversion; opening chains those conversions until the file
//! is at the current version. Today there is a single hop: version 2, whose
//! statistics records carried no histogram, rewrites as version 3 with
//! every record reset to "not computed" — a histogram cannot be fabricated
//! after the fact, and statistics recompute deterministically on demand.

use std::io::Read;
use std::path::Path;

use crate::error::{FormatError, StoreError};
use crate::mapped::MappedFile;
use crate::pixels::header::{PixelsHeader, HEADER_SIZE, PIXELS_VERSION};
use pixrepo_lock::LockMode;

/// Reads and validates the header at `path`, migrating the file to the
/// current format version first if necessary.
pub(crate) fn open_checked(path: &Path) -> Result<PixelsHeader, StoreError> {
    loop {
        let header = peek_header(path)?;
        if header.version == PIXELS_VERSION {
            return Ok(header);
        }
        migrate(path)?;
    }
}

/// Decodes the header with a plain read, without mapping the file.
fn peek_header(path: &Path) -> Result<PixelsHeader, StoreError> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; HEADER_SIZE as usize];
    if let Err(e) = file.read_exact(&mut buf) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(FormatError::SizeMismatch {
                path: path.to_path_buf(),
                expected: HEADER_SIZE,
                actual: file.metadata().map(|m| m.len()).unwrap_or(0),
            }
            .into());
        }
        return Err(e.into());
    }
    Ok(PixelsHeader::decode(&buf)?)
}

/// Rewrites the file at `path` as the current version, under an exclusive
/// whole-file lock.
///
/// Sealed objects sit behind read-only permissions; those are lifted for
/// the rewrite and restored afterwards.
fn migrate(path: &Path) -> Result<(), StoreError> {
    let restore = crate::fsutil::make_writable(path)?;
    let result = migrate_locked(path);
    crate::fsutil::restore_permissions(path, restore);
    result
}

fn migrate_locked(path: &Path) -> Result<(), StoreError> {
    let mut map = MappedFile::open_rw(path)?;
    map.lock_range(LockMode::Exclusive, 0, 0, "pixels info during format migration")?;
    let result = upgrade_in_place(&mut map);
    map.unlock_range(0, 0)?;
    result
}

fn upgrade_in_place(map: &mut MappedFile) -> Result<(), StoreError> {
    let header = PixelsHeader::decode(map.as_slice())?;
    if header.version == PIXELS_VERSION {
        // Another process migrated while we waited for the lock.
        return Ok(());
    }

    let upgraded = upgrade_v2_to_v3(map.as_slice(), &header, map.path())?;
    map.resize(upgraded.len() as u64)?;
    map.as_mut_slice()?.copy_from_slice(&upgraded);
    map.flush()?;
    tracing::debug!(
        "migrated '{}' from format version {} to {PIXELS_VERSION}",
        map.path().display(),
        header.version
    );
    Ok(())
}

/// The version 2 → 3 conversion: header fields carry over unchanged,
/// statistics arrays are reset.
fn upgrade_v2_to_v3(
    bytes: &[u8],
    header: &PixelsHeader,
    path: &Path,
) -> Result<Vec<u8>, StoreError> {
    let shape = header.shape;
    if bytes.len() as u64 != shape.info_size_v2() {
        return Err(FormatError::SizeMismatch {
            path: path.to_path_buf(),
            expected: shape.info_size_v2(),
            actual: bytes.len() as u64,
        }
        .into());
    }

    // Zeroed statistics records decode as "not computed".
    let mut out = vec![0u8; shape.info_size() as usize];
    let mut upgraded = header.clone();
    upgraded.version = PIXELS_VERSION;
    upgraded.encode(&mut out);
    Ok(out)
}


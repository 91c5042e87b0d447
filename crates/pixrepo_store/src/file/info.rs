//! The on-disk metadata record of a file object.
//!
//! Info layout (little endian):
//!
//! ```text
//! 0    u32  magic signature        4    u32  format version
//! 8    u32  finished flag          12   u64  object id
//! 20   u64  declared content size  28   [u8; 20]  content digest
//! 48   [u8; 256]  display name (NUL padded)
//! 304  u64  alias-of object id (0 = none)
//! 312  u32  alias count            316  u32  dependent-pixels count
//! 320  alias entries, 264 bytes each (u64 id + 256-byte name)
//! ...  dependent pixels ids, u64 each
//! ```
//!
//! Appending or removing an alias or dependency entry changes the file's
//! length; the engine rewrites and remaps under an exclusive whole-file
//! lock.

use std::path::Path;

use pixrepo_digest::Sha1Hash;

use crate::codec::{read_u32, read_u64, write_u32, write_u64};
use crate::error::{FormatError, StoreError};
use crate::oid::Oid;

/// Magic signature of a file-object info file.
pub const FILE_MAGIC: u32 = 0x4649_4C45;
/// The current file-object format version.
pub const FILE_VERSION: u32 = 1;
/// Size of the fixed head in bytes.
pub const HEAD_SIZE: usize = 320;
/// Size of the display-name field; names are NUL padded and at most
/// [`NAME_MAX`] bytes long.
pub const NAME_SIZE: usize = 256;
/// Longest accepted display name in bytes.
pub const NAME_MAX: usize = NAME_SIZE - 1;
/// Size of one encoded alias entry.
pub const ALIAS_ENTRY_SIZE: usize = 8 + NAME_SIZE;

/// An alias record attached to a representative file object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    /// Identifier of the alias object.
    pub oid: Oid,
    /// The alias's declared display name.
    pub name: String,
}

/// The structural role of a file object in the alias graph.
///
/// Decoding rejects a record that claims to be both an alias and a
/// representative, so the three cases below are exhaustive everywhere past
/// that point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRole {
    /// Not involved in any alias relationship.
    Standalone,
    /// Points at a representative holding the actual content.
    Alias {
        /// The representative's identifier.
        representative: Oid,
    },
    /// Holds content referenced by one or more aliases.
    Representative {
        /// The alias records, in insertion order.
        aliases: Vec<AliasEntry>,
    },
}

/// Decoded metadata of a file object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The object's identifier.
    pub oid: Oid,
    /// Declared content size in bytes.
    pub size: u64,
    /// Whether the object has been sealed.
    pub finished: bool,
    /// Content digest; valid once `finished` is set.
    pub digest: Sha1Hash,
    /// Display name, at most [`NAME_MAX`] bytes.
    pub name: String,
    /// The representative this object aliases, if any.
    pub alias_of: Option<Oid>,
    /// Aliases pointing at this object.
    pub aliases: Vec<AliasEntry>,
    /// Pixels objects whose content was derived from this file.
    pub deps: Vec<Oid>,
}

impl FileInfo {
    /// A fresh, unfinished record for a new object.
    pub fn new(oid: Oid, name: String, size: u64) -> Self {
        Self {
            oid,
            size,
            finished: false,
            digest: Sha1Hash::default(),
            name,
            alias_of: None,
            aliases: Vec::new(),
            deps: Vec::new(),
        }
    }

    /// The object's role in the alias graph.
    pub fn role(&self) -> Result<FileRole, StoreError> {
        match (self.alias_of, self.aliases.is_empty()) {
            (None, true) => Ok(FileRole::Standalone),
            (Some(representative), true) => Ok(FileRole::Alias { representative }),
            (None, false) => Ok(FileRole::Representative {
                aliases: self.aliases.clone(),
            }),
            // An alias with aliases of its own violates the depth-one
            // invariant and is never written by this engine.
            (Some(_), false) => Err(StoreError::CorruptAliasGraph(self.oid)),
        }
    }

    /// Total encoded size of this record.
    pub fn encoded_size(&self) -> usize {
        HEAD_SIZE + self.aliases.len() * ALIAS_ENTRY_SIZE + self.deps.len() * 8
    }

    /// Encodes the whole record, head and arrays.
    pub fn encode_full(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_size()];
        write_u32(&mut buf, 0, FILE_MAGIC);
        write_u32(&mut buf, 4, FILE_VERSION);
        write_u32(&mut buf, 8, u32::from(self.finished));
        write_u64(&mut buf, 12, self.oid.raw());
        write_u64(&mut buf, 20, self.size);
        buf[28..48].copy_from_slice(&self.digest[..]);
        encode_name(&mut buf[48..48 + NAME_SIZE], &self.name);
        write_u64(&mut buf, 304, self.alias_of.map_or(0, Oid::raw));
        write_u32(&mut buf, 312, self.aliases.len() as u32);
        write_u32(&mut buf, 316, self.deps.len() as u32);

        let mut off = HEAD_SIZE;
        for alias in &self.aliases {
            write_u64(&mut buf, off, alias.oid.raw());
            encode_name(&mut buf[off + 8..off + ALIAS_ENTRY_SIZE], &alias.name);
            off += ALIAS_ENTRY_SIZE;
        }
        for dep in &self.deps {
            write_u64(&mut buf, off, dep.raw());
            off += 8;
        }
        buf
    }

    /// Decodes and validates a record. `path` only labels errors.
    pub fn decode(buf: &[u8], path: &Path) -> Result<Self, StoreError> {
        if buf.len() < HEAD_SIZE {
            return Err(FormatError::SizeMismatch {
                path: path.to_path_buf(),
                expected: HEAD_SIZE as u64,
                actual: buf.len() as u64,
            }
            .into());
        }
        let magic = read_u32(buf, 0);
        if magic != FILE_MAGIC {
            return Err(FormatError::BadMagic {
                found: magic,
                expected: FILE_MAGIC,
            }
            .into());
        }
        let version = read_u32(buf, 4);
        if version != FILE_VERSION {
            return Err(FormatError::UnsupportedVersion(version).into());
        }

        let nalias = read_u32(buf, 312) as usize;
        let ndeps = read_u32(buf, 316) as usize;
        let expected = HEAD_SIZE + nalias * ALIAS_ENTRY_SIZE + ndeps * 8;
        if buf.len() != expected {
            return Err(FormatError::SizeMismatch {
                path: path.to_path_buf(),
                expected: expected as u64,
                actual: buf.len() as u64,
            }
            .into());
        }

        let digest = Sha1Hash::clone_from_slice(&buf[28..48]);

        let mut off = HEAD_SIZE;
        let mut aliases = Vec::with_capacity(nalias);
        for _ in 0..nalias {
            aliases.push(AliasEntry {
                oid: Oid::new(read_u64(buf, off)),
                name: decode_name(&buf[off + 8..off + ALIAS_ENTRY_SIZE]),
            });
            off += ALIAS_ENTRY_SIZE;
        }
        let mut deps = Vec::with_capacity(ndeps);
        for _ in 0..ndeps {
            deps.push(Oid::new(read_u64(buf, off)));
            off += 8;
        }

        let alias_of = match read_u64(buf, 304) {
            0 => None,
            raw => Some(Oid::new(raw)),
        };

        Ok(Self {
            oid: Oid::new(read_u64(buf, 12)),
            size: read_u64(buf, 20),
            finished: read_u32(buf, 8) != 0,
            digest,
            name: decode_name(&buf[48..48 + NAME_SIZE]),
            alias_of,
            aliases,
            deps,
        })
    }
}

fn encode_name(field: &mut [u8], name: &str) {
    field.fill(0);
    field[..name.len()].copy_from_slice(name.as_bytes());
}

fn decode_name(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    fn sample() -> FileInfo {
        let mut info = FileInfo::new(Oid::new(12), "image.tif".to_string(), 4096);
        info.finished = true;
        info.digest = pixrepo_digest::compute_bytes_digest::<pixrepo_digest::Sha1>(b"content");
        info.aliases.push(AliasEntry {
            oid: Oid::new(31),
            name: "copy-of-image.tif".to_string(),
        });
        info.deps.push(Oid::new(5));
        info.deps.push(Oid::new(9));
        info
    }

    #[test]
    fn encode_decode_round_trip() {
        let info = sample();
        let bytes = info.encode_full();
        assert_eq!(bytes.len(), info.encoded_size());
        let decoded = FileInfo::decode(&bytes, &PathBuf::from("12.info")).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn decode_rejects_truncated_arrays() {
        let info = sample();
        let bytes = info.encode_full();
        let truncated = &bytes[..bytes.len() - 8];
        assert_matches!(
            FileInfo::decode(truncated, &PathBuf::from("12.info")),
            Err(StoreError::Format(FormatError::SizeMismatch { .. }))
        );
    }

    #[test]
    fn role_is_exhaustive_over_the_three_legal_shapes() {
        let mut info = FileInfo::new(Oid::new(1), "f".into(), 0);
        assert_eq!(info.role().unwrap(), FileRole::Standalone);

        info.alias_of = Some(Oid::new(2));
        assert_eq!(
            info.role().unwrap(),
            FileRole::Alias {
                representative: Oid::new(2)
            }
        );

        info.alias_of = None;
        info.aliases.push(AliasEntry {
            oid: Oid::new(3),
            name: "a".into(),
        });
        assert_matches!(info.role().unwrap(), FileRole::Representative { .. });

        // Both at once is corruption, not a fourth case.
        info.alias_of = Some(Oid::new(2));
        assert_matches!(info.role(), Err(StoreError::CorruptAliasGraph(_)));
    }
}

//! Error types for the repository engine.
//!
//! Every fallible operation returns a `Result` carrying one of the enums
//! below; there is no ambient last-error state. The area enums mirror the
//! failure classes of the engine: allocation, on-disk format, access mode,
//! transfer shortfall, resource, and alias-graph consistency.

use std::path::PathBuf;

use crate::oid::Oid;

/// An error raised while allocating an object identifier or its backing
/// files.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The object-id counter file could not be read or written.
    #[error("failed to access the object id counter at '{path}'")]
    Counter {
        /// Path of the counter file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The 64-bit identifier space has been exhausted. Identifiers are never
    /// reused, so this is fatal for the repository.
    #[error("the object id space is exhausted")]
    IdSpaceExhausted,

    /// A backing file for a freshly allocated identifier already exists.
    #[error("an object file already exists at '{path}'")]
    AlreadyExists {
        /// Path of the conflicting file.
        path: PathBuf,
    },

    /// Creating, extending, or locking a backing file failed.
    #[error("failed to allocate backing file at '{path}'")]
    Allocate {
        /// Path of the file being allocated.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// An error raised when an on-disk structure does not look like what the
/// engine expects.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The magic signature at the start of an info file is wrong.
    #[error("incompatible signature {found:#010x} (expected {expected:#010x})")]
    BadMagic {
        /// The signature found on disk.
        found: u32,
        /// The signature the engine expected.
        expected: u32,
    },

    /// The format version is one this engine cannot read or migrate.
    #[error("unsupported on-disk format version {0}")]
    UnsupportedVersion(u32),

    /// A file's size disagrees with what its header implies.
    #[error("'{path}' is {actual} bytes but its header implies {expected}")]
    SizeMismatch {
        /// Path of the inconsistent file.
        path: PathBuf,
        /// Size implied by the header.
        expected: u64,
        /// Actual size on disk.
        actual: u64,
    },

    /// The requested dimensions cannot describe a storable object.
    #[error("invalid pixel dimensions: {reason}")]
    InvalidShape {
        /// Why the shape was rejected.
        reason: String,
    },
}

/// An error raised by a digest-index collaborator.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The index backing store could not be accessed.
    #[error("failed to access the digest index at '{path}'")]
    Io {
        /// Path of the index.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The index contents are not decodable.
    #[error("the digest index at '{path}' is corrupt: {reason}")]
    Corrupt {
        /// Path of the index.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
}

/// The umbrella error for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Identifier or backing-file allocation failed.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// An on-disk structure is malformed or of an incompatible version.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// A digest-index collaborator failed.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// No object with this identifier exists in the repository.
    #[error("object {0} does not exist")]
    NotFound(Oid),

    /// An unfinished object was opened for reading.
    #[error("attempt to read unfinished object {0}")]
    ReadUnfinished(Oid),

    /// A finished (sealed) object was opened for writing.
    #[error("attempt to write finished object {0}")]
    WriteFinished(Oid),

    /// A handle opened in info-only mode was asked for pixel or content data.
    #[error("object {0} is not open for data access")]
    NotOpenForData(Oid),

    /// A write was attempted through a read-only mapping.
    #[error("the mapping of '{0}' is read-only")]
    ReadOnlyMap(PathBuf),

    /// A byte range fell outside a mapped region. This indicates a corrupt
    /// header or a file that changed size underneath the engine.
    #[error("byte range {offset}+{len} is outside the {map_len}-byte mapping of '{path}'")]
    MapOutOfRange {
        /// Path of the mapped file.
        path: PathBuf,
        /// Start of the requested range.
        offset: u64,
        /// Length of the requested range.
        len: u64,
        /// Total length of the mapping.
        map_len: u64,
    },

    /// Coordinates outside the declared extents were passed to an I/O entry
    /// point.
    #[error("coordinates ({x}, {y}, {z}, {c}, {t}) are outside the image extents")]
    OutOfBounds {
        /// X coordinate.
        x: u32,
        /// Y coordinate.
        y: u32,
        /// Z coordinate.
        z: u32,
        /// Channel coordinate.
        c: u32,
        /// Timepoint coordinate.
        t: u32,
    },

    /// Fewer pixels or bytes were transferred than a whole-region operation
    /// requires.
    #[error("short transfer: expected {expected} but transferred {actual}")]
    ShortTransfer {
        /// The requested amount.
        expected: u64,
        /// The amount actually transferred.
        actual: u64,
    },

    /// Statistics were requested for a pixel type the engine cannot
    /// interpret numerically.
    #[error("statistics are not supported for this pixel type (bp={bp}, float={float})")]
    UnsupportedPixelType {
        /// Bytes per pixel.
        bp: u32,
        /// Whether the pixels are floating point.
        float: bool,
    },

    /// A file object claims to be both an alias and a representative. This
    /// state is never produced by the engine and indicates corruption.
    #[error("the alias graph of file object {0} is corrupt (alias with its own aliases)")]
    CorruptAliasGraph(Oid),

    /// A display name exceeds the fixed on-disk name field.
    #[error("display name is {len} bytes, the limit is {max}")]
    NameTooLong {
        /// Length of the rejected name.
        len: usize,
        /// The maximum length.
        max: usize,
    },

    /// An I/O failure not covered by a more specific variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

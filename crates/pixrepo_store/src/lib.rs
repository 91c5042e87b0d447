//! Content-addressable repository engine for 5-dimensional pixel arrays and
//! opaque uploaded files.
//!
//! # Architecture
//!
//! A repository is a directory tree with two object kinds side by side:
//!
//! ```text
//! <root>/
//!   pixels/
//!     last_id                    per-kind id counter
//!     sha1.idx                   digest index (bundled FsIndex)
//!     Dir-NNN/.../<oid>          raw pixel blob
//!     Dir-NNN/.../<oid>.info     header + statistics arrays
//!   files/
//!     last_id
//!     sha1.idx
//!     Dir-NNN/.../<oid>          raw content (or a symlink for aliases)
//!     Dir-NNN/.../<oid>.info     metadata + alias/dependency arrays
//! ```
//!
//! Objects are created writable at their exact final size, memory mapped,
//! filled through byte-range-locked reads and writes, and sealed: sealing
//! computes a SHA-1 content digest, deduplicates against the digest index,
//! and demotes the backing files to read-only. There are no internal
//! threads; concurrency comes from independent processes sharing the tree,
//! serialized by POSIX-style advisory record locks scoped to the minimum
//! byte range each operation touches.
//!
//! [`Repository`] wires the two engines to their id counters and bundled
//! [`FsIndex`] collaborators; the engines themselves only ever see the
//! [`Sha1Index`] trait.

mod codec;
mod error;
pub mod file;
mod fsutil;
mod index;
mod mapped;
mod oid;
pub mod pixels;

pub use error::{AllocError, FormatError, IndexError, StoreError};
pub use index::{FsIndex, MemoryIndex, PutOutcome, Sha1Index};
pub use mapped::MappedFile;
pub use oid::{allocate_exact_file, ensure_shard_dirs, next_id, shard_path, Oid};

use std::path::{Path, PathBuf};

use file::{FileObject, FileStore};
use pixels::{Pixels, PixelsShape, PixelsStore};

/// How an existing object is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read data and metadata of a finished object.
    Read,
    /// Write data of an unfinished object.
    Write,
    /// Read metadata only; the data blob is not mapped.
    Info,
}

/// An on-disk repository: the two storage engines plus their digest-index
/// collaborators.
///
/// The value holds only paths; every operation re-opens and locks what it
/// needs, so any number of `Repository` values (and processes) can point at
/// the same tree.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    pixels: PixelsStore,
    files: FileStore,
    pixels_index: FsIndex,
    files_index: FsIndex,
}

impl Repository {
    /// Opens the repository at `root`, creating the directory skeleton on
    /// first use.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let pixels_base = root.join("pixels");
        let files_base = root.join("files");
        fs_err::create_dir_all(&pixels_base)?;
        fs_err::create_dir_all(&files_base)?;

        let pixels_index = FsIndex::new(pixels_base.join("sha1.idx"));
        let files_index = FsIndex::new(files_base.join("sha1.idx"));
        Ok(Self {
            root,
            pixels: PixelsStore::new(pixels_base),
            files: FileStore::new(files_base),
            pixels_index,
            files_index,
        })
    }

    /// The repository root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The pixel storage engine.
    pub fn pixels(&self) -> &PixelsStore {
        &self.pixels
    }

    /// The file storage engine.
    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// The digest index used to deduplicate pixels objects.
    pub fn pixels_index(&self) -> &FsIndex {
        &self.pixels_index
    }

    /// The digest index used to deduplicate file objects.
    pub fn files_index(&self) -> &FsIndex {
        &self.files_index
    }

    /// Creates a new, writable pixels object.
    pub fn new_pixels(&self, shape: PixelsShape) -> Result<Pixels, StoreError> {
        self.pixels.new_pixels(shape)
    }

    /// Opens an existing pixels object.
    pub fn open_pixels(
        &self,
        oid: Oid,
        mode: OpenMode,
        caller_big_endian: bool,
    ) -> Result<Pixels, StoreError> {
        self.pixels.open(oid, mode, caller_big_endian)
    }

    /// Seals a pixels object against the repository's own digest index.
    pub fn finish_pixels(
        &self,
        handle: Pixels,
        force: bool,
    ) -> Result<pixels::FinishOutcome, StoreError> {
        self.pixels.finish(handle, force, &self.pixels_index)
    }

    /// Removes a pixels object's backing files.
    pub fn delete_pixels(&self, oid: Oid) -> Result<(), StoreError> {
        self.pixels.delete(oid)
    }

    /// Creates a new, writable file object.
    pub fn new_file(&self, name: &str, size: u64) -> Result<FileObject, StoreError> {
        self.files.new_file(name, size)
    }

    /// Opens an existing file object.
    pub fn open_file(&self, oid: Oid, mode: OpenMode) -> Result<FileObject, StoreError> {
        self.files.open(oid, mode)
    }

    /// Seals a file object against the repository's own digest index.
    pub fn finish_file(&self, handle: FileObject) -> Result<file::FinishOutcome, StoreError> {
        self.files.finish(handle, &self.files_index)
    }

    /// Removes a file object's backing files, leaving its index entry.
    pub fn delete_file(&self, oid: Oid) -> Result<(), StoreError> {
        self.files.delete(oid)
    }

    /// Fully removes a file object, resolving aliases and dependents.
    pub fn expunge_file(&self, oid: Oid) -> Result<(), StoreError> {
        self.files.expunge(oid, &self.pixels, &self.files_index)
    }
}

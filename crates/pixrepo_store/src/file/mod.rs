//! The file storage and dedup/alias engine.
//!
//! A file object is an opaque byte blob plus a metadata record carrying its
//! digest, display name, alias links, and the pixels objects derived from
//! it. Sealing a file deduplicates by content digest: identical content
//! under an already-known name discards the new object, identical content
//! under a new name converts the new object into an *alias* — its content
//! file becomes a symbolic link to the representative's, and the
//! representative gains an alias record. Alias chains never exceed depth
//! one: an alias always points directly at a non-alias representative.

mod info;

pub use info::{AliasEntry, FileInfo, FileRole, NAME_MAX};

use std::io::Read;
use std::path::{Path, PathBuf};

use pixrepo_digest::{compute_bytes_digest, Sha1, Sha1Hash};
use pixrepo_lock::{LockMode, RangeGuard};

use crate::error::StoreError;
use crate::fsutil::{make_writable, remove_quiet, restore_permissions, set_readonly};
use crate::index::{PutOutcome, Sha1Index};
use crate::mapped::MappedFile;
use crate::oid::{allocate_exact_file, next_id, shard_path, Oid};
use crate::pixels::PixelsStore;
use crate::OpenMode;

use info::HEAD_SIZE;

/// How sealing a file object concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The object was sealed under its own identifier as new content.
    Sealed(Oid),
    /// Content and name both already existed; the new object was discarded
    /// and the identifier of the object with the matching name returned.
    Merged(Oid),
    /// The content existed under other names; the new object was kept as an
    /// alias of the representative.
    Aliased {
        /// The new object's own identifier.
        oid: Oid,
        /// The representative holding the content.
        representative: Oid,
    },
}

impl FinishOutcome {
    /// The identifier the caller should use from now on.
    pub fn oid(self) -> Oid {
        match self {
            Self::Sealed(oid) | Self::Merged(oid) | Self::Aliased { oid, .. } => oid,
        }
    }
}

/// The file side of a repository: a base directory with an id counter and
/// sharded object files.
#[derive(Debug, Clone)]
pub struct FileStore {
    base: PathBuf,
    counter: PathBuf,
}

impl FileStore {
    pub(crate) fn new(base: PathBuf) -> Self {
        let counter = base.join("last_id");
        Self { base, counter }
    }

    /// The directory holding file objects.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn rep_path(&self, oid: Oid) -> PathBuf {
        self.base.join(shard_path(oid))
    }

    fn info_path(&self, oid: Oid) -> PathBuf {
        self.rep_path(oid).with_extension("info")
    }

    /// Whether an object with this identifier exists.
    pub fn exists(&self, oid: Oid) -> bool {
        self.info_path(oid).exists()
    }

    /// Creates a new, writable file object of exactly `size` content bytes.
    pub fn new_file(&self, name: &str, size: u64) -> Result<FileObject, StoreError> {
        if name.len() > NAME_MAX {
            return Err(StoreError::NameTooLong {
                len: name.len(),
                max: NAME_MAX,
            });
        }
        let oid = next_id(&self.counter)?;

        let (info_file, info_path) =
            allocate_exact_file(&self.base, oid, HEAD_SIZE as u64, Some("info"))?;
        let (rep_file, rep_path) = match allocate_exact_file(&self.base, oid, size, None) {
            Ok(allocated) => allocated,
            Err(e) => {
                drop(info_file);
                remove_quiet(&info_path);
                return Err(e.into());
            }
        };

        let info = FileInfo::new(oid, name.to_string(), size);
        match Self::init_new(info_file, info_path.clone(), rep_file, rep_path.clone(), info) {
            Ok(object) => Ok(object),
            Err(e) => {
                remove_quiet(&info_path);
                remove_quiet(&rep_path);
                Err(e)
            }
        }
    }

    fn init_new(
        info_file: std::fs::File,
        info_path: PathBuf,
        rep_file: std::fs::File,
        rep_path: PathBuf,
        info: FileInfo,
    ) -> Result<FileObject, StoreError> {
        let mut info_map = MappedFile::from_file(info_file, info_path, true)?;
        let rep = MappedFile::from_file(rep_file, rep_path, true)?;

        info_map
            .as_mut_slice()?
            .copy_from_slice(&info.encode_full());
        info_map.flush()?;

        info_map.unlock_range(0, 0)?;
        rep.unlock_range(0, 0)?;

        Ok(FileObject {
            oid: info.oid,
            info,
            info_map,
            rep: Some(rep),
        })
    }

    /// Opens an existing file object.
    ///
    /// Reading an alias reads the representative's content through the
    /// symbolic link. [`OpenMode::Info`] maps only the metadata.
    pub fn open(&self, oid: Oid, mode: OpenMode) -> Result<FileObject, StoreError> {
        let info_path = self.info_path(oid);
        if !info_path.exists() {
            return Err(StoreError::NotFound(oid));
        }

        let info_map = match mode {
            OpenMode::Write => MappedFile::open_rw(&info_path)?,
            _ => MappedFile::open_ro(&info_path)?,
        };
        let info = FileInfo::decode(info_map.as_slice(), &info_path)?;
        match mode {
            OpenMode::Read if !info.finished => return Err(StoreError::ReadUnfinished(oid)),
            OpenMode::Write if info.finished => return Err(StoreError::WriteFinished(oid)),
            _ => {}
        }

        let rep = match mode {
            OpenMode::Info => None,
            OpenMode::Read => Some(MappedFile::open_ro(self.rep_path(oid))?),
            OpenMode::Write => Some(MappedFile::open_rw(self.rep_path(oid))?),
        };

        Ok(FileObject {
            oid,
            info,
            info_map,
            rep,
        })
    }

    /// Reads and decodes an object's metadata under a shared lock, without
    /// keeping anything open.
    pub fn read_info(&self, oid: Oid) -> Result<FileInfo, StoreError> {
        let path = self.info_path(oid);
        if !path.exists() {
            return Err(StoreError::NotFound(oid));
        }
        let file = std::fs::File::open(&path)?;
        let guard = RangeGuard::acquire(&file, LockMode::Shared, 0, 0, "file info")?;
        // Read through `&File` so the guard keeps its borrow of the
        // descriptor.
        let mut bytes = Vec::new();
        (&file).read_to_end(&mut bytes)?;
        guard.release()?;
        FileInfo::decode(&bytes, &path)
    }

    /// Rewrites an object's metadata under an exclusive whole-file lock,
    /// resizing and remapping as the alias and dependency arrays change
    /// length. Sealed objects have their read-only permissions lifted for
    /// the rewrite and restored afterwards.
    fn modify_info(
        &self,
        oid: Oid,
        mutate: impl FnOnce(&mut FileInfo),
    ) -> Result<FileInfo, StoreError> {
        let path = self.info_path(oid);
        if !path.exists() {
            return Err(StoreError::NotFound(oid));
        }
        let restore = make_writable(&path)?;
        let result = Self::modify_info_locked(&path, mutate);
        restore_permissions(&path, restore);
        result
    }

    fn modify_info_locked(
        path: &Path,
        mutate: impl FnOnce(&mut FileInfo),
    ) -> Result<FileInfo, StoreError> {
        let mut map = MappedFile::open_rw(path)?;
        map.lock_range(LockMode::Exclusive, 0, 0, "file info update")?;
        let result = Self::modify_info_mapped(&mut map, path, mutate);
        map.unlock_range(0, 0)?;
        result
    }

    fn modify_info_mapped(
        map: &mut MappedFile,
        path: &Path,
        mutate: impl FnOnce(&mut FileInfo),
    ) -> Result<FileInfo, StoreError> {
        let mut info = FileInfo::decode(map.as_slice(), path)?;
        mutate(&mut info);
        let bytes = info.encode_full();
        if map.len() != bytes.len() as u64 {
            map.resize(bytes.len() as u64)?;
        }
        map.as_mut_slice()?.copy_from_slice(&bytes);
        map.flush()?;
        Ok(info)
    }

    /// Seals a writable file object.
    ///
    /// The content digest decides the outcome: unknown content seals the
    /// object under its own identifier; known content under a known name
    /// discards the new object ([`FinishOutcome::Merged`]); known content
    /// under a new name converts the object into an alias of the
    /// representative ([`FinishOutcome::Aliased`]).
    pub fn finish(
        &self,
        obj: FileObject,
        index: &dyn Sha1Index,
    ) -> Result<FinishOutcome, StoreError> {
        let oid = obj.oid;
        if obj.info.finished {
            return Err(StoreError::WriteFinished(oid));
        }
        let rep = obj.rep.as_ref().ok_or(StoreError::NotOpenForData(oid))?;

        rep.lock_range(LockMode::Exclusive, 0, 0, "file content during seal")?;
        let digest = compute_bytes_digest::<Sha1>(rep.as_slice());
        rep.unlock_range(0, 0)?;

        if let Some(existing) = index.get(&digest)? {
            return self.dedup_or_reclaim(obj, existing, digest, index);
        }
        match index.put(&digest, oid)? {
            PutOutcome::Exists(existing) => self.dedup_or_reclaim(obj, existing, digest, index),
            PutOutcome::Inserted => self.seal(obj, digest),
        }
    }

    /// Deduplicates against the object the index names, unless that object
    /// was removed with [`FileStore::delete`] (which leaves its index entry
    /// behind); a stale entry is reclaimed for the new object.
    fn dedup_or_reclaim(
        &self,
        obj: FileObject,
        existing: Oid,
        digest: Sha1Hash,
        index: &dyn Sha1Index,
    ) -> Result<FinishOutcome, StoreError> {
        if self.exists(existing) {
            return self.dedup_against(obj, existing, digest);
        }
        tracing::warn!(
            "digest index names missing file {existing}; reclaiming the entry for {}",
            obj.oid
        );
        index.update(&digest, obj.oid)?;
        self.seal(obj, digest)
    }

    fn seal(&self, mut obj: FileObject, digest: Sha1Hash) -> Result<FinishOutcome, StoreError> {
        obj.info.digest = digest;
        obj.info.finished = true;
        obj.info_map
            .as_mut_slice()?
            .copy_from_slice(&obj.info.encode_full());
        obj.info_map.flush()?;
        if let Some(rep) = &obj.rep {
            rep.flush()?;
        }

        let oid = obj.oid;
        let (info_path, rep_path) = obj.into_paths();
        set_readonly(&info_path)?;
        if let Some(rep_path) = rep_path {
            set_readonly(&rep_path)?;
        }
        Ok(FinishOutcome::Sealed(oid))
    }

    /// The content already exists as `rep_oid`. Either merge into an object
    /// that already carries this name, or keep the new object as an alias.
    fn dedup_against(
        &self,
        obj: FileObject,
        rep_oid: Oid,
        digest: Sha1Hash,
    ) -> Result<FinishOutcome, StoreError> {
        let rep_info = self.read_info(rep_oid)?;
        // The index must name a representative; resolving through an alias
        // would build a chain.
        if rep_info.alias_of.is_some() {
            return Err(StoreError::CorruptAliasGraph(rep_oid));
        }

        let name = obj.info.name.clone();
        if rep_info.name == name {
            return self.discard_duplicate(obj, rep_oid);
        }
        if let Some(alias) = rep_info.aliases.iter().find(|a| a.name == name) {
            let matching = alias.oid;
            return self.discard_duplicate(obj, matching);
        }
        self.convert_to_alias(obj, &rep_info, digest)
    }

    fn discard_duplicate(
        &self,
        obj: FileObject,
        existing: Oid,
    ) -> Result<FinishOutcome, StoreError> {
        tracing::debug!(
            "file {} duplicates {existing} by content and name, discarding the new object",
            obj.oid
        );
        let (info_path, rep_path) = obj.into_paths();
        fs_err::remove_file(&info_path)?;
        if let Some(rep_path) = rep_path {
            fs_err::remove_file(&rep_path)?;
        }
        Ok(FinishOutcome::Merged(existing))
    }

    /// Replaces the new object's content file with a symbolic link to the
    /// representative's and registers the alias on both sides. The original
    /// content file is kept as a backup until every step has succeeded and
    /// restored on any failure.
    fn convert_to_alias(
        &self,
        obj: FileObject,
        rep_info: &FileInfo,
        digest: Sha1Hash,
    ) -> Result<FinishOutcome, StoreError> {
        let oid = obj.oid;
        let representative = rep_info.oid;
        let mut info = obj.info.clone();
        let (info_path, rep_path) = obj.into_paths();
        let content_path = rep_path.ok_or(StoreError::NotOpenForData(oid))?;

        let backup = content_path.with_extension("bak");
        fs_err::rename(&content_path, &backup)?;

        let target = match fs_err::canonicalize(self.rep_path(representative)) {
            Ok(target) => target,
            Err(e) => {
                restore_backup(&backup, &content_path);
                return Err(e.into());
            }
        };
        if let Err(e) = symlink_content(&target, &content_path) {
            restore_backup(&backup, &content_path);
            return Err(e.into());
        }

        let alias_entry = AliasEntry {
            oid,
            name: info.name.clone(),
        };
        if let Err(e) = self.modify_info(representative, |rep| {
            if !rep.aliases.iter().any(|a| a.oid == oid) {
                rep.aliases.push(alias_entry);
            }
        }) {
            remove_quiet(&content_path);
            restore_backup(&backup, &content_path);
            return Err(e);
        }

        info.alias_of = Some(representative);
        info.digest = digest;
        info.finished = true;
        if let Err(e) = self.write_sealed_info(&info_path, &info) {
            if let Err(inner) = self.modify_info(representative, |rep| {
                rep.aliases.retain(|a| a.oid != oid);
            }) {
                tracing::warn!(
                    "failed to unwind alias record on {representative} after error: {inner}"
                );
            }
            remove_quiet(&content_path);
            restore_backup(&backup, &content_path);
            return Err(e);
        }

        fs_err::remove_file(&backup)?;
        Ok(FinishOutcome::Aliased {
            oid,
            representative,
        })
    }

    fn write_sealed_info(&self, path: &Path, info: &FileInfo) -> Result<(), StoreError> {
        let mut map = MappedFile::open_rw(path)?;
        map.lock_range(LockMode::Exclusive, 0, 0, "file info update")?;
        let result = Self::modify_info_mapped(&mut map, path, |i| *i = info.clone());
        map.unlock_range(0, 0)?;
        result?;
        drop(map);
        set_readonly(path)?;
        Ok(())
    }

    /// Removes both backing files. The digest-index entry is deliberately
    /// left behind; use [`FileStore::expunge`] for graph-aware removal.
    pub fn delete(&self, oid: Oid) -> Result<(), StoreError> {
        let info_path = self.info_path(oid);
        if !info_path.exists() {
            return Err(StoreError::NotFound(oid));
        }
        fs_err::remove_file(&info_path)?;
        fs_err::remove_file(self.rep_path(oid))?;
        Ok(())
    }

    /// Fully removes a file object, resolving its alias relationships and
    /// re-homing its pixels dependents.
    ///
    /// - A standalone object drops its index entry after verifying its
    ///   dependents are still reachable.
    /// - An alias detaches itself from its representative and transfers its
    ///   dependents there.
    /// - A representative promotes its first alias to carry the content,
    ///   re-points every remaining alias and dependent at it, and updates
    ///   the index.
    pub fn expunge(
        &self,
        oid: Oid,
        pixels: &PixelsStore,
        index: &dyn Sha1Index,
    ) -> Result<(), StoreError> {
        let info = self.read_info(oid)?;
        match info.role()? {
            FileRole::Standalone => {
                for dep in &info.deps {
                    // Reopen each dependent; one that is gone is logged, not
                    // fatal, since the file is going away regardless.
                    if let Err(e) = pixels.open(*dep, OpenMode::Info, false) {
                        tracing::warn!(
                            "pixels dependent {dep} of file {oid} could not be opened: {e}"
                        );
                    }
                }
                index.delete(&info.digest)?;
                self.remove_object_files(oid)
            }
            FileRole::Alias { representative } => {
                self.modify_info(representative, |rep| {
                    rep.aliases.retain(|a| a.oid != oid);
                })?;
                for dep in &info.deps {
                    self.make_pixels_dep(representative, *dep)?;
                }
                self.remove_object_files(oid)
            }
            FileRole::Representative { aliases } => {
                self.promote_alias(oid, &info, &aliases, index)
            }
        }
    }

    /// Promotes the first alias of an expunged representative: the content
    /// file moves onto the promoted object's path, every remaining alias is
    /// re-linked and re-pointed, the dependents transfer, and the index
    /// entry follows the content.
    fn promote_alias(
        &self,
        oid: Oid,
        info: &FileInfo,
        aliases: &[AliasEntry],
        index: &dyn Sha1Index,
    ) -> Result<(), StoreError> {
        let promoted = &aliases[0];
        let remaining = &aliases[1..];

        // The promoted object's content path is currently a symlink at us;
        // replace it with the real content.
        let promoted_content = self.rep_path(promoted.oid);
        fs_err::remove_file(&promoted_content)?;
        fs_err::rename(self.rep_path(oid), &promoted_content)?;

        let target = fs_err::canonicalize(&promoted_content)?;
        for alias in remaining {
            let link = self.rep_path(alias.oid);
            fs_err::remove_file(&link)?;
            symlink_content(&target, &link)?;
            self.modify_info(alias.oid, |a| {
                a.alias_of = Some(promoted.oid);
            })?;
        }

        let deps = info.deps.clone();
        let remaining = remaining.to_vec();
        self.modify_info(promoted.oid, move |p| {
            p.alias_of = None;
            p.aliases = remaining;
            for dep in deps {
                if !p.deps.contains(&dep) {
                    p.deps.push(dep);
                }
            }
        })?;

        index.update(&info.digest, promoted.oid)?;
        tracing::debug!("promoted alias {} to represent the content of expunged file {oid}", promoted.oid);

        fs_err::remove_file(self.info_path(oid))?;
        Ok(())
    }

    fn remove_object_files(&self, oid: Oid) -> Result<(), StoreError> {
        fs_err::remove_file(self.info_path(oid))?;
        fs_err::remove_file(self.rep_path(oid))?;
        Ok(())
    }

    /// Records that the pixels object `pixels_oid` was derived from this
    /// file. Registering an existing dependency is a no-op.
    pub fn make_pixels_dep(&self, file_oid: Oid, pixels_oid: Oid) -> Result<(), StoreError> {
        self.modify_info(file_oid, |info| {
            if !info.deps.contains(&pixels_oid) {
                info.deps.push(pixels_oid);
            }
        })
        .map(|_| ())
    }

    /// Removes a recorded pixels dependency. Removing an absent dependency
    /// is a no-op.
    pub fn remove_pixels_dep(&self, file_oid: Oid, pixels_oid: Oid) -> Result<(), StoreError> {
        self.modify_info(file_oid, |info| {
            info.deps.retain(|dep| *dep != pixels_oid);
        })
        .map(|_| ())
    }
}

/// An open file object.
#[derive(Debug)]
pub struct FileObject {
    oid: Oid,
    info: FileInfo,
    info_map: MappedFile,
    rep: Option<MappedFile>,
}

impl FileObject {
    /// The object's identifier.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The decoded metadata record.
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// The declared content size in bytes.
    pub fn size(&self) -> u64 {
        self.info.size
    }

    /// Whether the object has been sealed.
    pub fn is_finished(&self) -> bool {
        self.info.finished
    }

    /// The content digest, once the object is sealed.
    pub fn digest(&self) -> Option<Sha1Hash> {
        self.info.finished.then_some(self.info.digest)
    }

    /// The mapped content bytes.
    pub fn content(&self) -> Result<&[u8], StoreError> {
        Ok(self.rep()?.as_slice())
    }

    /// Fills the content region with exactly the declared size from
    /// `reader`, in one streamed copy under an exclusive lock. A source
    /// that runs dry early is a short transfer.
    pub fn write_from(&mut self, reader: &mut dyn Read) -> Result<u64, StoreError> {
        let oid = self.oid;
        if self.info.finished {
            return Err(StoreError::WriteFinished(oid));
        }
        let size = self.info.size;
        let rep = self.rep.as_mut().ok_or(StoreError::NotOpenForData(oid))?;

        rep.lock_range(LockMode::Exclusive, 0, 0, "file content write")?;
        let result = Self::fill_from(rep, reader);
        rep.unlock_range(0, 0)?;

        let written = result?;
        if written < size {
            return Err(StoreError::ShortTransfer {
                expected: size,
                actual: written,
            });
        }
        Ok(written)
    }

    fn fill_from(rep: &mut MappedFile, reader: &mut dyn Read) -> Result<u64, StoreError> {
        let dst = rep.as_mut_slice()?;
        let mut filled = 0usize;
        while filled < dst.len() {
            let n = reader.read(&mut dst[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        rep.flush()?;
        Ok(filled as u64)
    }

    fn rep(&self) -> Result<&MappedFile, StoreError> {
        self.rep.as_ref().ok_or(StoreError::NotOpenForData(self.oid))
    }

    fn into_paths(self) -> (PathBuf, Option<PathBuf>) {
        (
            self.info_map.into_path(),
            self.rep.map(MappedFile::into_path),
        )
    }
}

fn restore_backup(backup: &Path, content_path: &Path) {
    if let Err(e) = fs_err::rename(backup, content_path) {
        tracing::warn!(
            "failed to restore '{}' from its backup after a failed alias conversion: {e}",
            content_path.display()
        );
    }
}

#[cfg(unix)]
fn symlink_content(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink_content(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "file aliasing requires symbolic links, which are only supported on unix",
    ))
}

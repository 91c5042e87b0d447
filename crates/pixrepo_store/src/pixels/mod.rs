//! The pixel storage engine.
//!
//! A pixels object is a 5-dimensional (X, Y, Z, channel, time) array of
//! fixed-width pixels backed by two files: an info file holding the header
//! and the cached statistics arrays, and a rep file holding the raw blob.
//! Objects are created writable at their exact final size, filled through
//! scoped range-locked reads and writes, and sealed by [`PixelsStore::finish`],
//! which computes the content digest, deduplicates against the digest index,
//! and demotes the files to read-only.
//!
//! Pixel bytes are stored in host order; every I/O entry point takes the
//! caller's declared endianness at open time and swaps per-pixel words when
//! it differs from the host and the pixel width is more than one byte.

mod header;
mod migrate;
mod stats;

pub use header::{PixelsHeader, PixelsShape, HIST_BINS};
pub use stats::{PlaneStats, StackStats};

use std::path::{Path, PathBuf};

use pixrepo_digest::{compute_bytes_digest, Sha1, Sha1Hash};
use pixrepo_lock::LockMode;

use crate::error::{FormatError, StoreError};
use crate::fsutil::{remove_quiet, set_readonly};
use crate::index::{PutOutcome, Sha1Index};
use crate::mapped::MappedFile;
use crate::oid::{allocate_exact_file, next_id, shard_path, Oid};
use crate::OpenMode;

use header::{PLANE_REC_SIZE, STACK_REC_SIZE};
use stats::PixelKind;

/// How sealing a pixels object concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The object was sealed under its own identifier.
    Sealed(Oid),
    /// An object with identical content already existed; the new object was
    /// discarded and the existing identifier returned.
    Merged(Oid),
}

impl FinishOutcome {
    /// The identifier the caller should use from now on.
    pub fn oid(self) -> Oid {
        match self {
            Self::Sealed(oid) | Self::Merged(oid) => oid,
        }
    }
}

/// An inclusive 5-D box of coordinates for region I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Lowest X coordinate.
    pub x0: u32,
    /// Highest X coordinate (inclusive).
    pub x1: u32,
    /// Lowest Y coordinate.
    pub y0: u32,
    /// Highest Y coordinate (inclusive).
    pub y1: u32,
    /// Lowest Z coordinate.
    pub z0: u32,
    /// Highest Z coordinate (inclusive).
    pub z1: u32,
    /// Lowest channel.
    pub c0: u32,
    /// Highest channel (inclusive).
    pub c1: u32,
    /// Lowest timepoint.
    pub t0: u32,
    /// Highest timepoint (inclusive).
    pub t1: u32,
}

impl Region {
    /// Number of pixels inside the box.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.x1 - self.x0 + 1)
            * u64::from(self.y1 - self.y0 + 1)
            * u64::from(self.z1 - self.z0 + 1)
            * u64::from(self.c1 - self.c0 + 1)
            * u64::from(self.t1 - self.t0 + 1)
    }

    fn validate(&self, shape: &PixelsShape) -> Result<(), StoreError> {
        let ordered = self.x0 <= self.x1
            && self.y0 <= self.y1
            && self.z0 <= self.z1
            && self.c0 <= self.c1
            && self.t0 <= self.t1;
        if !ordered || !shape.check_coords(self.x1, self.y1, self.z1, self.c1, self.t1) {
            return Err(StoreError::OutOfBounds {
                x: self.x1,
                y: self.y1,
                z: self.z1,
                c: self.c1,
                t: self.t1,
            });
        }
        Ok(())
    }
}

/// Reverses the bytes of every `word`-sized pixel in `buf`.
///
/// The swap is its own inverse, so the same routine serves both directions.
pub(crate) fn swap_words(buf: &mut [u8], word: usize) {
    for chunk in buf.chunks_exact_mut(word) {
        chunk.reverse();
    }
}

/// The pixels side of a repository: a base directory with an id counter and
/// sharded object files.
#[derive(Debug, Clone)]
pub struct PixelsStore {
    base: PathBuf,
    counter: PathBuf,
}

impl PixelsStore {
    pub(crate) fn new(base: PathBuf) -> Self {
        let counter = base.join("last_id");
        Self { base, counter }
    }

    /// The directory holding pixels objects.
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

    /// Creates a new, writable pixels object of the given shape.
    ///
    /// Both backing files are created at their exact final size; on any
    /// failure neither survives.
    pub fn new_pixels(&self, shape: PixelsShape) -> Result<Pixels, StoreError> {
        shape.validate()?;
        let oid = next_id(&self.counter)?;

        let (info_file, info_path) =
            allocate_exact_file(&self.base, oid, shape.info_size(), Some("info"))?;
        let (rep_file, rep_path) = match allocate_exact_file(&self.base, oid, shape.blob_size(), None)
        {
            Ok(allocated) => allocated,
            Err(e) => {
                drop(info_file);
                remove_quiet(&info_path);
                return Err(e.into());
            }
        };

        match Self::init_new(info_file, info_path.clone(), rep_file, rep_path.clone(), oid, shape) {
            Ok(pixels) => Ok(pixels),
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
        oid: Oid,
        shape: PixelsShape,
    ) -> Result<Pixels, StoreError> {
        let mut info = MappedFile::from_file(info_file, info_path, true)?;
        let rep = MappedFile::from_file(rep_file, rep_path, true)?;

        let header = PixelsHeader::new(shape);
        header.encode(info.as_mut_slice()?);
        info.flush()?;

        // Release the creation locks taken by `allocate_exact_file`; from
        // here on access is serialized per byte range.
        info.unlock_range(0, 0)?;
        rep.unlock_range(0, 0)?;

        Ok(Pixels {
            oid,
            header,
            info,
            rep: Some(rep),
            swap: false,
            whole_lock: false,
        })
    }

    /// Opens an existing pixels object.
    ///
    /// `caller_big_endian` declares the byte order of the buffers the caller
    /// will exchange with this handle; pixel words are swapped on the way in
    /// and out when it differs from the host order. A version-2 info file is
    /// migrated in place before the object is mapped.
    pub fn open(
        &self,
        oid: Oid,
        mode: OpenMode,
        caller_big_endian: bool,
    ) -> Result<Pixels, StoreError> {
        let info_path = self.info_path(oid);
        if !info_path.exists() {
            return Err(StoreError::NotFound(oid));
        }

        let peeked = migrate::open_checked(&info_path)?;
        match mode {
            OpenMode::Read if !peeked.finished => return Err(StoreError::ReadUnfinished(oid)),
            OpenMode::Write if peeked.finished => return Err(StoreError::WriteFinished(oid)),
            _ => {}
        }

        let info = match mode {
            OpenMode::Write => MappedFile::open_rw(&info_path)?,
            _ => MappedFile::open_ro(&info_path)?,
        };
        let header = PixelsHeader::decode(info.as_slice())?;
        if info.len() != header.shape.info_size() {
            return Err(FormatError::SizeMismatch {
                path: info_path,
                expected: header.shape.info_size(),
                actual: info.len(),
            }
            .into());
        }

        let rep = match mode {
            OpenMode::Info => None,
            OpenMode::Read => Some(MappedFile::open_ro(self.rep_path(oid))?),
            OpenMode::Write => Some(MappedFile::open_rw(self.rep_path(oid))?),
        };
        if let Some(rep) = &rep {
            if rep.len() != header.shape.blob_size() {
                return Err(FormatError::SizeMismatch {
                    path: rep.path().to_path_buf(),
                    expected: header.shape.blob_size(),
                    actual: rep.len(),
                }
                .into());
            }
        }

        let host_big_endian = cfg!(target_endian = "big");
        let swap = caller_big_endian != host_big_endian && header.shape.bp > 1;

        Ok(Pixels {
            oid,
            header,
            info,
            rep,
            swap,
            whole_lock: false,
        })
    }

    /// Seals a writable pixels object.
    ///
    /// Under a whole-object write lock this completes the statistics arrays,
    /// digests the blob, and consults the index: a hit discards the new
    /// object's files and yields [`FinishOutcome::Merged`] with the existing
    /// identifier; otherwise the digest is recorded, the header marked
    /// finished, both files flushed and demoted to read-only, and
    /// [`FinishOutcome::Sealed`] returned.
    pub fn finish(
        &self,
        mut pixels: Pixels,
        force: bool,
        index: &dyn Sha1Index,
    ) -> Result<FinishOutcome, StoreError> {
        let oid = pixels.oid;
        if pixels.header.finished {
            return Err(StoreError::WriteFinished(oid));
        }

        pixels.rep()?.lock_range(LockMode::Exclusive, 0, 0, "pixels blob during seal")?;
        pixels
            .info
            .lock_range(LockMode::Exclusive, 0, 0, "pixels info during seal")?;
        pixels.whole_lock = true;

        let outcome = self.finish_locked(&mut pixels, force, index);

        pixels.whole_lock = false;
        let _ = pixels.info.unlock_range(0, 0);
        if let Ok(rep) = pixels.rep() {
            let _ = rep.unlock_range(0, 0);
        }

        match outcome? {
            FinishOutcome::Merged(existing) => {
                tracing::debug!(
                    "pixels {oid} duplicates {existing}, discarding the new object"
                );
                let (info_path, rep_path) = pixels.into_paths();
                fs_err::remove_file(&info_path)?;
                if let Some(rep_path) = rep_path {
                    fs_err::remove_file(&rep_path)?;
                }
                Ok(FinishOutcome::Merged(existing))
            }
            FinishOutcome::Sealed(oid) => {
                let (info_path, rep_path) = pixels.into_paths();
                set_readonly(&info_path)?;
                if let Some(rep_path) = rep_path {
                    set_readonly(&rep_path)?;
                }
                Ok(FinishOutcome::Sealed(oid))
            }
        }
    }

    fn finish_locked(
        &self,
        pixels: &mut Pixels,
        force: bool,
        index: &dyn Sha1Index,
    ) -> Result<FinishOutcome, StoreError> {
        pixels.finish_stats(force)?;

        let digest = compute_bytes_digest::<Sha1>(pixels.rep()?.as_slice());
        let existing = match index.get(&digest)? {
            Some(existing) => Some(existing),
            None => match index.put(&digest, pixels.oid)? {
                // Another process recorded the same content between our
                // lookup and the insert.
                PutOutcome::Exists(existing) => Some(existing),
                PutOutcome::Inserted => None,
            },
        };
        if let Some(existing) = existing {
            if self.exists(existing) {
                return Ok(FinishOutcome::Merged(existing));
            }
            // A stale entry left by a deliberate purge; reclaim it.
            tracing::warn!(
                "digest index names missing pixels {existing}; reclaiming the entry for {}",
                pixels.oid
            );
            index.update(&digest, pixels.oid)?;
        }

        pixels.header.finished = true;
        pixels.header.digest = digest;
        let header = pixels.header.clone();
        header.encode(pixels.info.as_mut_slice()?);
        pixels.info.flush()?;
        pixels.rep()?.flush()?;
        Ok(FinishOutcome::Sealed(pixels.oid))
    }

    /// Removes both backing files of an object. This is the deliberate-purge
    /// path; the digest index is not touched.
    pub fn delete(&self, oid: Oid) -> Result<(), StoreError> {
        let info_path = self.info_path(oid);
        if !info_path.exists() {
            return Err(StoreError::NotFound(oid));
        }
        fs_err::remove_file(&info_path)?;
        fs_err::remove_file(self.rep_path(oid))?;
        Ok(())
    }
}

/// An open pixels object.
///
/// The handle owns memory maps of the backing files. Handles opened in
/// [`OpenMode::Info`] carry no blob mapping and refuse data access.
#[derive(Debug)]
pub struct Pixels {
    oid: Oid,
    header: PixelsHeader,
    info: MappedFile,
    rep: Option<MappedFile>,
    swap: bool,
    /// Set while a whole-object lock is held, so scoped I/O skips its own
    /// range locks instead of punching holes in the outer lock.
    whole_lock: bool,
}

impl Pixels {
    /// The object's identifier.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The object's extents and pixel format.
    pub fn shape(&self) -> &PixelsShape {
        &self.header.shape
    }

    /// Whether the object has been sealed.
    pub fn is_finished(&self) -> bool {
        self.header.finished
    }

    /// The content digest, once the object is sealed.
    pub fn digest(&self) -> Option<Sha1Hash> {
        self.header.finished.then_some(self.header.digest)
    }

    /// Whether this handle swaps pixel bytes between caller and host order.
    pub fn swaps_bytes(&self) -> bool {
        self.swap
    }

    /// Whether every coordinate lies strictly inside the declared extents.
    pub fn check_coords(&self, x: u32, y: u32, z: u32, c: u32, t: u32) -> bool {
        self.header.shape.check_coords(x, y, z, c, t)
    }

    /// Byte offset of a pixel in the raw blob.
    pub fn offset(&self, x: u32, y: u32, z: u32, c: u32, t: u32) -> u64 {
        self.header.shape.pixel_offset(x, y, z, c, t)
    }

    fn rep(&self) -> Result<&MappedFile, StoreError> {
        self.rep.as_ref().ok_or(StoreError::NotOpenForData(self.oid))
    }

    fn rep_mut(&mut self) -> Result<&mut MappedFile, StoreError> {
        let oid = self.oid;
        self.rep.as_mut().ok_or(StoreError::NotOpenForData(oid))
    }

    fn into_paths(self) -> (PathBuf, Option<PathBuf>) {
        (self.info.into_path(), self.rep.map(MappedFile::into_path))
    }

    /// Copies up to `count` pixels starting at linear pixel index `index`
    /// into `out`, returning how many pixels were transferred.
    ///
    /// The transfer is clipped to the end of the blob and to the caller's
    /// buffer; callers moving whole regions treat a short count as failure.
    /// The byte range is read under a shared range lock.
    pub fn read_pixels(&self, index: u64, count: u64, out: &mut [u8]) -> Result<u64, StoreError> {
        let bp = u64::from(self.header.shape.bp);
        let rep = self.rep()?;

        let available = self.header.shape.total_pixels().saturating_sub(index);
        let n = count.min(available).min(out.len() as u64 / bp);
        if n == 0 {
            return Ok(0);
        }
        let byte_off = index * bp;
        let byte_len = n * bp;

        if !self.whole_lock {
            rep.lock_range(LockMode::Shared, byte_off, byte_len, "pixel read")?;
        }
        let result = rep.range(byte_off, byte_len).map(|src| {
            out[..byte_len as usize].copy_from_slice(src);
        });
        if !self.whole_lock {
            rep.unlock_range(byte_off, byte_len)?;
        }
        result?;

        if self.swap {
            swap_words(&mut out[..byte_len as usize], self.header.shape.bp as usize);
        }
        Ok(n)
    }

    /// Copies up to `count` pixels from `src` into the blob starting at
    /// linear pixel index `index`, returning how many pixels were
    /// transferred. The byte range is written under an exclusive range lock.
    pub fn write_pixels(&mut self, index: u64, count: u64, src: &[u8]) -> Result<u64, StoreError> {
        let shape = self.header.shape;
        let bp = u64::from(shape.bp);
        let swap = self.swap;
        let whole_lock = self.whole_lock;

        let available = shape.total_pixels().saturating_sub(index);
        let n = count.min(available).min(src.len() as u64 / bp);
        if n == 0 {
            return Ok(0);
        }
        let byte_off = index * bp;
        let byte_len = n * bp;

        let rep = self.rep_mut()?;
        if !whole_lock {
            rep.lock_range(LockMode::Exclusive, byte_off, byte_len, "pixel write")?;
        }
        let result = rep.range_mut(byte_off, byte_len).map(|dst| {
            dst.copy_from_slice(&src[..byte_len as usize]);
            if swap {
                swap_words(dst, shape.bp as usize);
            }
        });
        if !whole_lock {
            rep.unlock_range(byte_off, byte_len)?;
        }
        result?;
        Ok(n)
    }

    /// Reads one (z, c, t) plane into `out`. Anything short of the full
    /// plane is an error.
    pub fn read_plane(&self, z: u32, c: u32, t: u32, out: &mut [u8]) -> Result<u64, StoreError> {
        self.plane_coords(z, c, t)?;
        let shape = &self.header.shape;
        let expected = shape.plane_pixels();
        let n = self.read_pixels(shape.pixel_index(0, 0, z, c, t), expected, out)?;
        if n != expected {
            return Err(StoreError::ShortTransfer {
                expected,
                actual: n,
            });
        }
        Ok(n)
    }

    /// Writes one (z, c, t) plane from `src`. Anything short of the full
    /// plane is an error.
    pub fn write_plane(&mut self, z: u32, c: u32, t: u32, src: &[u8]) -> Result<u64, StoreError> {
        self.plane_coords(z, c, t)?;
        let shape = self.header.shape;
        let expected = shape.plane_pixels();
        let n = self.write_pixels(shape.pixel_index(0, 0, z, c, t), expected, src)?;
        if n != expected {
            return Err(StoreError::ShortTransfer {
                expected,
                actual: n,
            });
        }
        Ok(n)
    }

    /// Reads one (c, t) stack — every Z plane of a channel/timepoint — into
    /// `out`.
    pub fn read_stack(&self, c: u32, t: u32, out: &mut [u8]) -> Result<u64, StoreError> {
        self.stack_coords(c, t)?;
        let shape = &self.header.shape;
        let expected = shape.stack_pixels();
        let n = self.read_pixels(shape.pixel_index(0, 0, 0, c, t), expected, out)?;
        if n != expected {
            return Err(StoreError::ShortTransfer {
                expected,
                actual: n,
            });
        }
        Ok(n)
    }

    /// Writes one (c, t) stack from `src`.
    pub fn write_stack(&mut self, c: u32, t: u32, src: &[u8]) -> Result<u64, StoreError> {
        self.stack_coords(c, t)?;
        let shape = self.header.shape;
        let expected = shape.stack_pixels();
        let n = self.write_pixels(shape.pixel_index(0, 0, 0, c, t), expected, src)?;
        if n != expected {
            return Err(StoreError::ShortTransfer {
                expected,
                actual: n,
            });
        }
        Ok(n)
    }

    /// Reads a rectangular region into `out`, one X row at a time.
    pub fn read_region(&self, region: &Region, out: &mut [u8]) -> Result<u64, StoreError> {
        region.validate(&self.header.shape)?;
        let shape = self.header.shape;
        let bp = shape.bp as usize;
        let row = u64::from(region.x1 - region.x0 + 1);
        let expected = region.pixel_count();

        let mut transferred = 0u64;
        for t in region.t0..=region.t1 {
            for c in region.c0..=region.c1 {
                for z in region.z0..=region.z1 {
                    for y in region.y0..=region.y1 {
                        let index = shape.pixel_index(region.x0, y, z, c, t);
                        let cursor = (transferred as usize) * bp;
                        let n = self.read_pixels(index, row, &mut out[cursor..])?;
                        transferred += n;
                        if n != row {
                            return Err(StoreError::ShortTransfer {
                                expected,
                                actual: transferred,
                            });
                        }
                    }
                }
            }
        }
        Ok(transferred)
    }

    /// Writes a rectangular region from `src`, one X row at a time.
    pub fn write_region(&mut self, region: &Region, src: &[u8]) -> Result<u64, StoreError> {
        region.validate(&self.header.shape)?;
        let shape = self.header.shape;
        let bp = shape.bp as usize;
        let row = u64::from(region.x1 - region.x0 + 1);
        let expected = region.pixel_count();

        let mut transferred = 0u64;
        for t in region.t0..=region.t1 {
            for c in region.c0..=region.c1 {
                for z in region.z0..=region.z1 {
                    for y in region.y0..=region.y1 {
                        let index = shape.pixel_index(region.x0, y, z, c, t);
                        let cursor = (transferred as usize) * bp;
                        let n = self.write_pixels(index, row, &src[cursor..])?;
                        transferred += n;
                        if n != row {
                            return Err(StoreError::ShortTransfer {
                                expected,
                                actual: transferred,
                            });
                        }
                    }
                }
            }
        }
        Ok(transferred)
    }

    fn plane_coords(&self, z: u32, c: u32, t: u32) -> Result<(), StoreError> {
        if !self.check_coords(0, 0, z, c, t) {
            return Err(StoreError::OutOfBounds { x: 0, y: 0, z, c, t });
        }
        Ok(())
    }

    fn stack_coords(&self, c: u32, t: u32) -> Result<(), StoreError> {
        self.plane_coords(0, c, t)
    }

    /// Returns the cached statistics record of one plane.
    pub fn plane_stats(&self, z: u32, c: u32, t: u32) -> Result<PlaneStats, StoreError> {
        self.plane_coords(z, c, t)?;
        let off = self.header.shape.plane_rec_offset(z, c, t);
        if !self.whole_lock {
            self.info
                .lock_range(LockMode::Shared, off, PLANE_REC_SIZE, "plane statistics")?;
        }
        let result = self.info.range(off, PLANE_REC_SIZE).map(PlaneStats::decode);
        if !self.whole_lock {
            self.info.unlock_range(off, PLANE_REC_SIZE)?;
        }
        result
    }

    /// Returns the cached statistics record of one stack.
    pub fn stack_stats(&self, c: u32, t: u32) -> Result<StackStats, StoreError> {
        self.stack_coords(c, t)?;
        let off = self.header.shape.stack_rec_offset(c, t);
        if !self.whole_lock {
            self.info
                .lock_range(LockMode::Shared, off, STACK_REC_SIZE, "stack statistics")?;
        }
        let result = self.info.range(off, STACK_REC_SIZE).map(StackStats::decode);
        if !self.whole_lock {
            self.info.unlock_range(off, STACK_REC_SIZE)?;
        }
        result
    }

    /// Recomputes the statistics of one plane unconditionally and caches
    /// the record.
    pub fn compute_plane_stats(&mut self, z: u32, c: u32, t: u32) -> Result<PlaneStats, StoreError> {
        self.plane_coords(z, c, t)?;
        let shape = self.header.shape;
        let kind = PixelKind::of(&shape)?;

        let rec = {
            let rep = self.rep()?;
            let byte_off = shape.pixel_offset(0, 0, z, c, t);
            let byte_len = shape.plane_pixels() * u64::from(shape.bp);
            if !self.whole_lock {
                rep.lock_range(LockMode::Shared, byte_off, byte_len, "plane statistics scan")?;
            }
            let result = rep
                .range(byte_off, byte_len)
                .map(|plane| accumulate_plane(plane, &shape, kind));
            if !self.whole_lock {
                rep.unlock_range(byte_off, byte_len)?;
            }
            result?
        };

        self.store_plane_rec(z, c, t, &rec)?;
        Ok(rec)
    }

    /// Returns the statistics of one stack, computing them (and any missing
    /// plane records underneath) on demand. A record already marked computed
    /// is returned as-is.
    pub fn compute_stack_stats(&mut self, c: u32, t: u32) -> Result<StackStats, StoreError> {
        self.compute_stack_stats_inner(c, t, false)
    }

    fn compute_stack_stats_inner(
        &mut self,
        c: u32,
        t: u32,
        force: bool,
    ) -> Result<StackStats, StoreError> {
        self.stack_coords(c, t)?;
        let existing = self.stack_stats(c, t)?;
        if existing.computed && !force {
            return Ok(existing);
        }

        let shape = self.header.shape;
        let kind = PixelKind::of(&shape)?;

        // Every plane record must be valid before aggregation.
        let mut planes = Vec::with_capacity(shape.dz as usize);
        for z in 0..shape.dz {
            let ps = self.plane_stats(z, c, t)?;
            let ps = if ps.computed {
                ps
            } else {
                self.compute_plane_stats(z, c, t)?
            };
            planes.push(ps);
        }

        let mut rec = StackStats::default();
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (z, ps) in planes.iter().enumerate() {
            rec.sum += ps.sum;
            rec.sum_sq += ps.sum_sq;
            rec.sum_log += ps.sum_log;
            rec.sum_xi += ps.sum_xi;
            rec.sum_yi += ps.sum_yi;
            rec.sum_zi += z as f64 * ps.sum;
            min = min.min(ps.min);
            max = max.max(ps.max);
        }
        rec.min = min;
        rec.max = max;

        let n = shape.stack_pixels() as f64;
        derive_moments(
            &mut rec.mean,
            &mut rec.geo_mean,
            &mut rec.sigma,
            &mut rec.geo_sigma,
            rec.sum,
            rec.sum_sq,
            rec.sum_log,
            n,
        );
        rec.centroid_x = weighted(rec.sum_xi, rec.sum);
        rec.centroid_y = weighted(rec.sum_yi, rec.sum);
        rec.centroid_z = weighted(rec.sum_zi, rec.sum);

        // The histogram spans the stack-wide range, so it needs its own pass
        // over the pixels; per-plane histograms cover different ranges and
        // cannot be merged.
        {
            let rep = self.rep()?;
            let byte_off = shape.pixel_offset(0, 0, 0, c, t);
            let byte_len = shape.stack_pixels() * u64::from(shape.bp);
            if !self.whole_lock {
                rep.lock_range(LockMode::Shared, byte_off, byte_len, "stack histogram scan")?;
            }
            let result = rep.range(byte_off, byte_len).map(|stack| {
                fill_histogram(&mut rec.histogram, stack, shape.bp as usize, kind, min, max);
            });
            if !self.whole_lock {
                rep.unlock_range(byte_off, byte_len)?;
            }
            result?;
        }

        rec.computed = true;
        self.store_stack_rec(c, t, &rec)?;
        Ok(rec)
    }

    /// Completes the statistics arrays: walks every (t, c), then every z,
    /// computing missing records — or recomputing everything when `force`
    /// is set.
    pub fn finish_stats(&mut self, force: bool) -> Result<(), StoreError> {
        let shape = self.header.shape;
        for t in 0..shape.dt {
            for c in 0..shape.dc {
                for z in 0..shape.dz {
                    if force || !self.plane_stats(z, c, t)?.computed {
                        self.compute_plane_stats(z, c, t)?;
                    }
                }
                self.compute_stack_stats_inner(c, t, force)?;
            }
        }
        Ok(())
    }

    fn store_plane_rec(&mut self, z: u32, c: u32, t: u32, rec: &PlaneStats) -> Result<(), StoreError> {
        let off = self.header.shape.plane_rec_offset(z, c, t);
        let whole_lock = self.whole_lock;
        if !whole_lock {
            self.info
                .lock_range(LockMode::Exclusive, off, PLANE_REC_SIZE, "plane statistics")?;
        }
        let result = self.info.range_mut(off, PLANE_REC_SIZE).map(|buf| rec.encode(buf));
        if !whole_lock {
            self.info.unlock_range(off, PLANE_REC_SIZE)?;
        }
        result
    }

    fn store_stack_rec(&mut self, c: u32, t: u32, rec: &StackStats) -> Result<(), StoreError> {
        let off = self.header.shape.stack_rec_offset(c, t);
        let whole_lock = self.whole_lock;
        if !whole_lock {
            self.info
                .lock_range(LockMode::Exclusive, off, STACK_REC_SIZE, "stack statistics")?;
        }
        let result = self.info.range_mut(off, STACK_REC_SIZE).map(|buf| rec.encode(buf));
        if !whole_lock {
            self.info.unlock_range(off, STACK_REC_SIZE)?;
        }
        result
    }
}

/// One streaming pass over a plane's raw bytes, plus the histogram pass.
fn accumulate_plane(plane: &[u8], shape: &PixelsShape, kind: PixelKind) -> PlaneStats {
    let bp = shape.bp as usize;
    let mut rec = PlaneStats::default();
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for y in 0..shape.dy {
        for x in 0..shape.dx {
            let idx = (y as usize * shape.dx as usize + x as usize) * bp;
            let v = kind.value(&plane[idx..idx + bp]);
            rec.sum += v;
            rec.sum_sq += v * v;
            if v > -1.0 {
                rec.sum_log += (v + 1.0).ln();
            }
            rec.sum_xi += v * f64::from(x);
            rec.sum_yi += v * f64::from(y);
            min = min.min(v);
            max = max.max(v);
        }
    }
    rec.min = min;
    rec.max = max;

    let n = shape.plane_pixels() as f64;
    derive_moments(
        &mut rec.mean,
        &mut rec.geo_mean,
        &mut rec.sigma,
        &mut rec.geo_sigma,
        rec.sum,
        rec.sum_sq,
        rec.sum_log,
        n,
    );
    rec.centroid_x = weighted(rec.sum_xi, rec.sum);
    rec.centroid_y = weighted(rec.sum_yi, rec.sum);

    fill_histogram(&mut rec.histogram, plane, bp, kind, min, max);
    rec.computed = true;
    rec
}

#[allow(clippy::too_many_arguments)]
fn derive_moments(
    mean: &mut f64,
    geo_mean: &mut f64,
    sigma: &mut f64,
    geo_sigma: &mut f64,
    sum: f64,
    sum_sq: f64,
    sum_log: f64,
    n: f64,
) {
    *mean = sum / n;
    *geo_mean = (sum_log / n).exp() - 1.0;
    *sigma = if n > 1.0 {
        ((sum_sq - sum * *mean) / (n - 1.0)).max(0.0).sqrt()
    } else {
        0.0
    };
    *geo_sigma = if *geo_mean != 0.0 { *sigma / *geo_mean } else { 0.0 };
}

fn weighted(weighted_sum: f64, sum: f64) -> f64 {
    if sum != 0.0 {
        weighted_sum / sum
    } else {
        0.0
    }
}

/// Bins every pixel of `raw` into `histogram` over `[min, max]`. A flat
/// plane (max == min) lands entirely in bin zero.
fn fill_histogram(
    histogram: &mut [u32; HIST_BINS],
    raw: &[u8],
    bp: usize,
    kind: PixelKind,
    min: f64,
    max: f64,
) {
    if max > min {
        let scale = (HIST_BINS - 1) as f64 / (max - min);
        for px in raw.chunks_exact(bp) {
            let v = kind.value(px);
            let bin = (((v - min) * scale) as usize).min(HIST_BINS - 1);
            histogram[bin] += 1;
        }
    } else {
        histogram[0] = (raw.len() / bp) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_words_is_an_involution() {
        let mut buf = [1u8, 2, 3, 4, 5, 6, 7, 8];
        swap_words(&mut buf, 2);
        assert_eq!(buf, [2, 1, 4, 3, 6, 5, 8, 7]);
        swap_words(&mut buf, 2);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        swap_words(&mut buf, 4);
        assert_eq!(buf, [4, 3, 2, 1, 8, 7, 6, 5]);
        swap_words(&mut buf, 4);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn region_pixel_count_and_validation() {
        let shape = PixelsShape {
            dx: 8,
            dy: 8,
            dz: 4,
            dc: 2,
            dt: 2,
            bp: 2,
            signed: false,
            float: false,
        };
        let region = Region {
            x0: 1,
            x1: 4,
            y0: 0,
            y1: 7,
            z0: 2,
            z1: 3,
            c0: 0,
            c1: 0,
            t0: 1,
            t1: 1,
        };
        assert_eq!(region.pixel_count(), 4 * 8 * 2);
        region.validate(&shape).unwrap();

        let inverted = Region { x0: 5, x1: 4, ..region };
        assert!(matches!(
            inverted.validate(&shape),
            Err(StoreError::OutOfBounds { .. })
        ));

        let outside = Region { z1: 4, ..region };
        assert!(matches!(
            outside.validate(&shape),
            Err(StoreError::OutOfBounds { .. })
        ));
    }
}

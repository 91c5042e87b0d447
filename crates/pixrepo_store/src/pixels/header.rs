//! The fixed-size pixel object header and the geometry derived from it.
//!
//! Header layout (64 bytes, all integers little endian):
//!
//! ```text
//! 0   u32  magic signature
//! 4   u8   format version
//! 5   u8   finished flag
//! 6   u8   signed flag
//! 7   u8   float flag
//! 8   u32  dx    12  u32 dy    16  u32 dz    20  u32 dc    24  u32 dt
//! 28  u32  bytes per pixel
//! 32  [u8; 20]  content digest (zero until finished)
//! 52  [u8; 12]  reserved
//! ```

use pixrepo_digest::Sha1Hash;

use crate::codec::{read_u32, write_u32};
use crate::error::FormatError;

/// Magic signature of a pixels info file.
pub const PIXELS_MAGIC: u32 = 0x5049_5845;
/// The current on-disk format version.
pub const PIXELS_VERSION: u8 = 3;
/// The previous on-disk format version, readable through migration.
pub const PIXELS_VERSION_V2: u8 = 2;
/// Size of the encoded header in bytes.
pub const HEADER_SIZE: u64 = 64;
/// Number of bins in an intensity histogram.
pub const HIST_BINS: usize = 128;
/// Encoded size of a plane statistics record.
pub const PLANE_REC_SIZE: u64 = 624;
/// Encoded size of a stack statistics record.
pub const STACK_REC_SIZE: u64 = 640;
/// Encoded size of a version-2 plane statistics record (no histogram).
pub const PLANE_REC_SIZE_V2: u64 = 112;
/// Encoded size of a version-2 stack statistics record (no histogram).
pub const STACK_REC_SIZE_V2: u64 = 128;

/// The five extents and pixel format of a pixels object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelsShape {
    /// Extent along X (fastest-varying on disk).
    pub dx: u32,
    /// Extent along Y.
    pub dy: u32,
    /// Extent along Z.
    pub dz: u32,
    /// Number of channels.
    pub dc: u32,
    /// Number of timepoints (slowest-varying on disk).
    pub dt: u32,
    /// Bytes per pixel: 1, 2, 4, 8 or 16.
    pub bp: u32,
    /// Whether integer pixels are signed.
    pub signed: bool,
    /// Whether pixels are floating point.
    pub float: bool,
}

impl PixelsShape {
    /// Validates the extents and pixel format.
    pub fn validate(&self) -> Result<(), FormatError> {
        let invalid = |reason: &str| FormatError::InvalidShape {
            reason: reason.to_string(),
        };
        if self.dx == 0 || self.dy == 0 || self.dz == 0 || self.dc == 0 || self.dt == 0 {
            return Err(invalid("every extent must be at least 1"));
        }
        if !matches!(self.bp, 1 | 2 | 4 | 8 | 16) {
            return Err(invalid("bytes per pixel must be 1, 2, 4, 8 or 16"));
        }
        if self.float && self.bp < 4 {
            return Err(invalid("float pixels must be at least 4 bytes wide"));
        }
        if self.checked_blob_size().is_none() {
            return Err(invalid("total pixel size overflows"));
        }
        Ok(())
    }

    /// Pixels in one plane.
    pub fn plane_pixels(&self) -> u64 {
        u64::from(self.dx) * u64::from(self.dy)
    }

    /// Pixels in one stack.
    pub fn stack_pixels(&self) -> u64 {
        self.plane_pixels() * u64::from(self.dz)
    }

    /// Pixels in the whole object.
    pub fn total_pixels(&self) -> u64 {
        self.stack_pixels() * u64::from(self.dc) * u64::from(self.dt)
    }

    /// Number of plane statistics records.
    pub fn plane_count(&self) -> u64 {
        u64::from(self.dz) * u64::from(self.dc) * u64::from(self.dt)
    }

    /// Number of stack statistics records.
    pub fn stack_count(&self) -> u64 {
        u64::from(self.dc) * u64::from(self.dt)
    }

    fn checked_blob_size(&self) -> Option<u64> {
        u64::from(self.dx)
            .checked_mul(u64::from(self.dy))?
            .checked_mul(u64::from(self.dz))?
            .checked_mul(u64::from(self.dc))?
            .checked_mul(u64::from(self.dt))?
            .checked_mul(u64::from(self.bp))
    }

    /// Size of the raw pixel blob in bytes.
    pub fn blob_size(&self) -> u64 {
        self.total_pixels() * u64::from(self.bp)
    }

    /// Size of the info file: header plus both statistics arrays.
    pub fn info_size(&self) -> u64 {
        HEADER_SIZE + self.plane_count() * PLANE_REC_SIZE + self.stack_count() * STACK_REC_SIZE
    }

    /// Size of a version-2 info file for the same shape.
    pub fn info_size_v2(&self) -> u64 {
        HEADER_SIZE
            + self.plane_count() * PLANE_REC_SIZE_V2
            + self.stack_count() * STACK_REC_SIZE_V2
    }

    /// Whether every coordinate lies strictly inside its extent.
    pub fn check_coords(&self, x: u32, y: u32, z: u32, c: u32, t: u32) -> bool {
        x < self.dx && y < self.dy && z < self.dz && c < self.dc && t < self.dt
    }

    /// Linear index of a pixel in the raw blob.
    ///
    /// `(((t·dc + c)·dz + z)·dy + y)·dx + x` — X varies fastest, then Y, Z,
    /// C, with T slowest.
    pub fn pixel_index(&self, x: u32, y: u32, z: u32, c: u32, t: u32) -> u64 {
        let row = ((u64::from(t) * u64::from(self.dc) + u64::from(c)) * u64::from(self.dz)
            + u64::from(z))
            * u64::from(self.dy)
            + u64::from(y);
        row * u64::from(self.dx) + u64::from(x)
    }

    /// Byte offset of a pixel in the raw blob.
    ///
    /// `((((t·dc + c)·dz + z)·dy + y)·dx + x) · bp`. This single formula
    /// defines the on-disk pixel ordering.
    pub fn pixel_offset(&self, x: u32, y: u32, z: u32, c: u32, t: u32) -> u64 {
        self.pixel_index(x, y, z, c, t) * u64::from(self.bp)
    }

    /// Byte offset of a plane statistics record in the info file.
    pub fn plane_rec_offset(&self, z: u32, c: u32, t: u32) -> u64 {
        let index =
            (u64::from(t) * u64::from(self.dc) + u64::from(c)) * u64::from(self.dz) + u64::from(z);
        HEADER_SIZE + index * PLANE_REC_SIZE
    }

    /// Byte offset of a stack statistics record in the info file.
    pub fn stack_rec_offset(&self, c: u32, t: u32) -> u64 {
        let index = u64::from(t) * u64::from(self.dc) + u64::from(c);
        HEADER_SIZE + self.plane_count() * PLANE_REC_SIZE + index * STACK_REC_SIZE
    }
}

/// The decoded header of a pixels object.
#[derive(Debug, Clone)]
pub struct PixelsHeader {
    /// Geometry and pixel format.
    pub shape: PixelsShape,
    /// On-disk format version this header was read as.
    pub version: u8,
    /// Whether the object has been sealed.
    pub finished: bool,
    /// Content digest; valid only once `finished` is set.
    pub digest: Sha1Hash,
}

impl PixelsHeader {
    /// A fresh, unfinished header for a new object.
    pub fn new(shape: PixelsShape) -> Self {
        Self {
            shape,
            version: PIXELS_VERSION,
            finished: false,
            digest: Sha1Hash::default(),
        }
    }

    /// Encodes the header into the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..HEADER_SIZE as usize].fill(0);
        write_u32(buf, 0, PIXELS_MAGIC);
        buf[4] = self.version;
        buf[5] = u8::from(self.finished);
        buf[6] = u8::from(self.shape.signed);
        buf[7] = u8::from(self.shape.float);
        write_u32(buf, 8, self.shape.dx);
        write_u32(buf, 12, self.shape.dy);
        write_u32(buf, 16, self.shape.dz);
        write_u32(buf, 20, self.shape.dc);
        write_u32(buf, 24, self.shape.dt);
        write_u32(buf, 28, self.shape.bp);
        buf[32..52].copy_from_slice(&self.digest[..]);
    }

    /// Decodes and validates a header from the start of `buf`.
    ///
    /// Both the current version and version 2 decode successfully; the
    /// caller is responsible for migrating a version-2 object before using
    /// its statistics arrays.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(FormatError::InvalidShape {
                reason: format!("info file is shorter than the {HEADER_SIZE}-byte header"),
            });
        }
        let magic = read_u32(buf, 0);
        if magic != PIXELS_MAGIC {
            return Err(FormatError::BadMagic {
                found: magic,
                expected: PIXELS_MAGIC,
            });
        }
        let version = buf[4];
        if version != PIXELS_VERSION && version != PIXELS_VERSION_V2 {
            return Err(FormatError::UnsupportedVersion(u32::from(version)));
        }

        let shape = PixelsShape {
            dx: read_u32(buf, 8),
            dy: read_u32(buf, 12),
            dz: read_u32(buf, 16),
            dc: read_u32(buf, 20),
            dt: read_u32(buf, 24),
            bp: read_u32(buf, 28),
            signed: buf[6] != 0,
            float: buf[7] != 0,
        };
        shape.validate()?;

        let digest = Sha1Hash::clone_from_slice(&buf[32..52]);

        Ok(Self {
            shape,
            version,
            finished: buf[5] != 0,
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn shape() -> PixelsShape {
        PixelsShape {
            dx: 4,
            dy: 4,
            dz: 2,
            dc: 1,
            dt: 1,
            bp: 2,
            signed: false,
            float: false,
        }
    }

    #[test]
    fn header_round_trip() {
        let mut header = PixelsHeader::new(shape());
        header.finished = true;
        header.digest = pixrepo_digest::compute_bytes_digest::<pixrepo_digest::Sha1>(b"blob");

        let mut buf = vec![0u8; HEADER_SIZE as usize];
        header.encode(&mut buf);
        let decoded = PixelsHeader::decode(&buf).unwrap();
        assert_eq!(decoded.shape, header.shape);
        assert_eq!(decoded.version, PIXELS_VERSION);
        assert!(decoded.finished);
        assert_eq!(decoded.digest, header.digest);
    }

    #[test]
    fn decode_rejects_bad_magic_and_version() {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        PixelsHeader::new(shape()).encode(&mut buf);

        let mut bad_magic = buf.clone();
        bad_magic[0] ^= 0xff;
        assert_matches!(
            PixelsHeader::decode(&bad_magic),
            Err(FormatError::BadMagic { .. })
        );

        let mut bad_version = buf;
        bad_version[4] = 9;
        assert_matches!(
            PixelsHeader::decode(&bad_version),
            Err(FormatError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn offset_is_a_bijection_over_the_blob() {
        let s = shape();
        let mut seen = vec![false; s.blob_size() as usize / s.bp as usize];
        for t in 0..s.dt {
            for c in 0..s.dc {
                for z in 0..s.dz {
                    for y in 0..s.dy {
                        for x in 0..s.dx {
                            let off = s.pixel_offset(x, y, z, c, t);
                            assert_eq!(off % u64::from(s.bp), 0);
                            let idx = (off / u64::from(s.bp)) as usize;
                            assert!(!seen[idx], "offset {off} visited twice");
                            seen[idx] = true;
                        }
                    }
                }
            }
        }
        assert!(seen.iter().all(|v| *v));
    }

    #[test]
    fn offset_ordering_is_x_fastest_t_slowest() {
        let s = PixelsShape {
            dx: 3,
            dy: 5,
            dz: 7,
            dc: 2,
            dt: 4,
            bp: 2,
            signed: false,
            float: false,
        };
        assert_eq!(s.pixel_offset(0, 0, 0, 0, 0), 0);
        assert_eq!(s.pixel_offset(1, 0, 0, 0, 0), 2);
        assert_eq!(s.pixel_offset(0, 1, 0, 0, 0), 3 * 2);
        assert_eq!(s.pixel_offset(0, 0, 1, 0, 0), 15 * 2);
        assert_eq!(s.pixel_offset(0, 0, 0, 1, 0), 105 * 2);
        assert_eq!(s.pixel_offset(0, 0, 0, 0, 1), 210 * 2);
    }

    #[test]
    fn shape_validation() {
        let mut s = shape();
        s.dz = 0;
        assert_matches!(s.validate(), Err(FormatError::InvalidShape { .. }));

        let mut s = shape();
        s.bp = 3;
        assert_matches!(s.validate(), Err(FormatError::InvalidShape { .. }));

        let mut s = shape();
        s.float = true;
        s.bp = 2;
        assert_matches!(s.validate(), Err(FormatError::InvalidShape { .. }));
    }
}

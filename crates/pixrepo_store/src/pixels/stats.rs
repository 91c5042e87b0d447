//! Plane and stack statistics records.
//!
//! Statistics are cached in the info file next to the header, one record per
//! plane (z, c, t) and one per stack (c, t). The `computed` flag is the sole
//! cache-validity signal: a record is never recomputed once set unless the
//! caller forces it.
//!
//! Record layout (little endian): `computed u32`, reserved `u32`, the f64
//! accumulator and derived fields in declaration order, then the
//! [`HIST_BINS`] `u32` histogram bins. Stack records carry the additional
//! z-weighted sum and 3-D centroid component.

use crate::codec::{read_f64, read_u32, write_f64, write_u32};
use crate::error::StoreError;
use crate::pixels::header::{PixelsShape, HIST_BINS, PLANE_REC_SIZE, STACK_REC_SIZE};

/// Statistics of a single (z, c, t) plane.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneStats {
    /// Whether this record has been computed.
    pub computed: bool,
    /// Sum of pixel intensities.
    pub sum: f64,
    /// Sum of squared intensities.
    pub sum_sq: f64,
    /// Sum of `ln(v + 1)` over pixels with `v > -1`.
    pub sum_log: f64,
    /// Sum of `v · x`, for the centroid.
    pub sum_xi: f64,
    /// Sum of `v · y`, for the centroid.
    pub sum_yi: f64,
    /// Smallest intensity.
    pub min: f64,
    /// Largest intensity.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Geometric mean, with the `+1` log offset undone.
    pub geo_mean: f64,
    /// Sample standard deviation (Bessel corrected).
    pub sigma: f64,
    /// Spread relative to the geometric mean.
    pub geo_sigma: f64,
    /// Intensity-weighted centroid, X component.
    pub centroid_x: f64,
    /// Intensity-weighted centroid, Y component.
    pub centroid_y: f64,
    /// Intensity histogram over `[min, max]`.
    pub histogram: [u32; HIST_BINS],
}

impl Default for PlaneStats {
    fn default() -> Self {
        Self {
            computed: false,
            sum: 0.0,
            sum_sq: 0.0,
            sum_log: 0.0,
            sum_xi: 0.0,
            sum_yi: 0.0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            geo_mean: 0.0,
            sigma: 0.0,
            geo_sigma: 0.0,
            centroid_x: 0.0,
            centroid_y: 0.0,
            histogram: [0; HIST_BINS],
        }
    }
}

impl PlaneStats {
    /// Encodes the record into the first [`PLANE_REC_SIZE`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..PLANE_REC_SIZE as usize].fill(0);
        write_u32(buf, 0, u32::from(self.computed));
        let fields = [
            self.sum,
            self.sum_sq,
            self.sum_log,
            self.sum_xi,
            self.sum_yi,
            self.min,
            self.max,
            self.mean,
            self.geo_mean,
            self.sigma,
            self.geo_sigma,
            self.centroid_x,
            self.centroid_y,
        ];
        for (i, v) in fields.iter().enumerate() {
            write_f64(buf, 8 + i * 8, *v);
        }
        for (i, bin) in self.histogram.iter().enumerate() {
            write_u32(buf, 112 + i * 4, *bin);
        }
    }

    /// Decodes a record from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Self {
        let mut histogram = [0u32; HIST_BINS];
        for (i, bin) in histogram.iter_mut().enumerate() {
            *bin = read_u32(buf, 112 + i * 4);
        }
        Self {
            computed: read_u32(buf, 0) != 0,
            sum: read_f64(buf, 8),
            sum_sq: read_f64(buf, 16),
            sum_log: read_f64(buf, 24),
            sum_xi: read_f64(buf, 32),
            sum_yi: read_f64(buf, 40),
            min: read_f64(buf, 48),
            max: read_f64(buf, 56),
            mean: read_f64(buf, 64),
            geo_mean: read_f64(buf, 72),
            sigma: read_f64(buf, 80),
            geo_sigma: read_f64(buf, 88),
            centroid_x: read_f64(buf, 96),
            centroid_y: read_f64(buf, 104),
            histogram,
        }
    }
}

/// Statistics of a full (c, t) stack, aggregated over its planes.
#[derive(Debug, Clone, PartialEq)]
pub struct StackStats {
    /// Whether this record has been computed.
    pub computed: bool,
    /// Sum of pixel intensities.
    pub sum: f64,
    /// Sum of squared intensities.
    pub sum_sq: f64,
    /// Sum of `ln(v + 1)` over pixels with `v > -1`.
    pub sum_log: f64,
    /// Sum of `v · x`.
    pub sum_xi: f64,
    /// Sum of `v · y`.
    pub sum_yi: f64,
    /// Sum of `v · z`.
    pub sum_zi: f64,
    /// Smallest intensity.
    pub min: f64,
    /// Largest intensity.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Geometric mean, with the `+1` log offset undone.
    pub geo_mean: f64,
    /// Sample standard deviation (Bessel corrected).
    pub sigma: f64,
    /// Spread relative to the geometric mean.
    pub geo_sigma: f64,
    /// Intensity-weighted centroid, X component.
    pub centroid_x: f64,
    /// Intensity-weighted centroid, Y component.
    pub centroid_y: f64,
    /// Intensity-weighted centroid, Z component.
    pub centroid_z: f64,
    /// Intensity histogram over the stack-wide `[min, max]`.
    pub histogram: [u32; HIST_BINS],
}

impl Default for StackStats {
    fn default() -> Self {
        Self {
            computed: false,
            sum: 0.0,
            sum_sq: 0.0,
            sum_log: 0.0,
            sum_xi: 0.0,
            sum_yi: 0.0,
            sum_zi: 0.0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            geo_mean: 0.0,
            sigma: 0.0,
            geo_sigma: 0.0,
            centroid_x: 0.0,
            centroid_y: 0.0,
            centroid_z: 0.0,
            histogram: [0; HIST_BINS],
        }
    }
}

impl StackStats {
    /// Encodes the record into the first [`STACK_REC_SIZE`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..STACK_REC_SIZE as usize].fill(0);
        write_u32(buf, 0, u32::from(self.computed));
        let fields = [
            self.sum,
            self.sum_sq,
            self.sum_log,
            self.sum_xi,
            self.sum_yi,
            self.sum_zi,
            self.min,
            self.max,
            self.mean,
            self.geo_mean,
            self.sigma,
            self.geo_sigma,
            self.centroid_x,
            self.centroid_y,
            self.centroid_z,
        ];
        for (i, v) in fields.iter().enumerate() {
            write_f64(buf, 8 + i * 8, *v);
        }
        for (i, bin) in self.histogram.iter().enumerate() {
            write_u32(buf, 128 + i * 4, *bin);
        }
    }

    /// Decodes a record from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Self {
        let mut histogram = [0u32; HIST_BINS];
        for (i, bin) in histogram.iter_mut().enumerate() {
            *bin = read_u32(buf, 128 + i * 4);
        }
        Self {
            computed: read_u32(buf, 0) != 0,
            sum: read_f64(buf, 8),
            sum_sq: read_f64(buf, 16),
            sum_log: read_f64(buf, 24),
            sum_xi: read_f64(buf, 32),
            sum_yi: read_f64(buf, 40),
            sum_zi: read_f64(buf, 48),
            min: read_f64(buf, 56),
            max: read_f64(buf, 64),
            mean: read_f64(buf, 72),
            geo_mean: read_f64(buf, 80),
            sigma: read_f64(buf, 88),
            geo_sigma: read_f64(buf, 96),
            centroid_x: read_f64(buf, 104),
            centroid_y: read_f64(buf, 112),
            centroid_z: read_f64(buf, 120),
            histogram,
        }
    }
}

/// Numeric interpretation of raw pixel bytes, for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PixelKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl PixelKind {
    /// Resolves the numeric kind of a shape's pixels. 16-byte pixels can be
    /// stored and copied but have no numeric interpretation here.
    pub(crate) fn of(shape: &PixelsShape) -> Result<Self, StoreError> {
        let unsupported = StoreError::UnsupportedPixelType {
            bp: shape.bp,
            float: shape.float,
        };
        if shape.float {
            return match shape.bp {
                4 => Ok(Self::F32),
                8 => Ok(Self::F64),
                _ => Err(unsupported),
            };
        }
        match (shape.bp, shape.signed) {
            (1, false) => Ok(Self::U8),
            (1, true) => Ok(Self::I8),
            (2, false) => Ok(Self::U16),
            (2, true) => Ok(Self::I16),
            (4, false) => Ok(Self::U32),
            (4, true) => Ok(Self::I32),
            (8, false) => Ok(Self::U64),
            (8, true) => Ok(Self::I64),
            _ => Err(unsupported),
        }
    }

    /// Reads one pixel value from its native-endian raw bytes.
    pub(crate) fn value(self, raw: &[u8]) -> f64 {
        match self {
            Self::U8 => f64::from(raw[0]),
            Self::I8 => f64::from(raw[0] as i8),
            Self::U16 => f64::from(u16::from_ne_bytes(
                raw[..2].try_into().expect("slice length is 2"),
            )),
            Self::I16 => f64::from(i16::from_ne_bytes(
                raw[..2].try_into().expect("slice length is 2"),
            )),
            Self::U32 => f64::from(u32::from_ne_bytes(
                raw[..4].try_into().expect("slice length is 4"),
            )),
            Self::I32 => f64::from(i32::from_ne_bytes(
                raw[..4].try_into().expect("slice length is 4"),
            )),
            Self::U64 => u64::from_ne_bytes(raw[..8].try_into().expect("slice length is 8")) as f64,
            Self::I64 => i64::from_ne_bytes(raw[..8].try_into().expect("slice length is 8")) as f64,
            Self::F32 => f64::from(f32::from_ne_bytes(
                raw[..4].try_into().expect("slice length is 4"),
            )),
            Self::F64 => f64::from_ne_bytes(raw[..8].try_into().expect("slice length is 8")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_record_round_trip() {
        let mut rec = PlaneStats {
            computed: true,
            sum: 120.0,
            sum_sq: 1240.0,
            sum_log: 33.3,
            sum_xi: 180.0,
            sum_yi: 200.0,
            min: 1.0,
            max: 15.0,
            mean: 7.5,
            geo_mean: 6.1,
            sigma: 4.76,
            geo_sigma: 0.78,
            centroid_x: 1.5,
            centroid_y: 1.66,
            ..Default::default()
        };
        rec.histogram[0] = 3;
        rec.histogram[HIST_BINS - 1] = 1;

        let mut buf = vec![0u8; PLANE_REC_SIZE as usize];
        rec.encode(&mut buf);
        assert_eq!(PlaneStats::decode(&buf), rec);
    }

    #[test]
    fn stack_record_round_trip() {
        let mut rec = StackStats {
            computed: true,
            sum_zi: 64.0,
            centroid_z: 0.53,
            ..Default::default()
        };
        rec.histogram[17] = 9;

        let mut buf = vec![0u8; STACK_REC_SIZE as usize];
        rec.encode(&mut buf);
        assert_eq!(StackStats::decode(&buf), rec);
    }

    #[test]
    fn pixel_kind_values() {
        assert_eq!(PixelKind::U8.value(&[200]), 200.0);
        assert_eq!(PixelKind::I8.value(&[0xff]), -1.0);
        assert_eq!(PixelKind::U16.value(&1000u16.to_ne_bytes()), 1000.0);
        assert_eq!(PixelKind::I16.value(&(-5i16).to_ne_bytes()), -5.0);
        assert_eq!(PixelKind::F32.value(&2.5f32.to_ne_bytes()), 2.5);
        assert_eq!(PixelKind::F64.value(&(-0.25f64).to_ne_bytes()), -0.25);
    }

    #[test]
    fn pixel_kind_rejects_16_byte_pixels() {
        let shape = PixelsShape {
            dx: 1,
            dy: 1,
            dz: 1,
            dc: 1,
            dt: 1,
            bp: 16,
            signed: false,
            float: false,
        };
        assert!(matches!(
            PixelKind::of(&shape),
            Err(StoreError::UnsupportedPixelType { bp: 16, .. })
        ));
    }
}

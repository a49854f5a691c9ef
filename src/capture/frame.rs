use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Pixel layouts a capture source may hand to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// One plane, 4 bytes per pixel in R, G, B, A order
    PackedRgba,
    /// Y plane plus U and V planes at half resolution in both directions
    PlanarYuv420,
}

impl PixelFormat {
    /// Number of planes a well-formed frame of this format carries
    pub fn plane_count(self) -> usize {
        match self {
            Self::PackedRgba => 1,
            Self::PlanarYuv420 => 3,
        }
    }
}

/// One plane of a captured frame, borrowed from the source's buffer
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    /// Bytes between the start of consecutive rows
    pub row_stride: usize,
    /// Bytes between consecutive pixels within a row
    pub pixel_stride: usize,
}

impl<'a> Plane<'a> {
    pub fn new(data: &'a [u8], row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }

    /// Bytes spanned by one row of `cols` samples of `sample_bytes` each.
    ///
    /// `None` if the strides overflow.
    pub(crate) fn row_len(&self, cols: usize, sample_bytes: usize) -> Option<usize> {
        if cols == 0 {
            return Some(0);
        }
        (cols - 1)
            .checked_mul(self.pixel_stride)?
            .checked_add(sample_bytes)
    }

    /// Minimum buffer length needed to read `cols x rows` samples of
    /// `sample_bytes` each with this plane's strides.
    ///
    /// `None` if the strides overflow.
    pub(crate) fn required_len(&self, cols: usize, rows: usize, sample_bytes: usize) -> Option<usize> {
        if cols == 0 || rows == 0 {
            return Some(0);
        }
        (rows - 1)
            .checked_mul(self.row_stride)?
            .checked_add(self.row_len(cols, sample_bytes)?)
    }
}

/// Capture-source output.
///
/// Borrows the source's buffers, so nothing downstream can hold on to it once
/// the source is asked for the next frame.
#[derive(Debug, Clone)]
pub struct RawFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane<'a>>,
}

impl<'a> RawFrame<'a> {
    pub fn new(width: u32, height: u32, format: PixelFormat, planes: Vec<Plane<'a>>) -> Self {
        Self {
            width,
            height,
            format,
            planes,
        }
    }

    /// Tightly packed RGBA frame over `data`
    pub fn packed_rgba(width: u32, height: u32, data: &'a [u8]) -> Self {
        let row_stride = width as usize * 4;
        Self::new(
            width,
            height,
            PixelFormat::PackedRgba,
            vec![Plane::new(data, row_stride, 4)],
        )
    }
}

/// Plane that owns its bytes, used when frames cross a thread boundary
#[derive(Debug, Clone)]
pub struct OwnedPlane {
    pub data: Bytes,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

/// Owned counterpart of [`RawFrame`] for push-based back-ends
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<OwnedPlane>,
}

impl OwnedFrame {
    pub fn as_raw(&self) -> RawFrame<'_> {
        RawFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            planes: self
                .planes
                .iter()
                .map(|p| Plane::new(&p.data, p.row_stride, p.pixel_stride))
                .collect(),
        }
    }
}

/// Compressed still image ready to be served.
///
/// Shared read-only between the cache and every streaming connection.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG bytes
    pub data: Bytes,

    /// Monotonically increasing per encoder
    pub sequence: u64,

    pub width: u32,
    pub height: u32,

    /// When the source frame entered the pipeline, for latency tracking
    pub timestamp: Instant,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

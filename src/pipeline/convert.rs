//! Raw frame to JPEG conversion
//!
//! Conversion is split in two so the capture thread only pays for one
//! stride-respecting pass over each plane ([`PixelConverter::stage`]) and the
//! encode thread does the expensive compression ([`PixelConverter::encode`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{instrument, trace};

use crate::capture::{EncodedFrame, PixelFormat, Plane, RawFrame};
use crate::error::{Error, Result};
use crate::utils::target_dimensions;
use crate::CaptureConfig;

/// Densely packed copy of a frame, independent of the capture buffers
#[derive(Debug, Clone)]
pub struct StagedFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: StagedPixels,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedPixels {
    /// `width * height` RGB triples
    Rgb(Vec<u8>),
    /// Full luma plane followed by interleaved V/U samples at
    /// `ceil(width/2) x ceil(height/2)`
    Nv21(Vec<u8>),
}

/// Turns raw capture output into [`EncodedFrame`]s
pub struct PixelConverter {
    quality: u8,
    target_width: u32,
    sequence: AtomicU64,
}

impl PixelConverter {
    pub fn new(config: &CaptureConfig) -> Self {
        Self::with_settings(config.jpeg_quality, config.target_width)
    }

    pub fn with_settings(jpeg_quality: u8, target_width: u32) -> Self {
        Self {
            // the JPEG encoder rejects quality 0
            quality: jpeg_quality.clamp(1, 100),
            target_width,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Stage and encode in one call
    pub fn convert(&self, frame: &RawFrame<'_>) -> Result<EncodedFrame> {
        let staged = self.stage(frame)?;
        self.encode(staged)
    }

    /// Copy `frame` into a dense buffer, honoring each plane's strides.
    ///
    /// Nothing in the result refers back to `frame`.
    pub fn stage(&self, frame: &RawFrame<'_>) -> Result<StagedFrame> {
        if frame.width == 0 || frame.height == 0 {
            return Err(Error::unsupported(
                frame.format,
                format!("invalid dimensions {}x{}", frame.width, frame.height),
            ));
        }
        let expected = frame.format.plane_count();
        if frame.planes.len() != expected {
            return Err(Error::unsupported(
                frame.format,
                format!("expected {} planes, got {}", expected, frame.planes.len()),
            ));
        }

        let pixels = match frame.format {
            PixelFormat::PackedRgba => StagedPixels::Rgb(stage_rgba(frame)?),
            PixelFormat::PlanarYuv420 => StagedPixels::Nv21(stage_yuv420(frame)?),
        };

        Ok(StagedFrame {
            width: frame.width,
            height: frame.height,
            pixels,
            timestamp: Instant::now(),
        })
    }

    /// Compress a staged frame, downscaling to the target width if needed
    #[instrument(level = "trace", skip_all, fields(width = staged.width, height = staged.height))]
    pub fn encode(&self, staged: StagedFrame) -> Result<EncodedFrame> {
        let started = Instant::now();
        let StagedFrame {
            width,
            height,
            pixels,
            timestamp,
        } = staged;

        let rgb = match pixels {
            StagedPixels::Rgb(rgb) => rgb,
            StagedPixels::Nv21(nv21) => nv21_to_rgb(&nv21, width as usize, height as usize),
        };
        let mut image = RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
            Error::CodecFailure(format!("staged buffer does not match {}x{}", width, height))
        })?;

        let (out_w, out_h) = target_dimensions(width, height, self.target_width);
        if (out_w, out_h) != (width, height) {
            image = imageops::resize(&image, out_w, out_h, FilterType::Triangle);
        }

        let mut jpeg = Vec::with_capacity(out_w as usize * out_h as usize / 4);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode_image(&image)?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let elapsed = started.elapsed();
        metrics::histogram!("encode_time_us").record(elapsed.as_micros() as f64);
        trace!(sequence, bytes = jpeg.len(), ?elapsed, "Frame encoded");

        Ok(EncodedFrame {
            data: Bytes::from(jpeg),
            sequence,
            width: out_w,
            height: out_h,
            timestamp,
        })
    }
}

/// Validate a plane's layout and return the bytes one row spans
fn check_plane(
    format: PixelFormat,
    index: usize,
    plane: &Plane<'_>,
    cols: usize,
    rows: usize,
    sample_bytes: usize,
) -> Result<usize> {
    if plane.pixel_stride < sample_bytes {
        return Err(Error::unsupported(
            format,
            format!(
                "plane {} pixel stride {} below {}",
                index, plane.pixel_stride, sample_bytes
            ),
        ));
    }
    let (Some(row_len), Some(needed)) = (
        plane.row_len(cols, sample_bytes),
        plane.required_len(cols, rows, sample_bytes),
    ) else {
        return Err(Error::unsupported(
            format,
            format!("plane {} stride overflow", index),
        ));
    };
    if rows > 1 && plane.row_stride < row_len {
        return Err(Error::unsupported(
            format,
            format!(
                "plane {} row stride {} shorter than a row of {} bytes",
                index, plane.row_stride, row_len
            ),
        ));
    }
    if plane.data.len() < needed {
        return Err(Error::unsupported(
            format,
            format!(
                "plane {} holds {} bytes, strides need {}",
                index,
                plane.data.len(),
                needed
            ),
        ));
    }
    Ok(row_len)
}

fn stage_rgba(frame: &RawFrame<'_>) -> Result<Vec<u8>> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let plane = &frame.planes[0];
    let row_len = check_plane(frame.format, 0, plane, w, h, 4)?;

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let start = row * plane.row_stride;
        let src = &plane.data[start..start + row_len];
        for px in src.chunks(plane.pixel_stride) {
            rgb.extend_from_slice(&px[..3]);
        }
    }
    Ok(rgb)
}

fn stage_yuv420(frame: &RawFrame<'_>) -> Result<Vec<u8>> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let (y, u, v) = (&frame.planes[0], &frame.planes[1], &frame.planes[2]);
    let luma_len = check_plane(frame.format, 0, y, w, h, 1)?;
    check_plane(frame.format, 1, u, cw, ch, 1)?;
    check_plane(frame.format, 2, v, cw, ch, 1)?;

    let mut out = Vec::with_capacity(w * h + cw * ch * 2);

    for row in 0..h {
        let start = row * y.row_stride;
        let src = &y.data[start..start + luma_len];
        if y.pixel_stride == 1 {
            out.extend_from_slice(src);
        } else {
            out.extend(src.iter().step_by(y.pixel_stride));
        }
    }

    // U and V may disagree on both strides, so each is walked on its own
    for row in 0..ch {
        let u_row = &u.data[row * u.row_stride..];
        let v_row = &v.data[row * v.row_stride..];
        for col in 0..cw {
            out.push(v_row[col * v.pixel_stride]);
            out.push(u_row[col * u.pixel_stride]);
        }
    }

    Ok(out)
}

/// JFIF (full range BT.601) YCbCr to RGB, 16.16 fixed point
fn nv21_to_rgb(nv21: &[u8], w: usize, h: usize) -> Vec<u8> {
    let cw = w.div_ceil(2);
    let (luma, chroma) = nv21.split_at(w * h);
    let mut rgb = Vec::with_capacity(w * h * 3);

    for row in 0..h {
        let luma_row = &luma[row * w..(row + 1) * w];
        let chroma_row = &chroma[(row / 2) * cw * 2..];
        for (col, &y) in luma_row.iter().enumerate() {
            let vu = &chroma_row[(col / 2) * 2..];
            let y = i32::from(y) << 16;
            let v = i32::from(vu[0]) - 128;
            let u = i32::from(vu[1]) - 128;

            let r = (y + 91_881 * v + 32_768) >> 16;
            let g = (y - 22_554 * u - 46_802 * v + 32_768) >> 16;
            let b = (y + 116_130 * u + 32_768) >> 16;

            rgb.push(r.clamp(0, 255) as u8);
            rgb.push(g.clamp(0, 255) as u8);
            rgb.push(b.clamp(0, 255) as u8);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter() -> PixelConverter {
        PixelConverter::with_settings(90, 720)
    }

    fn decode(frame: &EncodedFrame) -> RgbImage {
        image::load_from_memory_with_format(&frame.data, image::ImageFormat::Jpeg)
            .expect("valid jpeg")
            .to_rgb8()
    }

    /// Synthetic gradient as tightly packed Y, U, V planes
    fn gradient_planes(w: usize, h: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let y = (0..h)
            .flat_map(|r| (0..w).map(move |c| (16 + (c * 200 / w) + (r * 30 / h)) as u8))
            .collect();
        let u = (0..ch)
            .flat_map(|r| (0..cw).map(move |c| (64 + (r * 128 / ch) + c % 3) as u8))
            .collect();
        let v = (0..ch)
            .flat_map(|r| (0..cw).map(move |c| (200 - (c * 120 / cw) - r % 2) as u8))
            .collect();
        (y, u, v)
    }

    /// Spread `src` (cols x rows) into a buffer with the given strides,
    /// filling the gaps with junk that must never be read
    fn with_strides(src: &[u8], cols: usize, rows: usize, row_stride: usize, pixel_stride: usize) -> Vec<u8> {
        let mut out = vec![0xEE; row_stride * rows];
        for r in 0..rows {
            for c in 0..cols {
                out[r * row_stride + c * pixel_stride] = src[r * cols + c];
            }
        }
        out
    }

    #[test]
    fn test_rgba_roundtrip_dimensions() {
        let pixels = [
            255, 0, 0, 255, 0, 255, 0, 255, //
            0, 0, 255, 255, 255, 255, 255, 255,
        ];
        let frame = converter()
            .convert(&RawFrame::packed_rgba(2, 2, &pixels))
            .unwrap();

        assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        assert_eq!(frame.sequence, 1);
        let decoded = decode(&frame);
        assert_eq!(decoded.dimensions(), (2, 2));
    }

    #[test]
    fn test_rgba_row_padding_is_skipped() {
        // 2x2 with 4 junk bytes at the end of each row
        let data = [
            10, 20, 30, 255, 40, 50, 60, 255, 1, 2, 3, 4, //
            70, 80, 90, 255, 100, 110, 120, 255, 5, 6, 7, 8,
        ];
        let frame = RawFrame::new(2, 2, PixelFormat::PackedRgba, vec![Plane::new(&data, 12, 4)]);
        let staged = converter().stage(&frame).unwrap();
        assert_eq!(
            staged.pixels,
            StagedPixels::Rgb(vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120])
        );
    }

    #[test]
    fn test_rgba_wide_pixel_stride() {
        // 8 bytes per pixel, only the first 4 are the pixel
        let data = [1, 2, 3, 255, 0, 0, 0, 0, 4, 5, 6, 255];
        let frame = RawFrame::new(2, 1, PixelFormat::PackedRgba, vec![Plane::new(&data, 12, 8)]);
        let staged = converter().stage(&frame).unwrap();
        assert_eq!(staged.pixels, StagedPixels::Rgb(vec![1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn test_yuv_strides_match_packed_reference() {
        let (w, h): (usize, usize) = (33, 17);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let (y, u, v) = gradient_planes(w, h);

        let reference = RawFrame::new(
            w as u32,
            h as u32,
            PixelFormat::PlanarYuv420,
            vec![
                Plane::new(&y, w, 1),
                Plane::new(&u, cw, 1),
                Plane::new(&v, cw, 1),
            ],
        );

        // luma padded, chroma with 2-byte pixel stride and different row strides
        let y_strided = with_strides(&y, w, h, 48, 1);
        let u_strided = with_strides(&u, cw, ch, 40, 2);
        let v_strided = with_strides(&v, cw, ch, 36, 2);
        let strided = RawFrame::new(
            w as u32,
            h as u32,
            PixelFormat::PlanarYuv420,
            vec![
                Plane::new(&y_strided, 48, 1),
                Plane::new(&u_strided, 40, 2),
                Plane::new(&v_strided, 36, 2),
            ],
        );

        let conv = converter();
        let expected = conv.stage(&reference).unwrap();
        let actual = conv.stage(&strided).unwrap();
        assert_eq!(expected.pixels, actual.pixels);

        let a = decode(&conv.encode(expected).unwrap());
        let b = decode(&conv.encode(actual).unwrap());
        assert_eq!(a.dimensions(), (w as u32, h as u32));
        for (pa, pb) in a.pixels().zip(b.pixels()) {
            for c in 0..3 {
                assert!((i16::from(pa[c]) - i16::from(pb[c])).abs() <= 2);
            }
        }
    }

    #[test]
    fn test_nv21_order_is_v_then_u() {
        let y = [100u8; 4];
        let u = [10u8];
        let v = [20u8];
        let frame = RawFrame::new(
            2,
            2,
            PixelFormat::PlanarYuv420,
            vec![Plane::new(&y, 2, 1), Plane::new(&u, 1, 1), Plane::new(&v, 1, 1)],
        );
        let staged = converter().stage(&frame).unwrap();
        assert_eq!(staged.pixels, StagedPixels::Nv21(vec![100, 100, 100, 100, 20, 10]));
    }

    #[test]
    fn test_neutral_chroma_is_gray() {
        let rgb = nv21_to_rgb(&[0, 128, 255, 77, 128, 128], 2, 2);
        assert_eq!(&rgb[..3], &[0, 0, 0]);
        assert_eq!(&rgb[3..6], &[128, 128, 128]);
        assert_eq!(&rgb[6..9], &[255, 255, 255]);
    }

    #[test]
    fn test_downscale_to_target_width() {
        let pixels = vec![200u8; 64 * 32 * 4];
        let frame = PixelConverter::with_settings(60, 16)
            .convert(&RawFrame::packed_rgba(64, 32, &pixels))
            .unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(decode(&frame).dimensions(), (16, 8));
    }

    #[test]
    fn test_rejects_bad_layouts() {
        let conv = converter();
        let data = [0u8; 16];

        let zero = RawFrame::packed_rgba(0, 2, &data);
        assert!(matches!(conv.stage(&zero), Err(Error::UnsupportedFormat { .. })));

        let two_planes = RawFrame::new(
            2,
            2,
            PixelFormat::PackedRgba,
            vec![Plane::new(&data, 8, 4), Plane::new(&data, 8, 4)],
        );
        assert!(matches!(conv.stage(&two_planes), Err(Error::UnsupportedFormat { .. })));

        let one_yuv_plane = RawFrame::new(2, 2, PixelFormat::PlanarYuv420, vec![Plane::new(&data, 2, 1)]);
        assert!(matches!(conv.stage(&one_yuv_plane), Err(Error::UnsupportedFormat { .. })));

        let short = RawFrame::packed_rgba(4, 4, &data);
        assert!(matches!(conv.stage(&short), Err(Error::UnsupportedFormat { .. })));

        // rows overlapping each other
        let overlapping = RawFrame::new(2, 2, PixelFormat::PackedRgba, vec![Plane::new(&data, 4, 4)]);
        assert!(matches!(conv.stage(&overlapping), Err(Error::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_stride_overflow_is_unsupported() {
        let conv = converter();
        let data = [0u8; 64];

        let huge_row = RawFrame::new(
            2,
            3,
            PixelFormat::PackedRgba,
            vec![Plane::new(&data, usize::MAX / 2 + 1, 4)],
        );
        assert!(matches!(conv.stage(&huge_row), Err(Error::UnsupportedFormat { .. })));

        let huge_pixel = RawFrame::new(
            3,
            1,
            PixelFormat::PackedRgba,
            vec![Plane::new(&data, 64, usize::MAX)],
        );
        assert!(matches!(conv.stage(&huge_pixel), Err(Error::UnsupportedFormat { .. })));

        let y = [0u8; 16];
        let huge_chroma = RawFrame::new(
            4,
            4,
            PixelFormat::PlanarYuv420,
            vec![
                Plane::new(&y, 4, 1),
                Plane::new(&data, 2, 1),
                Plane::new(&data, usize::MAX, usize::MAX),
            ],
        );
        assert!(matches!(conv.stage(&huge_chroma), Err(Error::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_sequence_increases() {
        let conv = converter();
        let px = [0u8, 0, 0, 255];
        let a = conv.convert(&RawFrame::packed_rgba(1, 1, &px)).unwrap();
        let b = conv.convert(&RawFrame::packed_rgba(1, 1, &px)).unwrap();
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_quality_zero_is_clamped() {
        assert_eq!(PixelConverter::with_settings(0, 720).quality(), 1);
        assert_eq!(PixelConverter::with_settings(255, 720).quality(), 100);
    }
}

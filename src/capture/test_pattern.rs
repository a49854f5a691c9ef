//! Synthetic pull-based source used for bring-up and demos

use std::time::{Duration, Instant};

use tracing::info;

use super::frame::{PixelFormat, Plane, RawFrame};
use super::source::FrameSource;
use crate::error::CaptureError;

/// Row alignment the pattern pads to, so downstream stride handling is
/// exercised the same way a real capture buffer would exercise it
const ROW_ALIGN: usize = 64;

/// Moving RGBA gradient at a fixed frame rate
pub struct TestPatternSource {
    width: u32,
    height: u32,
    row_stride: usize,
    interval: Duration,
    next_due: Instant,
    tick: u32,
    buffer: Vec<u8>,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        let row_stride = (width as usize * 4).div_ceil(ROW_ALIGN) * ROW_ALIGN;
        let fps = fps.max(1);

        info!(width, height, fps, "Test pattern source created");

        Self {
            width,
            height,
            row_stride,
            interval: Duration::from_millis(1000 / u64::from(fps)),
            next_due: Instant::now(),
            tick: 0,
            buffer: vec![0; row_stride * height as usize],
        }
    }

    fn render(&mut self) {
        let (w, h) = (self.width, self.height);
        let shift = self.tick.wrapping_mul(4);

        for (y, row) in self.buffer.chunks_exact_mut(self.row_stride).enumerate() {
            let g = (y as u32 * 255 / h) as u8;
            for (x, px) in row[..self.width as usize * 4].chunks_exact_mut(4).enumerate() {
                let r = ((x as u32 * 255 / w).wrapping_add(shift) & 0xff) as u8;
                px.copy_from_slice(&[r, g, 255 - r / 2 - g / 2, 255]);
            }
        }
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame<'_>>, CaptureError> {
        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }

        self.next_due = self.next_due.max(now) + self.interval;
        self.tick = self.tick.wrapping_add(1);
        self.render();

        Ok(Some(RawFrame::new(
            self.width,
            self.height,
            PixelFormat::PackedRgba,
            vec![Plane::new(&self.buffer, self.row_stride, 4)],
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_frame_layout() {
        let mut source = TestPatternSource::new(10, 4, 30);
        let frame = source
            .next_frame(Duration::from_millis(100))
            .unwrap()
            .expect("first frame is due immediately");

        assert_eq!(frame.width, 10);
        assert_eq!(frame.height, 4);
        assert_eq!(frame.planes.len(), 1);
        assert_eq!(frame.planes[0].row_stride, 64);
        assert_eq!(frame.planes[0].data.len(), 64 * 4);
        // alpha is opaque
        assert_eq!(frame.planes[0].data[3], 255);
    }

    #[test]
    fn test_pattern_respects_timeout() {
        let mut source = TestPatternSource::new(4, 4, 1);
        assert!(source.next_frame(Duration::from_millis(10)).unwrap().is_some());
        // next frame is a second away
        assert!(source.next_frame(Duration::from_millis(10)).unwrap().is_none());
    }
}

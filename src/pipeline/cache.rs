//! Process-wide holder of the newest encoded frame

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::capture::EncodedFrame;

/// Single-writer, many-reader broadcast cell.
///
/// `publish` swaps the whole reference, so a `read` sees either the previous
/// frame or the new one. Neither side ever waits on the other.
#[derive(Default)]
pub struct LatestFrameCache {
    latest: ArcSwapOption<EncodedFrame>,
}

impl LatestFrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame
    pub fn publish(&self, frame: EncodedFrame) {
        self.publish_arc(Arc::new(frame));
    }

    pub fn publish_arc(&self, frame: Arc<EncodedFrame>) {
        self.latest.store(Some(frame));
    }

    /// Newest frame, or `None` before the first publish
    pub fn read(&self) -> Option<Arc<EncodedFrame>> {
        self.latest.load_full()
    }

    /// Sequence number of the held frame without cloning the reference
    pub fn sequence(&self) -> Option<u64> {
        self.latest.load().as_ref().map(|f| f.sequence)
    }
}

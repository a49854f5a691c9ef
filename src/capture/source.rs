//! Capture source capability
//!
//! The pipeline only sees [`FrameSource`]. Pull-based back-ends implement it
//! directly; push-based back-ends (callbacks from an OS capture API) feed a
//! [`FramePusher`] and hand the matching [`PushSource`] to the pipeline.

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::trace;

use super::frame::{OwnedFrame, RawFrame};
use crate::error::CaptureError;

/// Anything that can hand the pipeline raw frames.
///
/// The returned frame borrows from the source and is released before the
/// next call, so a source is free to reuse its buffers.
pub trait FrameSource: Send {
    /// Wait up to `timeout` for the next frame.
    ///
    /// `Ok(None)` means nothing arrived in time; the caller polls again.
    /// `Err(CaptureError::Disconnected)` ends the capture loop.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame<'_>>, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame<'_>>, CaptureError> {
        (**self).next_frame(timeout)
    }
}

/// Create a connected push handle and pipeline-side source
pub fn push_source() -> (FramePusher, PushSource) {
    let (tx, rx) = flume::bounded(1);
    (
        FramePusher {
            tx,
            stale: Arc::new(rx.clone()),
        },
        PushSource { rx, current: None },
    )
}

/// Producer half for callback-driven capture back-ends
#[derive(Clone)]
pub struct FramePusher {
    tx: Sender<OwnedFrame>,
    // Evicts a frame the pipeline has not picked up yet. Shared by every
    // clone so the channel sees exactly one extra receiver.
    stale: Arc<Receiver<OwnedFrame>>,
}

impl FramePusher {
    /// Hand over a frame without blocking, replacing one still pending.
    pub fn push(&self, frame: OwnedFrame) -> Result<(), CaptureError> {
        // The pushers hold one receiver between them
        if self.tx.receiver_count() <= 1 {
            return Err(CaptureError::Disconnected);
        }

        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(rejected)) => {
                    if self.stale.try_recv().is_ok() {
                        trace!("Replaced pending pushed frame");
                    }
                    frame = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return Err(CaptureError::Disconnected),
            }
        }
    }
}

/// Pipeline half of [`push_source`]
pub struct PushSource {
    rx: Receiver<OwnedFrame>,
    current: Option<OwnedFrame>,
}

impl FrameSource for PushSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame<'_>>, CaptureError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                let frame = self.current.insert(frame);
                Ok(Some(frame.as_raw()))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Disconnected),
        }
    }
}

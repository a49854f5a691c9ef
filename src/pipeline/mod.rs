//! Capture → stage → slot → encode → cache
//!
//! Two dedicated OS threads: the capture thread pulls from the source and
//! stages each frame into an owned buffer, the encode thread compresses the
//! freshest staged frame and publishes it. Neither ever waits on a viewer.

pub mod cache;
pub mod convert;
pub mod slot;

pub use cache::LatestFrameCache;
pub use convert::{PixelConverter, StagedFrame, StagedPixels};
pub use slot::{frame_slot, SlotConsumer, SlotProducer, SlotStats};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, warn};

use crate::capture::FrameSource;
use crate::error::{CaptureError, Error, Result};

/// Upper bound on how long the capture thread waits inside the source before
/// checking for shutdown
const CAPTURE_POLL: Duration = Duration::from_millis(50);

/// Counters shared by both pipeline threads
#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    dropped: AtomicU64,
    encoded: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of pipeline throughput
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames pulled from the source and staged
    pub captured: u64,
    /// Staged frames replaced before the encoder got to them
    pub dropped: u64,
    /// Frames compressed and published
    pub encoded: u64,
    /// Frames skipped because staging or encoding failed
    pub failed: u64,
}

/// Running capture/encode pair feeding a [`LatestFrameCache`]
pub struct Pipeline {
    running: Arc<AtomicBool>,
    counters: Arc<CachePadded<Counters>>,
    producer: Arc<SlotProducer<StagedFrame>>,
    capture_handle: Option<JoinHandle<()>>,
    encode_handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn the capture and encode threads
    pub fn start<S>(
        source: S,
        converter: Arc<PixelConverter>,
        cache: Arc<LatestFrameCache>,
    ) -> Result<Self>
    where
        S: FrameSource + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(CachePadded::new(Counters::default()));
        let (producer, consumer) = frame_slot::<StagedFrame>();
        let producer = Arc::new(producer);

        let capture_handle = {
            let running = Arc::clone(&running);
            let counters = Arc::clone(&counters);
            let converter = Arc::clone(&converter);
            let producer = Arc::clone(&producer);
            thread::Builder::new()
                .name("lanscreen-capture".into())
                .spawn(move || capture_loop(source, &converter, &producer, &running, &counters))
                .map_err(|e| Error::Capture(CaptureError::Backend(e.to_string())))?
        };

        let encode_handle = {
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("lanscreen-encode".into())
                .spawn(move || encode_loop(consumer, &converter, &cache, &counters))
        };
        let encode_handle = match encode_handle {
            Ok(handle) => handle,
            Err(e) => {
                stop_capture(&running, &producer, capture_handle);
                return Err(Error::Capture(CaptureError::Backend(e.to_string())));
            }
        };

        info!("Pipeline started");

        Ok(Self {
            running,
            counters,
            producer,
            capture_handle: Some(capture_handle),
            encode_handle: Some(encode_handle),
        })
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            captured: self.counters.captured.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            encoded: self.counters.encoded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// True while the capture thread is still pulling frames
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop both threads and wait for them
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.producer.close();

        for handle in [self.capture_handle.take(), self.encode_handle.take()]
            .into_iter()
            .flatten()
        {
            let name = handle.thread().name().unwrap_or("pipeline").to_owned();
            if handle.join().is_err() {
                error!(thread = %name, "Pipeline thread panicked");
            }
        }

        let stats = self.stats();
        info!(
            captured = stats.captured,
            dropped = stats.dropped,
            encoded = stats.encoded,
            failed = stats.failed,
            "Pipeline stopped"
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.capture_handle.is_some() || self.encode_handle.is_some() {
            self.shutdown();
        }
    }
}

fn capture_loop<S: FrameSource>(
    mut source: S,
    converter: &PixelConverter,
    producer: &SlotProducer<StagedFrame>,
    running: &AtomicBool,
    counters: &Counters,
) {
    debug!("Capture thread started");

    while running.load(Ordering::Relaxed) {
        let staged = match source.next_frame(CAPTURE_POLL) {
            Ok(Some(frame)) => converter.stage(&frame),
            Ok(None) => continue,
            Err(CaptureError::Disconnected) => {
                info!("Capture source disconnected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Capture error");
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        match staged {
            Ok(staged) => {
                counters.captured.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_captured").increment(1);
                if producer.offer(staged) {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("frames_dropped").increment(1);
                }
            }
            Err(e) => record_failure(counters, &e, "Skipping frame"),
        }
    }

    running.store(false, Ordering::Relaxed);
    producer.close();
    debug!("Capture thread stopped");
}

/// Stop a capture thread that has no encode thread behind it
fn stop_capture(running: &AtomicBool, producer: &SlotProducer<StagedFrame>, handle: JoinHandle<()>) {
    running.store(false, Ordering::Relaxed);
    producer.close();
    if handle.join().is_err() {
        error!("Capture thread panicked");
    }
}

fn encode_loop(
    consumer: SlotConsumer<StagedFrame>,
    converter: &PixelConverter,
    cache: &LatestFrameCache,
    counters: &Counters,
) {
    debug!("Encode thread started");

    while let Some(staged) = consumer.take() {
        match converter.encode(staged) {
            Ok(frame) => {
                let latency = frame.timestamp.elapsed();
                metrics::histogram!("frame_latency_ms").record(latency.as_secs_f64() * 1000.0);
                debug!(sequence = frame.sequence, bytes = frame.len(), "Publishing frame");

                cache.publish(frame);
                counters.encoded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_encoded").increment(1);
            }
            Err(e) => record_failure(counters, &e, "Encode failed, frame skipped"),
        }
    }

    debug!("Encode thread stopped");
}

fn record_failure(counters: &Counters, err: &Error, msg: &str) {
    counters.failed.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("frames_failed").increment(1);
    if err.is_per_frame() {
        warn!(error = %err, "{}", msg);
    } else {
        error!(error = %err, "{}", msg);
    }
}

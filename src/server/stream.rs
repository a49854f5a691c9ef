//! Per-viewer MJPEG body
//!
//! Every `/stream` connection owns one [`ViewerStream`]. It wakes on its own
//! interval, reads the [`LatestFrameCache`] and yields one multipart part when
//! there is something new to send. Hyper only polls for the next part once the
//! previous one was handed to the socket, so a stalled client stalls nothing
//! but its own stream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream;
use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::capture::EncodedFrame;
use crate::pipeline::LatestFrameCache;
use crate::StreamConfig;

/// `Content-Type` of the stream response for `boundary`
pub fn content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

/// One multipart part: delimiter, part headers, blank line, JPEG, CRLF
pub fn encode_part(boundary: &str, frame: &EncodedFrame) -> Bytes {
    let head = format!(
        "--{boundary}\r\n\
         Content-Type: image/jpeg\r\n\
         Content-Length: {len}\r\n\
         \r\n",
        len = frame.len()
    );

    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(&frame.data);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Counts a connection as a viewer for as long as it lives
pub struct ViewerGuard {
    viewers: Arc<AtomicUsize>,
    peer: String,
    opened: Instant,
    sent: u64,
}

impl ViewerGuard {
    pub fn new(viewers: Arc<AtomicUsize>, peer: Option<SocketAddr>) -> Self {
        let peer = peer.map_or_else(|| "unknown".to_owned(), |addr| addr.to_string());
        let active = viewers.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("viewers").set(active as f64);
        info!(peer = %peer, viewers = active, "Viewer connected");

        Self {
            viewers,
            peer,
            opened: Instant::now(),
            sent: 0,
        }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let active = self.viewers.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!("viewers").set(active as f64);
        info!(
            peer = %self.peer,
            frames = self.sent,
            duration_s = self.opened.elapsed().as_secs_f64(),
            viewers = active,
            "Viewer disconnected"
        );
    }
}

/// Paced reader of the frame cache for a single connection
pub struct ViewerStream {
    cache: Arc<LatestFrameCache>,
    ticker: Interval,
    boundary: Arc<str>,
    resend_unchanged: bool,
    last_sequence: Option<u64>,
    shutdown: watch::Receiver<bool>,
    viewer: ViewerGuard,
}

impl ViewerStream {
    /// Must be called from within a tokio runtime
    pub fn new(
        cache: Arc<LatestFrameCache>,
        config: &StreamConfig,
        shutdown: watch::Receiver<bool>,
        viewer: ViewerGuard,
    ) -> Self {
        Self::with_interval(cache, config, config.frame_interval(), shutdown, viewer)
    }

    fn with_interval(
        cache: Arc<LatestFrameCache>,
        config: &StreamConfig,
        period: Duration,
        shutdown: watch::Receiver<bool>,
        viewer: ViewerGuard,
    ) -> Self {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            cache,
            ticker,
            boundary: Arc::from(config.boundary.as_str()),
            resend_unchanged: config.resend_unchanged,
            last_sequence: None,
            shutdown,
            viewer,
        }
    }

    /// Wait for the next tick that has a frame to send.
    ///
    /// Returns `None` once the server is shutting down.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        loop {
            if *self.shutdown.borrow_and_update() {
                return None;
            }

            tokio::select! {
                biased;
                Ok(()) = self.shutdown.changed() => continue,
                _ = self.ticker.tick() => {}
            }

            let Some(frame) = self.cache.read() else {
                continue;
            };
            if !self.resend_unchanged && self.last_sequence == Some(frame.sequence) {
                continue;
            }

            self.last_sequence = Some(frame.sequence);
            self.viewer.sent += 1;
            metrics::counter!("stream_parts_sent").increment(1);
            debug!(peer = %self.viewer.peer, sequence = frame.sequence, "Sending part");
            return Some(encode_part(&self.boundary, &frame));
        }
    }

    /// Response whose body yields parts until the client goes away or the
    /// server shuts down
    pub fn into_response(self) -> Response {
        let content_type = content_type(&self.boundary);

        let parts = stream::unfold(self, |mut viewer| async move {
            let part = viewer.next_part().await?;
            Some((Ok::<_, Infallible>(part), viewer))
        });

        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (
                    header::CACHE_CONTROL,
                    "no-cache, no-store, must-revalidate".to_owned(),
                ),
                (header::PRAGMA, "no-cache".to_owned()),
                (header::CONNECTION, "close".to_owned()),
            ],
            Body::from_stream(parts),
        )
            .into_response()
    }
}

//! Error types for the frame pipeline and streaming server

use std::net::SocketAddr;

use thiserror::Error;

use crate::capture::PixelFormat;

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// Per-frame errors (`UnsupportedFormat`, `CodecFailure`) and per-connection
/// errors (`SocketFailure`) are isolated by the pipeline and server loops;
/// only `ListenFailure` and `Config` are meant to reach the operator.
#[derive(Debug, Error)]
pub enum Error {
    /// Frame layout the converter cannot handle
    #[error("unsupported frame: {format:?} {reason}")]
    UnsupportedFormat {
        format: PixelFormat,
        reason: String,
    },

    /// Compression step failed
    #[error("codec failure: {0}")]
    CodecFailure(String),

    /// Write to a viewer failed
    #[error("socket failure: {0}")]
    SocketFailure(#[source] std::io::Error),

    /// HTTP listener could not be bound
    #[error("failed to listen on {addr}: {source}")]
    ListenFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Capture source failed or went away
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Failures reported by a [`FrameSource`](crate::capture::FrameSource)
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The producing side is gone; no more frames will arrive
    #[error("capture source disconnected")]
    Disconnected,

    /// Back-end specific failure, the source may still recover
    #[error("{0}")]
    Backend(String),
}

impl Error {
    pub fn unsupported(format: PixelFormat, reason: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            format,
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for errors that only affect the frame being processed
    pub fn is_per_frame(&self) -> bool {
        matches!(self, Self::UnsupportedFormat { .. } | Self::CodecFailure(_))
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Self::CodecFailure(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

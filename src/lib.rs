//! Live MJPEG stream of a screen to any browser on the local network
//!
//! Frames flow capture source → [`PixelConverter`] → [`FrameSlot`](pipeline::slot)
//! → [`LatestFrameCache`] → any number of `/stream` connections, each pacing
//! itself independently.

pub mod capture;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod utils;

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{EncodedFrame, FrameSource, PixelFormat, RawFrame};
pub use error::{Error, Result};
pub use pipeline::{LatestFrameCache, PixelConverter, Pipeline};
pub use server::StreamServer;

/// Highest stream rate a viewer connection will pace to
pub const MAX_FPS: u32 = 30;

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    /// 0 picks an ephemeral port
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Target rate per viewer, clamped to `1..=MAX_FPS`
    pub fps: u32,
    /// Multipart boundary token
    pub boundary: String,
    /// Send the cached frame on every tick even if this viewer already has it
    pub resend_unchanged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Built-in moving gradient
    TestPattern,
    /// No capture; frames come from an embedding application or never
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// JPEG quality, 0-100
    pub jpeg_quality: u8,
    /// Frames wider than this are downscaled before encoding
    pub target_width: u32,
    /// Rate the built-in source produces at
    pub source_fps: u32,
    pub pattern_width: u32,
    pub pattern_height: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: 10,
            boundary: "frame".into(),
            resend_unchanged: false,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::TestPattern,
            jpeg_quality: 60,
            target_width: 720,
            source_fps: 30,
            pattern_width: 1280,
            pattern_height: 720,
        }
    }
}

impl StreamConfig {
    pub fn effective_fps(&self) -> u32 {
        self.fps.clamp(1, MAX_FPS)
    }

    /// `1000 / fps` milliseconds
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.effective_fps()))
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `LANSCREEN_*` variables
    /// (`LANSCREEN_STREAM__FPS=15`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("LANSCREEN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let boundary = &self.stream.boundary;
        if boundary.is_empty() || boundary.len() > 70 {
            return Err(Error::config("stream.boundary must be 1-70 characters"));
        }
        if !boundary
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
        {
            return Err(Error::config(format!(
                "stream.boundary contains characters not allowed in a header token: {:?}",
                boundary
            )));
        }
        if self.capture.jpeg_quality > 100 {
            return Err(Error::config(format!(
                "capture.jpeg_quality must be 0-100, got {}",
                self.capture.jpeg_quality
            )));
        }
        if self.capture.target_width == 0 {
            return Err(Error::config("capture.target_width must be > 0"));
        }
        if self.capture.source_fps == 0 {
            return Err(Error::config("capture.source_fps must be > 0"));
        }
        if self.capture.pattern_width == 0 || self.capture.pattern_height == 0 {
            return Err(Error::config("capture.pattern_width and pattern_height must be > 0"));
        }
        Ok(())
    }
}

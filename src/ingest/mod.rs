//! Frame ingestion sources.
//!
//! This module provides the sources a sampling loop can read frames from:
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - HTTP MJPEG streams and JPEG snapshot endpoints
//! - Stub source (`stub://`, synthetic frames for testing)
//!
//! Every source implements `FrameSource`. The ingestion layer is responsible for:
//! - Holding the camera handle between `connect()` and `release()`
//! - Turning disconnections and failed reads into `None`, never a panic
//! - Tracking read latency and drop statistics
//!
//! The ingestion layer MUST NOT:
//! - Store frames to disk
//! - Block a tick forever (reads are bounded by a frame timeout)

pub mod http;
pub mod rtsp;
mod stats;

use std::time::Duration;

use anyhow::{anyhow, Result};
use url::Url;

use crate::frame::Frame;

pub use http::{HttpSource, HttpSourceConfig};
pub use rtsp::{RtspConfig, RtspSource};
pub use stats::{StreamStats, StreamStatsWindow};

/// A camera stream that yields the most recent frame on demand.
pub trait FrameSource: Send {
    /// Human readable location (URL) for logs.
    fn describe(&self) -> String;

    /// Open (or reopen) the stream. Any previously held handle is released first.
    fn connect(&mut self) -> Result<()>;

    /// Read the latest frame. `None` on disconnection or a failed read.
    fn next_frame(&mut self) -> Option<Frame>;

    fn is_connected(&self) -> bool;

    /// Release the underlying handle. Safe to call more than once.
    fn release(&mut self);

    fn stats(&self) -> StreamStats;
}

/// Options shared by all network sources.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Upper bound on a single frame read.
    pub frame_timeout: Duration,
    /// Frames discarded right after connecting so the first read is current.
    pub warmup_frames: u32,
    /// Frame size for synthetic `stub://` sources.
    pub width: u32,
    pub height: u32,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_secs(2),
            warmup_frames: 5,
            width: 640,
            height: 480,
        }
    }
}

/// Open a source for `url`, choosing the backend by scheme.
///
/// The returned source is not connected yet.
pub fn open_source(url: &str, options: &SourceOptions) -> Result<Box<dyn FrameSource>> {
    let scheme = source_scheme(url)?;
    match scheme.as_str() {
        "stub" | "rtsp" | "rtsps" => Ok(Box::new(RtspSource::new(RtspConfig {
            url: url.to_string(),
            frame_timeout: options.frame_timeout,
            warmup_frames: options.warmup_frames,
            width: options.width,
            height: options.height,
        })?)),
        "http" | "https" => Ok(Box::new(HttpSource::new(HttpSourceConfig {
            url: url.to_string(),
            frame_timeout: options.frame_timeout,
        }))),
        other => Err(anyhow!(
            "unsupported stream scheme '{}'; expected rtsp(s), http(s) or stub",
            other
        )),
    }
}

/// Lower-cased scheme of a stream URL.
pub fn source_scheme(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| anyhow!("invalid stream url '{}': {}", url, e))?;
    Ok(parsed.scheme().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_urls_open_synthetic_sources() -> Result<()> {
        let mut source = open_source("stub://bed-3", &SourceOptions::default())?;
        source.connect()?;
        assert!(source.next_frame().is_some());
        Ok(())
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = open_source("ftp://camera/feed", &SourceOptions::default())
            .err()
            .expect("ftp must be rejected");
        assert!(err.to_string().contains("unsupported stream scheme"));
    }

    #[test]
    fn garbage_url_is_rejected() {
        assert!(source_scheme("not a url").is_err());
    }
}

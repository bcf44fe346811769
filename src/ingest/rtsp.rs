//! RTSP frame source.
//!
//! This module provides `RtspSource` for reading frames from IP cameras via RTSP.
//!
//! The RTSP source is responsible for:
//! - Connecting to camera streams over TCP with minimal buffering
//! - Discarding warm-up frames so the first read is current
//! - Decoding the latest frame on demand (older frames are dropped by the sink)
//! - Releasing the pipeline on `release()` and on drop
//!
//! The RTSP source MUST NOT:
//! - Store decoded frames to disk
//! - Queue frames between ticks

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
use std::time::{Duration, Instant};

use super::stats::{StreamStats, StreamStatsWindow};
use super::FrameSource;
use crate::frame::Frame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.0.183:8554/camera"), or "stub://<name>".
    pub url: String,
    /// Upper bound on pulling one frame.
    pub frame_timeout: Duration,
    /// Frames discarded after connecting.
    pub warmup_frames: u32,
    /// Frame width (synthetic frames only).
    pub width: u32,
    /// Frame height (synthetic frames only).
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:8554/camera".to_string(),
            frame_timeout: Duration::from_secs(2),
            warmup_frames: 5,
            width: 640,
            height: 480,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
            }
        }
    }
}

impl FrameSource for RtspSource {
    fn describe(&self) -> String {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.config.url.clone(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.config.url.clone(),
        }
    }

    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Option<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn is_connected(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.connected,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.pipeline.is_some(),
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.release(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.release(),
        }
    }

    fn stats(&self) -> StreamStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats.snapshot(&source.config.url),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats.snapshot(&source.config.url),
        }
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    connected: bool,
    frame_count: u64,
    /// Simulated "scene" state so consecutive frames differ.
    scene_state: u8,
    stats: StreamStatsWindow,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            connected: false,
            frame_count: 0,
            scene_state: 0,
            stats: StreamStatsWindow::new(),
        }
    }

    /// Synthetic sources are always reachable.
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if !self.connected {
            self.stats.record_drop();
            return None;
        }
        let started = Instant::now();
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        match Frame::from_rgb(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        ) {
            Ok(frame) => {
                self.stats
                    .record_frame(started.elapsed().as_secs_f64() * 1000.0);
                Some(frame)
            }
            Err(e) => {
                log::debug!("RtspSource: synthetic frame rejected: {}", e);
                self.stats.record_drop();
                None
            }
        }
    }

    /// Dark monitor background with four bright readout bands; the bands
    /// shift every 50 frames.
    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let width = (self.config.width as usize).max(1);
        let height = self.config.height.max(1) as usize;
        let band = (height / 8).max(1);
        let shift = self.scene_state as usize % band;
        let mut pixels = vec![16u8; width * height * 3];
        for (row, line) in pixels.chunks_mut(width * 3).enumerate() {
            let slot = (row + shift) / band;
            if slot % 2 == 1 && slot < 8 {
                let green = 160 + (slot as u8 * 10);
                for px in line.chunks_mut(3) {
                    px.copy_from_slice(&[40, green, 60]);
                }
            }
        }
        pixels
    }

    fn release(&mut self) {
        if self.connected {
            log::info!("RtspSource: released {} (synthetic)", self.config.url);
        }
        self.connected = false;
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    frame_count: u64,
    stats: StreamStatsWindow,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            frame_count: 0,
            stats: StreamStatsWindow::new(),
        })
    }

    /// Build `rtspsrc ! decodebin ! videoconvert ! appsink` over TCP with no jitter buffer.
    fn build_pipeline(&self) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        use gstreamer::prelude::*;

        let pipeline_description = format!(
            "rtspsrc location={} protocols=tcp latency=0 ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            self.config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok((pipeline, appsink))
    }

    fn connect(&mut self) -> Result<()> {
        use gstreamer::prelude::*;

        self.release();
        let (pipeline, appsink) = self.build_pipeline()?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;

        // Preroll: the first sample proves the stream is actually delivering.
        let timeout = self.clock_timeout();
        if appsink.try_pull_preroll(timeout).is_none() {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow::anyhow!(
                "RTSP stream {} produced no frames",
                self.config.url
            ));
        }
        for _ in 0..self.config.warmup_frames {
            let _ = appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(50));
        }

        self.pipeline = Some((pipeline, appsink));
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Option<Frame> {
        let timeout = self.clock_timeout();
        let Some((pipeline, appsink)) = self.pipeline.as_ref() else {
            self.stats.record_drop();
            return None;
        };
        if let Some(reason) = poll_bus(pipeline) {
            log::warn!("RtspSource: {} ({})", reason, self.config.url);
            self.stats.record_drop();
            return None;
        }

        let started = Instant::now();
        let Some(sample) = appsink.try_pull_sample(timeout) else {
            log::debug!("RtspSource: stream stalled ({})", self.config.url);
            self.stats.record_drop();
            return None;
        };

        match sample_to_pixels(&sample) {
            Ok((pixels, width, height)) => {
                self.frame_count += 1;
                match Frame::from_rgb(pixels, width, height, self.frame_count) {
                    Ok(frame) => {
                        self.stats
                            .record_frame(started.elapsed().as_secs_f64() * 1000.0);
                        Some(frame)
                    }
                    Err(e) => {
                        log::debug!("RtspSource: bad frame: {}", e);
                        self.stats.record_drop();
                        None
                    }
                }
            }
            Err(e) => {
                log::debug!("RtspSource: bad sample: {}", e);
                self.stats.record_drop();
                None
            }
        }
    }

    fn release(&mut self) {
        use gstreamer::prelude::*;

        if let Some((pipeline, _)) = self.pipeline.take() {
            let _ = pipeline.set_state(gstreamer::State::Null);
            log::info!("RtspSource: released {}", self.config.url);
        }
    }

    fn clock_timeout(&self) -> gstreamer::ClockTime {
        let ms = self.config.frame_timeout.as_millis().max(100) as u64;
        gstreamer::ClockTime::from_mseconds(ms)
    }
}

/// Drain the pipeline bus. Returns a reason when the stream errored or ended.
#[cfg(feature = "rtsp-gstreamer")]
fn poll_bus(pipeline: &gstreamer::Pipeline) -> Option<String> {
    use gstreamer::prelude::*;

    let bus = pipeline.bus()?;
    while let Some(message) = bus.pop() {
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Error(err) => {
                return Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
            MessageView::Eos(..) => return Some("gstreamer reached EOS".to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            width: 64,
            height: 48,
            ..RtspConfig::default()
        }
    }

    #[test]
    fn rtsp_source_produces_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.connect()?;

        let frame = source.next_frame().expect("synthetic frame");
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.sequence, 1);

        Ok(())
    }

    #[test]
    fn rtsp_source_yields_nothing_before_connect() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        assert!(!source.is_connected());
        assert!(source.next_frame().is_none());
        assert_eq!(source.stats().drops, 1);
        Ok(())
    }

    #[test]
    fn rtsp_source_release_disconnects() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.connect()?;
        source.release();
        source.release();
        assert!(!source.is_connected());
        assert!(source.next_frame().is_none());

        source.connect()?;
        assert!(source.next_frame().is_some());
        Ok(())
    }

    #[test]
    fn rtsp_source_tracks_frame_stats() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.connect()?;
        for _ in 0..3 {
            source.next_frame();
        }
        let stats = source.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.drops, 0);
        assert_eq!(stats.url, "stub://test");
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn real_rtsp_urls_need_gstreamer() {
        let config = RtspConfig {
            url: "rtsp://192.168.0.183:8554/camera".to_string(),
            ..RtspConfig::default()
        };
        assert!(RtspSource::new(config).is_err());
    }
}

//! HTTP frame source.
//!
//! This module provides `HttpSource` for cameras that expose an MJPEG stream
//! (`multipart/x-mixed-replace`) or a single-JPEG snapshot endpoint over HTTP(S).
//!
//! The HTTP source is responsible for:
//! - Detecting MJPEG vs. snapshot from the response content type
//! - Splitting the MJPEG byte stream into JPEG frames (SOI/EOI markers)
//! - Decoding JPEG frames in-memory
//!
//! The HTTP source MUST NOT:
//! - Store decoded frames to disk
//! - Buffer more than one oversized frame worth of bytes

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use super::stats::{StreamStats, StreamStatsWindow};
use super::FrameSource;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Configuration for an HTTP source.
#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    /// Stream or snapshot URL (http or https).
    pub url: String,
    /// Read timeout for the connection and each snapshot request.
    pub frame_timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:81/stream".to_string(),
            frame_timeout: Duration::from_secs(2),
        }
    }
}

/// HTTP MJPEG/JPEG frame source.
pub struct HttpSource {
    config: HttpSourceConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    frame_count: u64,
    stats: StreamStatsWindow,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.frame_timeout)
            .timeout_read(config.frame_timeout)
            .build();
        Self {
            config,
            agent,
            stream: None,
            frame_count: 0,
            stats: StreamStatsWindow::new(),
        }
    }

    fn read_jpeg(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http source not connected; call connect() first"))?;
        match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg(),
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.agent, &self.config.url),
        }
    }
}

impl FrameSource for HttpSource {
    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        self.release();
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
            log::info!("HttpSource: connected to {} (mjpeg)", self.config.url);
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
            log::info!("HttpSource: connected to {} (snapshot)", self.config.url);
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Option<Frame> {
        let started = Instant::now();
        let decoded = self.read_jpeg().and_then(|jpeg| {
            self.frame_count += 1;
            Frame::decode(&jpeg, self.frame_count)
        });
        match decoded {
            Ok(frame) => {
                self.stats
                    .record_frame(started.elapsed().as_secs_f64() * 1000.0);
                Some(frame)
            }
            Err(e) => {
                log::debug!("HttpSource: read failed for {}: {:#}", self.config.url, e);
                self.stats.record_drop();
                if matches!(self.stream, Some(HttpStream::Mjpeg(_))) {
                    // A broken multipart stream cannot resynchronise.
                    self.stream = None;
                }
                None
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            log::info!("HttpSource: released {}", self.config.url);
        }
    }

    fn stats(&self) -> StreamStats {
        self.stats.snapshot(&self.config.url)
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Locate the first complete JPEG (SOI `FFD8` .. EOI `FFD9`) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

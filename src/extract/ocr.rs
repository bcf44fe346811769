//! Tesseract-backed text recognition.
//!
//! Frames are binarised before recognition: grayscale, 2x upscale, Otsu
//! threshold, then a 3x3 median to remove speckle. The result is piped to the
//! `tesseract` CLI as PNG on stdin; text comes back on stdout.

use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};

use super::pattern::TextRecognizer;
use crate::frame::Frame;

/// How to invoke tesseract.
#[derive(Clone, Debug, PartialEq)]
pub struct TesseractSettings {
    /// Binary name or path.
    pub binary: PathBuf,
    /// Page segmentation mode (6 = single uniform block of text).
    pub psm: u8,
    /// Characters tesseract may emit.
    pub whitelist: String,
}

impl Default for TesseractSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            psm: 6,
            whitelist: "0123456789.%".to_string(),
        }
    }
}

pub struct TesseractRecognizer {
    settings: TesseractSettings,
}

impl TesseractRecognizer {
    pub fn new(settings: TesseractSettings) -> Self {
        Self { settings }
    }

    fn run(&self, png: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.settings.binary)
            .arg("stdin")
            .arg("stdout")
            .arg("--psm")
            .arg(self.settings.psm.to_string())
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={}", self.settings.whitelist))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    anyhow!("{} not found on PATH", self.settings.binary.display())
                } else {
                    anyhow!("spawn {}: {}", self.settings.binary.display(), e)
                }
            })?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("tesseract stdin unavailable"))?;
            stdin.write_all(png).context("write png to tesseract")?;
        }

        let output = child.wait_with_output().context("wait for tesseract")?;
        if !output.status.success() {
            return Err(anyhow!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn recognize(&mut self, frame: &Frame) -> Result<String> {
        let processed = preprocess(frame)?;
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(processed)
            .write_to(&mut png, ImageFormat::Png)
            .context("encode preprocessed frame")?;
        self.run(png.get_ref())
    }
}

/// Binarise a frame for digit recognition.
pub fn preprocess(frame: &Frame) -> Result<GrayImage> {
    let gray = imageops::grayscale(&frame.to_rgb_image()?);
    let (width, height) = gray.dimensions();
    let mut upscaled = imageops::resize(&gray, width * 2, height * 2, FilterType::CatmullRom);
    let threshold = otsu_threshold(&upscaled);
    for pixel in upscaled.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > threshold { 255 } else { 0 };
    }
    Ok(median3(&upscaled))
}

/// Threshold that maximises between-class variance of the histogram.
pub fn otsu_threshold(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in image.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }
    let weighted_sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, count)| level as f64 * *count as f64)
        .sum();

    let mut background_weight = 0u64;
    let mut background_sum = 0.0;
    let mut best = (0u8, -1.0f64);
    for (level, count) in histogram.iter().enumerate() {
        background_weight += count;
        if background_weight == 0 {
            continue;
        }
        let foreground_weight = total - background_weight;
        if foreground_weight == 0 {
            break;
        }
        background_sum += level as f64 * *count as f64;
        let mean_bg = background_sum / background_weight as f64;
        let mean_fg = (weighted_sum - background_sum) / foreground_weight as f64;
        let variance =
            background_weight as f64 * foreground_weight as f64 * (mean_bg - mean_fg).powi(2);
        if variance > best.1 {
            best = (level as u8, variance);
        }
    }
    best.0
}

/// 3x3 median filter, edges replicated.
fn median3(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let mut window = [0u8; 9];
        let mut i = 0;
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let sx = (x as i64 + dx).clamp(0, width as i64 - 1) as u32;
                let sy = (y as i64 + dy).clamp(0, height as i64 - 1) as u32;
                window[i] = image.get_pixel(sx, sy).0[0];
                i += 1;
            }
        }
        window.sort_unstable();
        Luma([window[4]])
    })
}

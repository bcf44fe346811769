//! Pattern-match strategy: recognized text to vitals.
//!
//! Labelled readings (`HR 152`, `SpO2: 97`) are preferred; bare numbers in a
//! plausible band are the last resort for each vital.

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

use super::extractor::{Extraction, VitalsExtractor};
use super::truncate_chars;
use crate::frame::Frame;
use crate::vitals::{Mode, VitalKind, VitalRanges, VitalSet};

/// Confidence reported when at least two vitals were read.
pub const PATTERN_CONFIDENCE: f64 = 0.88;

/// Turns a frame into text, e.g. OCR.
pub trait TextRecognizer: Send {
    fn name(&self) -> &'static str;

    fn recognize(&mut self, frame: &Frame) -> Result<String>;
}

/// `pattern` strategy.
pub struct PatternExtractor {
    recognizer: Box<dyn TextRecognizer>,
    ranges: VitalRanges,
}

impl PatternExtractor {
    pub fn new(recognizer: Box<dyn TextRecognizer>, ranges: VitalRanges) -> Self {
        Self { recognizer, ranges }
    }
}

impl VitalsExtractor for PatternExtractor {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn mode(&self) -> Mode {
        Mode::Ocr
    }

    fn extract(&mut self, frame: &Frame) -> Result<Extraction> {
        let text = self.recognizer.recognize(frame)?;
        let values = parse_vitals_text(&text, &self.ranges);
        let confidence = if values.len() >= 2 {
            PATTERN_CONFIDENCE
        } else {
            0.0
        };
        log::debug!(
            "{}: {} vitals from {:?}",
            self.recognizer.name(),
            values.len(),
            truncate_chars(text.trim(), 50)
        );
        Ok(Extraction::new(values, confidence).with_raw(truncate_chars(text.trim(), 50)))
    }
}

/// Ordered patterns per vital, most specific first.
fn patterns() -> &'static [(VitalKind, Vec<Regex>)] {
    static PATTERNS: OnceLock<Vec<(VitalKind, Vec<Regex>)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |sources: &[&str]| -> Vec<Regex> {
            sources
                .iter()
                .map(|s| Regex::new(s).expect("static vitals regex"))
                .collect()
        };
        vec![
            (
                VitalKind::HeartRate,
                compile(&[
                    r"HR[:\s]*(\d{2,3})",
                    r"(?:HEART|PULSE)[:\s]*(\d{2,3})",
                    r"(\d{2,3})\s*BPM",
                    r"(?:^|\D)(1[0-8]\d)(?:\D|$)",
                ]),
            ),
            (
                VitalKind::Spo2,
                compile(&[
                    r"SPO2[:\s]*(\d{2,3})",
                    r"(?:SAT|O2)[:\s]*(\d{2,3})",
                    r"(\d{2,3})\s*%",
                    r"(?:^|\D)(9\d|100)(?:\D|$)",
                ]),
            ),
            (
                VitalKind::RespRate,
                compile(&[
                    r"RR[:\s]*(\d{1,3})",
                    r"RESP[:\s]*(\d{1,3})",
                    r"(?:^|\D)([3-7]\d)(?:\D|$)",
                ]),
            ),
            (
                VitalKind::Temperature,
                compile(&[
                    r"TEMP[:\s]*(\d{2}\.?\d?)",
                    r"(\d{2}\.\d)\s*°?C",
                    r"(3[5-8]\.\d)",
                ]),
            ),
        ]
    })
}

/// Parse recognized monitor text into range-checked vitals.
///
/// Per vital, patterns are tried in order and the first in-range capture
/// wins. Out-of-range captures are skipped, never clamped.
pub fn parse_vitals_text(text: &str, ranges: &VitalRanges) -> VitalSet {
    let normalized = text.to_uppercase().replace(['\n', '\r'], " ");
    let mut values = VitalSet::new();
    for (kind, regexes) in patterns() {
        let found = regexes.iter().find_map(|re| {
            re.captures_iter(&normalized)
                .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
                .find(|value| ranges.accepts(*kind, *value))
        });
        if let Some(value) = found {
            values.set(*kind, value);
        }
    }
    values
}

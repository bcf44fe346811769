use anyhow::Result;
use serde_json::{Map, Value};

use super::truncate_chars;
use crate::frame::Frame;
use crate::vitals::{sanitize_confidence, Mode, VitalSet};

/// Output of one extraction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extraction {
    /// Range-checked vital values.
    pub values: VitalSet,
    /// Trust in `values`, always within [0, 1].
    pub confidence: f64,
    /// Short excerpt of what the strategy saw (OCR text, model reply).
    pub raw: String,
    /// Extra metadata forwarded with the submission.
    pub extras: Map<String, Value>,
}

impl Extraction {
    pub fn new(values: VitalSet, confidence: f64) -> Self {
        Self {
            values,
            confidence: sanitize_confidence(confidence),
            raw: String::new(),
            extras: Map::new(),
        }
    }

    /// Nothing found, confidence 0.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }
}

/// Vitals extraction strategy.
///
/// Implementations turn a frame into zero or more vital values plus a
/// confidence. They must range-check every value they return; the sampling
/// loop re-checks anyway.
pub trait VitalsExtractor: Send {
    /// Strategy identifier.
    fn name(&self) -> &'static str;

    /// How readings derived from this strategy are labelled.
    fn mode(&self) -> Mode;

    /// Run extraction on a frame.
    ///
    /// Errors are allowed here; callers go through `extract_or_empty`.
    fn extract(&mut self, frame: &Frame) -> Result<Extraction>;

    /// Optional warm-up hook, run once before the first tick.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Run `extractor` and fail soft: any error becomes an empty extraction.
pub fn extract_or_empty(extractor: &mut dyn VitalsExtractor, frame: &Frame) -> Extraction {
    match extractor.extract(frame) {
        Ok(mut extraction) => {
            extraction.confidence = sanitize_confidence(extraction.confidence);
            extraction
        }
        Err(e) => {
            log::debug!("{} extraction failed: {:#}", extractor.name(), e);
            Extraction::empty().with_raw(truncate_chars(&format!("{:#}", e), 50))
        }
    }
}

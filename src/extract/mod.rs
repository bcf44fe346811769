//! Vitals extraction strategies.
//!
//! A strategy turns one frame into a `VitalSet` plus a confidence score:
//! - `mock`: simulated values, no frame inspection
//! - `pattern`: text recognition followed by per-vital regex matching
//! - `vlm`: a vision-language model asked for a JSON object
//!
//! Strategies are selected by configuration through `build_extractor`.

mod extractor;
pub mod ocr;
pub mod pattern;
pub mod simulate;
pub mod vlm;

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::vitals::VitalRanges;

pub use extractor::{extract_or_empty, Extraction, VitalsExtractor};
pub use ocr::{TesseractRecognizer, TesseractSettings};
pub use pattern::{parse_vitals_text, PatternExtractor, TextRecognizer};
pub use simulate::{MockExtractor, SimulationProfile, VitalsSimulator};
pub use vlm::{parse_vlm_response, OllamaClient, VlmExtractor, VlmSettings};

/// Configured extraction strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractorKind {
    Mock,
    Pattern,
    Vlm,
}

impl ExtractorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractorKind::Mock => "mock",
            ExtractorKind::Pattern => "pattern",
            ExtractorKind::Vlm => "vlm",
        }
    }
}

impl FromStr for ExtractorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" | "sim" | "simulate" => Ok(ExtractorKind::Mock),
            "pattern" | "ocr" => Ok(ExtractorKind::Pattern),
            "vlm" => Ok(ExtractorKind::Vlm),
            other => Err(anyhow!(
                "unknown extractor '{}'; expected mock, pattern or vlm",
                other
            )),
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to build any of the strategies.
#[derive(Clone, Debug)]
pub struct ExtractorSettings {
    pub kind: ExtractorKind,
    pub tesseract: TesseractSettings,
    pub vlm: VlmSettings,
    pub simulation: SimulationProfile,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            kind: ExtractorKind::Mock,
            tesseract: TesseractSettings::default(),
            vlm: VlmSettings::default(),
            simulation: SimulationProfile::default(),
        }
    }
}

/// Build the configured strategy. No external service is contacted here;
/// that happens in `VitalsExtractor::warm_up`.
pub fn build_extractor(
    settings: &ExtractorSettings,
    ranges: VitalRanges,
) -> Result<Box<dyn VitalsExtractor>> {
    let extractor: Box<dyn VitalsExtractor> = match settings.kind {
        ExtractorKind::Mock => Box::new(MockExtractor::new(VitalsSimulator::new(
            settings.simulation.clone(),
            ranges,
        ))),
        ExtractorKind::Pattern => Box::new(PatternExtractor::new(
            Box::new(TesseractRecognizer::new(settings.tesseract.clone())),
            ranges,
        )),
        ExtractorKind::Vlm => Box::new(VlmExtractor::new(
            OllamaClient::new(settings.vlm.clone())?,
            ranges,
        )),
    };
    log::debug!("extractor '{}' built", extractor.name());
    Ok(extractor)
}

/// First `max` characters of `s`, never splitting a character.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

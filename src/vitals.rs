//! Vital sign kinds, validation ranges and value sets.
//!
//! Every value that leaves an extractor is checked against the range for its
//! kind. Values outside the range are discarded, never clamped.

use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// One of the four vital signs the pipeline tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VitalKind {
    HeartRate,
    Spo2,
    RespRate,
    Temperature,
}

impl VitalKind {
    /// Fixed iteration order used for buffers, payloads and log rows.
    pub const ALL: [VitalKind; 4] = [
        VitalKind::HeartRate,
        VitalKind::Spo2,
        VitalKind::RespRate,
        VitalKind::Temperature,
    ];

    /// Key used on the ingestion wire and in model prompts.
    pub fn key(self) -> &'static str {
        match self {
            VitalKind::HeartRate => "hr",
            VitalKind::Spo2 => "spo2",
            VitalKind::RespRate => "rr",
            VitalKind::Temperature => "temp",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "hr" => Some(VitalKind::HeartRate),
            "spo2" => Some(VitalKind::Spo2),
            "rr" => Some(VitalKind::RespRate),
            "temp" => Some(VitalKind::Temperature),
            _ => None,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            VitalKind::HeartRate => "bpm",
            VitalKind::Spo2 => "%",
            VitalKind::RespRate => "/min",
            VitalKind::Temperature => "°C",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            VitalKind::HeartRate => 0,
            VitalKind::Spo2 => 1,
            VitalKind::RespRate => 2,
            VitalKind::Temperature => 3,
        }
    }
}

impl fmt::Display for VitalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Inclusive validation range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VitalRange {
    pub min: f64,
    pub max: f64,
}

impl VitalRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// Validation ranges for every vital kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VitalRanges {
    ranges: [VitalRange; 4],
}

impl VitalRanges {
    /// Neonatal defaults.
    pub const NEONATAL: VitalRanges = VitalRanges {
        ranges: [
            VitalRange::new(80.0, 200.0),
            VitalRange::new(85.0, 100.0),
            VitalRange::new(20.0, 80.0),
            VitalRange::new(35.0, 39.0),
        ],
    };

    pub fn get(&self, kind: VitalKind) -> VitalRange {
        self.ranges[kind.index()]
    }

    pub fn set(&mut self, kind: VitalKind, range: VitalRange) {
        self.ranges[kind.index()] = range;
    }

    pub fn accepts(&self, kind: VitalKind, value: f64) -> bool {
        self.get(kind).contains(value)
    }

    /// Drop every value that falls outside its range. Returns how many were dropped.
    pub fn retain_valid(&self, set: &mut VitalSet) -> usize {
        let mut dropped = 0;
        for kind in VitalKind::ALL {
            if let Some(value) = set.get(kind) {
                if !self.accepts(kind, value) {
                    set.remove(kind);
                    dropped += 1;
                }
            }
        }
        dropped
    }

    pub fn validate(&self) -> Result<()> {
        for kind in VitalKind::ALL {
            let range = self.get(kind);
            if !(range.min.is_finite() && range.max.is_finite()) || range.min >= range.max {
                return Err(anyhow!(
                    "range for {} must satisfy min < max (got {}..{})",
                    kind,
                    range.min,
                    range.max
                ));
            }
        }
        Ok(())
    }
}

impl Default for VitalRanges {
    fn default() -> Self {
        Self::NEONATAL
    }
}

/// At most one value per vital kind. Missing kinds are absent, never zero.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VitalSet {
    values: [Option<f64>; 4],
}

impl VitalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: VitalKind) -> Option<f64> {
        self.values[kind.index()]
    }

    pub fn set(&mut self, kind: VitalKind, value: f64) {
        self.values[kind.index()] = Some(value);
    }

    pub fn remove(&mut self, kind: VitalKind) -> Option<f64> {
        self.values[kind.index()].take()
    }

    /// Store `value` only when `ranges` accepts it.
    pub fn insert_checked(&mut self, kind: VitalKind, value: f64, ranges: &VitalRanges) -> bool {
        if ranges.accepts(kind, value) {
            self.set(kind, value);
            true
        } else {
            false
        }
    }

    pub fn with(mut self, kind: VitalKind, value: f64) -> Self {
        self.set(kind, value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (VitalKind, f64)> + '_ {
        VitalKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|value| (kind, value)))
    }
}

/// Reading provenance reported in submission metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Ocr,
    Vlm,
    Sim,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Ocr => "OCR",
            Mode::Vlm => "VLM",
            Mode::Sim => "SIM",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Force a confidence score into [0, 1]. NaN becomes 0.
pub fn sanitize_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

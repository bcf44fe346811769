//! Simulated vitals.
//!
//! Used as the `mock` strategy and as the fallback whenever no frame is
//! available or an extraction misses quorum.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::extractor::{Extraction, VitalsExtractor};
use crate::frame::Frame;
use crate::vitals::{Mode, VitalKind, VitalRanges, VitalSet};

/// Baselines and jitter for simulated neonatal vitals.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationProfile {
    pub heart_rate: f64,
    pub spo2: f64,
    pub resp_rate: f64,
    pub temperature: f64,
    /// +/- integer jitter in bpm.
    pub heart_rate_jitter: i32,
    /// Asymmetric integer jitter in %, as (below, above).
    pub spo2_jitter: (i32, i32),
    /// Simulated SpO2 never leaves this band.
    pub spo2_bounds: (f64, f64),
    pub resp_rate_jitter: i32,
    /// +/- jitter in °C, rounded to one decimal.
    pub temperature_jitter: f64,
    /// Confidence is drawn from [base, base + spread).
    pub confidence_base: f64,
    pub confidence_spread: f64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            heart_rate: 140.0,
            spo2: 96.0,
            resp_rate: 45.0,
            temperature: 36.8,
            heart_rate_jitter: 15,
            spo2_jitter: (4, 3),
            spo2_bounds: (88.0, 100.0),
            resp_rate_jitter: 8,
            temperature_jitter: 0.4,
            confidence_base: 0.87,
            confidence_spread: 0.10,
        }
    }
}

/// Random-walk-free generator of plausible vitals around a baseline.
pub struct VitalsSimulator {
    profile: SimulationProfile,
    ranges: VitalRanges,
    rng: StdRng,
}

impl VitalsSimulator {
    pub fn new(profile: SimulationProfile, ranges: VitalRanges) -> Self {
        Self::with_rng(profile, ranges, StdRng::from_entropy())
    }

    /// Deterministic generator for tests and replays.
    pub fn seeded(profile: SimulationProfile, ranges: VitalRanges, seed: u64) -> Self {
        Self::with_rng(profile, ranges, StdRng::seed_from_u64(seed))
    }

    fn with_rng(profile: SimulationProfile, ranges: VitalRanges, rng: StdRng) -> Self {
        Self {
            profile,
            ranges,
            rng,
        }
    }

    pub fn profile(&self) -> &SimulationProfile {
        &self.profile
    }

    /// Draw one simulated reading. Values outside the configured ranges are dropped.
    pub fn next_reading(&mut self) -> Extraction {
        let p = &self.profile;
        let hr = p.heart_rate + jitter(&mut self.rng, p.heart_rate_jitter, p.heart_rate_jitter);
        let spo2 = (p.spo2 + jitter(&mut self.rng, p.spo2_jitter.0, p.spo2_jitter.1))
            .clamp(p.spo2_bounds.0, p.spo2_bounds.1);
        let rr = p.resp_rate + jitter(&mut self.rng, p.resp_rate_jitter, p.resp_rate_jitter);
        let temp_offset = if p.temperature_jitter > 0.0 {
            self.rng
                .gen_range(-p.temperature_jitter..=p.temperature_jitter)
        } else {
            0.0
        };
        let temp = ((p.temperature + temp_offset) * 10.0).round() / 10.0;
        let confidence = p.confidence_base
            + if p.confidence_spread > 0.0 {
                self.rng.gen_range(0.0..p.confidence_spread)
            } else {
                0.0
            };

        let mut values = VitalSet::new();
        values.insert_checked(VitalKind::HeartRate, hr, &self.ranges);
        values.insert_checked(VitalKind::Spo2, spo2, &self.ranges);
        values.insert_checked(VitalKind::RespRate, rr, &self.ranges);
        values.insert_checked(VitalKind::Temperature, temp, &self.ranges);
        Extraction::new(values, confidence).with_raw("simulated")
    }
}

fn jitter(rng: &mut StdRng, below: i32, above: i32) -> f64 {
    rng.gen_range(-below..=above) as f64
}

/// `mock` strategy: ignores the frame and reports simulated vitals.
pub struct MockExtractor {
    simulator: VitalsSimulator,
}

impl MockExtractor {
    pub fn new(simulator: VitalsSimulator) -> Self {
        Self { simulator }
    }
}

impl VitalsExtractor for MockExtractor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn mode(&self) -> Mode {
        Mode::Sim
    }

    fn extract(&mut self, _frame: &Frame) -> Result<Extraction> {
        Ok(self.simulator.next_reading())
    }
}

//! Per-kind median smoothing.
//!
//! Each vital kind has its own bounded buffer of recent raw values. Until
//! `min_samples` values are buffered the latest raw value passes through
//! unchanged; after that the output is the median of the buffer.

use std::collections::VecDeque;

use crate::vitals::{VitalKind, VitalSet};

pub const DEFAULT_WINDOW: usize = 5;
pub const DEFAULT_MIN_SAMPLES: usize = 3;

/// Rolling median filter, one buffer per vital kind.
///
/// Owned by exactly one sampling loop. Buffers never mix kinds.
#[derive(Clone, Debug)]
pub struct TemporalSmoother {
    window: usize,
    min_samples: usize,
    history: [VecDeque<f64>; 4],
}

impl TemporalSmoother {
    pub fn new(window: usize, min_samples: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            min_samples: min_samples.clamp(1, window),
            history: std::array::from_fn(|_| VecDeque::with_capacity(window)),
        }
    }

    /// Buffer `value` for `kind` and return the smoothed output.
    pub fn push(&mut self, kind: VitalKind, value: f64) -> f64 {
        let buffer = &mut self.history[kind.index()];
        if buffer.len() == self.window {
            buffer.pop_front();
        }
        buffer.push_back(value);

        if buffer.len() < self.min_samples {
            return value;
        }
        let mut sorted: Vec<f64> = buffer.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted[sorted.len() / 2]
    }

    /// Smooth every value present in `set`; absent kinds stay absent.
    pub fn smooth(&mut self, set: &VitalSet) -> VitalSet {
        let mut out = VitalSet::new();
        for (kind, value) in set.iter() {
            out.set(kind, self.push(kind, value));
        }
        out
    }

    pub fn buffered(&self, kind: VitalKind) -> usize {
        self.history[kind.index()].len()
    }

    pub fn reset(&mut self) {
        for buffer in &mut self.history {
            buffer.clear();
        }
    }
}

impl Default for TemporalSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MIN_SAMPLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vitals::VitalRanges;

    #[test]
    fn passes_raw_values_through_below_threshold() {
        let mut smoother = TemporalSmoother::default();
        assert_eq!(smoother.push(VitalKind::HeartRate, 150.0), 150.0);
        assert_eq!(smoother.push(VitalKind::HeartRate, 190.0), 190.0);
    }

    #[test]
    fn takes_median_once_threshold_reached() {
        let mut smoother = TemporalSmoother::default();
        smoother.push(VitalKind::HeartRate, 150.0);
        smoother.push(VitalKind::HeartRate, 190.0);
        assert_eq!(smoother.push(VitalKind::HeartRate, 120.0), 150.0);
    }

    #[test]
    fn evicts_oldest_sample_when_full() {
        let mut smoother = TemporalSmoother::default();
        for value in [100.0, 101.0, 102.0, 103.0, 104.0, 200.0, 200.0] {
            smoother.push(VitalKind::HeartRate, value);
        }
        assert_eq!(smoother.buffered(VitalKind::HeartRate), 5);
        // buffer is now [102, 103, 104, 200, 200]
        assert_eq!(smoother.push(VitalKind::HeartRate, 200.0), 200.0);
    }

    #[test]
    fn kinds_do_not_share_buffers() {
        let mut smoother = TemporalSmoother::default();
        for _ in 0..4 {
            smoother.push(VitalKind::HeartRate, 140.0);
        }
        assert_eq!(smoother.buffered(VitalKind::Spo2), 0);
        assert_eq!(smoother.push(VitalKind::Spo2, 97.0), 97.0);
    }

    #[test]
    fn out_of_range_sample_is_dropped_before_smoothing() {
        let ranges = VitalRanges::default();
        let mut smoother = TemporalSmoother::default();
        let mut outputs = Vec::new();
        for raw in [150.0, 152.0, 300.0, 148.0, 151.0] {
            let mut set = VitalSet::new().with(VitalKind::HeartRate, raw);
            ranges.retain_valid(&mut set);
            if let Some(value) = smoother.smooth(&set).get(VitalKind::HeartRate) {
                outputs.push(value);
            }
        }
        assert_eq!(outputs.len(), 4);
        assert_eq!(smoother.buffered(VitalKind::HeartRate), 4);
        let settled = *outputs.last().unwrap();
        assert!((148.0..=152.0).contains(&settled));
        assert!(outputs.iter().all(|v| *v != 300.0));
    }

    #[test]
    fn smooth_keeps_absent_kinds_absent() {
        let mut smoother = TemporalSmoother::default();
        let out = smoother.smooth(&VitalSet::new().with(VitalKind::Temperature, 36.9));
        assert_eq!(out.len(), 1);
        assert_eq!(out.get(VitalKind::HeartRate), None);
    }
}

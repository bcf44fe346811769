use std::collections::VecDeque;

/// Latency samples kept for percentile reporting.
const LATENCY_WINDOW: usize = 100;

/// p95 is only reported once this many samples exist; before that, the max.
const P95_MIN_SAMPLES: usize = 20;

/// Snapshot of a source's read statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamStats {
    pub url: String,
    pub frames: u64,
    pub drops: u64,
    /// Dropped reads as a percentage of all reads.
    pub drop_rate: f64,
    pub latency_avg_ms: f64,
    pub latency_max_ms: f64,
    pub latency_p95_ms: f64,
}

/// Rolling read statistics kept by a source.
#[derive(Clone, Debug, Default)]
pub struct StreamStatsWindow {
    frames: u64,
    drops: u64,
    latencies: VecDeque<f64>,
}

impl StreamStatsWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self, latency_ms: f64) {
        self.frames += 1;
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
    }

    pub fn record_drop(&mut self) {
        self.drops += 1;
    }

    pub fn last_latency_ms(&self) -> Option<f64> {
        self.latencies.back().copied()
    }

    pub fn snapshot(&self, url: &str) -> StreamStats {
        let reads = (self.frames + self.drops).max(1);
        let mut stats = StreamStats {
            url: url.to_string(),
            frames: self.frames,
            drops: self.drops,
            drop_rate: self.drops as f64 / reads as f64 * 100.0,
            ..StreamStats::default()
        };
        if self.latencies.is_empty() {
            return stats;
        }

        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let max = sorted[sorted.len() - 1];
        stats.latency_avg_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        stats.latency_max_ms = max;
        stats.latency_p95_ms = if sorted.len() >= P95_MIN_SAMPLES {
            sorted[(sorted.len() as f64 * 0.95) as usize]
        } else {
            max
        };
        stats
    }
}

//! Sampling loop.
//!
//! One `SamplingLoop` owns a frame source, an extraction strategy, a
//! simulator, a smoother and a sink, and drives them once per tick:
//!
//! 1. reconnect if the link is down
//! 2. read a frame and extract vitals from it
//! 3. below quorum (or without a frame) substitute a simulated reading
//! 4. smooth, submit, log one table row, sleep
//!
//! The loop never propagates per-tick failures. Only extractor warm-up and an
//! exhausted fail-fast reconnect budget end a run early.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};

use crate::extract::{extract_or_empty, VitalsExtractor, VitalsSimulator};
use crate::frame::Frame;
use crate::ingest::{FrameSource, StreamStats};
use crate::smooth::TemporalSmoother;
use crate::submit::{IngestPayload, VitalsSink};
use crate::vitals::{Mode, VitalKind, VitalRanges, VitalSet};

/// Connection state of the frame source as seen by the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect budget exhausted. Terminal for the run.
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happens once the reconnect budget is spent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the loop; the process exits non-zero.
    FailFast,
    /// Keep submitting simulated readings for the rest of the run.
    #[default]
    DegradeToSimulation,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::FailFast => "fail-fast",
            FailurePolicy::DegradeToSimulation => "degrade-to-simulation",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fail-fast" => Ok(FailurePolicy::FailFast),
            "degrade-to-simulation" | "degrade" => Ok(FailurePolicy::DegradeToSimulation),
            other => Err(anyhow!(
                "unknown failure policy '{}'; expected fail-fast or degrade-to-simulation",
                other
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    TickLimit,
    /// Fail-fast policy and the source could not be reached.
    SourceFailed,
}

/// Per-camera loop settings.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub camera_id: String,
    pub patient_id: u64,
    /// Reported as `metadata.source`.
    pub source_label: String,
    pub sample_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// How long a connected source may go without a frame.
    pub frame_grace: Duration,
    /// Minimum vitals for an extraction to be used.
    pub quorum: usize,
    pub failure_policy: FailurePolicy,
    pub ranges: VitalRanges,
    /// Log a stats line every this many submissions.
    pub stats_every: u64,
    pub max_ticks: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            camera_id: "camera-001".to_string(),
            patient_id: 1,
            source_label: "vitals-connector".to_string(),
            sample_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
            frame_grace: Duration::from_secs(5),
            quorum: 2,
            failure_policy: FailurePolicy::default(),
            ranges: VitalRanges::default(),
            stats_every: 30,
            max_ticks: None,
        }
    }
}

/// Result of one submission attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    Accepted(Option<Value>),
    Rejected(String),
    /// The payload never reached the receiver.
    Failed(String),
    /// Nothing was sent (no valid vitals at all).
    Skipped(String),
}

/// What happened in one tick.
#[derive(Clone, Debug)]
pub struct TickReport {
    pub tick: u64,
    /// Link state at the end of the tick.
    pub state: LinkState,
    pub mode: Mode,
    /// Smoothed values as submitted.
    pub values: VitalSet,
    pub confidence: f64,
    pub frame_read: bool,
    pub latency_ms: Option<f64>,
    pub outcome: SubmitOutcome,
}

/// Totals for a finished run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub camera_id: String,
    pub ticks: u64,
    pub sent: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
    /// Ticks whose reading came from a frame rather than simulation.
    pub extracted: u64,
    pub stop: StopReason,
    pub final_state: LinkState,
    pub stream: StreamStats,
}

pub struct SamplingLoop {
    settings: PipelineSettings,
    source: Box<dyn FrameSource>,
    extractor: Box<dyn VitalsExtractor>,
    simulator: VitalsSimulator,
    smoother: TemporalSmoother,
    sink: Box<dyn VitalsSink>,
    state: LinkState,
    failed_attempts: u32,
    last_frame_at: Option<Instant>,
    ticks: u64,
    sent: u64,
    accepted: u64,
    rejected: u64,
    failed: u64,
    extracted: u64,
}

impl SamplingLoop {
    pub fn new(
        settings: PipelineSettings,
        source: Box<dyn FrameSource>,
        extractor: Box<dyn VitalsExtractor>,
        simulator: VitalsSimulator,
        smoother: TemporalSmoother,
        sink: Box<dyn VitalsSink>,
    ) -> Self {
        Self {
            settings,
            source,
            extractor,
            simulator,
            smoother,
            sink,
            state: LinkState::Disconnected,
            failed_attempts: 0,
            last_frame_at: None,
            ticks: 0,
            sent: 0,
            accepted: 0,
            rejected: 0,
            failed: 0,
            extracted: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run until shutdown, the tick limit, or a fail-fast source failure.
    ///
    /// The source is released on every exit path. `Err` only for a failed
    /// extractor warm-up.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<RunSummary> {
        let result = self.run_until_stopped(shutdown);
        self.source.release();
        if self.state == LinkState::Connected {
            self.state = LinkState::Disconnected;
        }
        let stop = result?;
        let summary = self.summary(stop);
        log::info!(
            "[{}] stopped ({:?}): {} ticks, {} sent ({} accepted, {} rejected, {} failed), {} extracted",
            summary.camera_id,
            summary.stop,
            summary.ticks,
            summary.sent,
            summary.accepted,
            summary.rejected,
            summary.failed,
            summary.extracted
        );
        if summary.stream.frames > 0 {
            log::info!(
                "[{}] stream: {} frames, {:.1}% drops, avg latency {:.1}ms",
                summary.camera_id,
                summary.stream.frames,
                summary.stream.drop_rate,
                summary.stream.latency_avg_ms
            );
        }
        Ok(summary)
    }

    fn run_until_stopped(&mut self, shutdown: &AtomicBool) -> Result<StopReason> {
        self.extractor.warm_up().with_context(|| {
            format!(
                "[{}] {} extractor warm-up failed",
                self.settings.camera_id,
                self.extractor.name()
            )
        })?;

        log::info!(
            "[{}] sampling {} every {:?} with {} extractor (policy: {})",
            self.settings.camera_id,
            self.source.describe(),
            self.settings.sample_interval,
            self.extractor.name(),
            self.settings.failure_policy
        );
        if let Some(stop) = self.connect_with_retries(shutdown) {
            return Ok(stop);
        }
        log::info!(
            "[{}] {:<4} {:<5} {:<5} {:<4} {:<6} {:<5} {:<6} Result",
            self.settings.camera_id,
            "Mode",
            "HR",
            "SpO2",
            "RR",
            "Temp",
            "Conf",
            "Lat"
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(StopReason::Shutdown);
            }
            if let Some(max) = self.settings.max_ticks {
                if self.ticks >= max {
                    return Ok(StopReason::TickLimit);
                }
            }

            let report = self.tick();
            if self.source_failed() {
                return Ok(StopReason::SourceFailed);
            }
            self.log_row(&report);
            if self.settings.stats_every > 0
                && self.sent > 0
                && self.sent % self.settings.stats_every == 0
                && !matches!(report.outcome, SubmitOutcome::Skipped(_))
            {
                self.log_stats();
            }

            interruptible_sleep(self.settings.sample_interval, shutdown);
        }
    }

    /// Initial connection: up to `max_reconnect_attempts` tries.
    fn connect_with_retries(&mut self, shutdown: &AtomicBool) -> Option<StopReason> {
        let max = self.settings.max_reconnect_attempts.max(1);
        for attempt in 1..=max {
            if shutdown.load(Ordering::SeqCst) {
                return Some(StopReason::Shutdown);
            }
            if self.try_connect() {
                return None;
            }
            if attempt < max {
                interruptible_sleep(self.settings.reconnect_delay, shutdown);
            }
        }
        self.exhaust_reconnects();
        if self.source_failed() {
            Some(StopReason::SourceFailed)
        } else {
            None
        }
    }

    fn try_connect(&mut self) -> bool {
        self.state = LinkState::Connecting;
        match self.source.connect() {
            Ok(()) => {
                self.state = LinkState::Connected;
                self.failed_attempts = 0;
                self.last_frame_at = Some(Instant::now());
                log::info!(
                    "[{}] connected to {}",
                    self.settings.camera_id,
                    self.source.describe()
                );
                true
            }
            Err(e) => {
                self.state = LinkState::Disconnected;
                self.failed_attempts += 1;
                log::warn!(
                    "[{}] connection failed, retry {}/{}: {:#}",
                    self.settings.camera_id,
                    self.failed_attempts,
                    self.settings.max_reconnect_attempts,
                    e
                );
                false
            }
        }
    }

    fn exhaust_reconnects(&mut self) {
        self.state = LinkState::Failed;
        self.source.release();
        match self.settings.failure_policy {
            FailurePolicy::FailFast => log::error!(
                "[{}] source {} unreachable after {} attempts; stopping",
                self.settings.camera_id,
                self.source.describe(),
                self.failed_attempts
            ),
            FailurePolicy::DegradeToSimulation => log::warn!(
                "[{}] source {} unreachable after {} attempts; running in simulation-only mode",
                self.settings.camera_id,
                self.source.describe(),
                self.failed_attempts
            ),
        }
    }

    fn source_failed(&self) -> bool {
        self.state == LinkState::Failed && self.settings.failure_policy == FailurePolicy::FailFast
    }

    /// Run one tick without sleeping.
    pub fn tick(&mut self) -> TickReport {
        self.ticks += 1;

        if self.state == LinkState::Disconnected
            && !self.try_connect()
            && self.failed_attempts >= self.settings.max_reconnect_attempts
        {
            self.exhaust_reconnects();
        }

        if self.source_failed() {
            return TickReport {
                tick: self.ticks,
                state: self.state,
                mode: Mode::Sim,
                values: VitalSet::new(),
                confidence: 0.0,
                frame_read: false,
                latency_ms: None,
                outcome: SubmitOutcome::Skipped("source failed".to_string()),
            };
        }

        let (frame, latency_ms) = self.read_frame();
        let frame_read = frame.is_some();

        let started = Instant::now();
        let used = frame
            .as_ref()
            .and_then(|frame| self.extract_with_quorum(frame));
        if used.is_some() {
            self.extracted += 1;
        }
        let (mode, values, confidence, extras) = match used {
            Some(reading) => reading,
            None => {
                let reading = self.simulator.next_reading();
                (Mode::Sim, reading.values, reading.confidence, Map::new())
            }
        };
        let inference_time = started.elapsed();
        let smoothed = self.smoother.smooth(&values);

        let mut metadata = Map::new();
        metadata.insert(
            "source".to_string(),
            Value::from(self.settings.source_label.clone()),
        );
        metadata.insert("mode".to_string(), Value::from(mode.as_str()));
        if self.state == LinkState::Connected {
            let stats = self.source.stats();
            metadata.insert(
                "latency_ms".to_string(),
                Value::from(round_to(latency_ms.unwrap_or(0.0), 1)),
            );
            metadata.insert(
                "drop_rate".to_string(),
                Value::from(round_to(stats.drop_rate, 2)),
            );
        }
        metadata.extend(extras);

        let outcome = self.submit(&smoothed, confidence, inference_time, metadata);

        TickReport {
            tick: self.ticks,
            state: self.state,
            mode,
            values: smoothed,
            confidence,
            frame_read,
            latency_ms,
            outcome,
        }
    }

    /// Read a frame when connected. Releases the source once the grace
    /// period passes without a frame.
    fn read_frame(&mut self) -> (Option<Frame>, Option<f64>) {
        if self.state != LinkState::Connected {
            return (None, None);
        }
        let started = Instant::now();
        match self.source.next_frame() {
            Some(frame) => {
                self.last_frame_at = Some(Instant::now());
                (Some(frame), Some(started.elapsed().as_secs_f64() * 1000.0))
            }
            None => {
                let stale = self
                    .last_frame_at
                    .map(|at| at.elapsed() >= self.settings.frame_grace)
                    .unwrap_or(true);
                if stale || !self.source.is_connected() {
                    log::warn!(
                        "[{}] stream timeout, reconnecting on next tick",
                        self.settings.camera_id
                    );
                    self.source.release();
                    self.state = LinkState::Disconnected;
                }
                (None, None)
            }
        }
    }

    /// Extract and re-validate; `None` below quorum.
    fn extract_with_quorum(
        &mut self,
        frame: &Frame,
    ) -> Option<(Mode, VitalSet, f64, Map<String, Value>)> {
        let extraction = extract_or_empty(self.extractor.as_mut(), frame);
        let mut values = extraction.values;
        let dropped = self.settings.ranges.retain_valid(&mut values);
        if dropped > 0 {
            log::debug!(
                "[{}] discarded {} out-of-range values from {}",
                self.settings.camera_id,
                dropped,
                self.extractor.name()
            );
        }
        if values.len() < self.settings.quorum {
            log::debug!(
                "[{}] {} found {} vitals (quorum {}), using simulation",
                self.settings.camera_id,
                self.extractor.name(),
                values.len(),
                self.settings.quorum
            );
            return None;
        }
        Some((
            self.extractor.mode(),
            values,
            extraction.confidence,
            extraction.extras,
        ))
    }

    fn submit(
        &mut self,
        values: &VitalSet,
        confidence: f64,
        inference_time: Duration,
        metadata: Map<String, Value>,
    ) -> SubmitOutcome {
        let payload = match IngestPayload::new(
            self.settings.patient_id,
            &self.settings.camera_id,
            values,
            confidence,
            inference_time,
            chrono::Utc::now(),
            metadata,
        ) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("[{}] {:#}", self.settings.camera_id, e);
                return SubmitOutcome::Skipped(format!("{:#}", e));
            }
        };

        self.sent += 1;
        match self.sink.submit(&payload) {
            Ok(ack) => match ack.reason() {
                None => {
                    self.accepted += 1;
                    SubmitOutcome::Accepted(ack.vital_id)
                }
                Some(reason) => {
                    self.rejected += 1;
                    SubmitOutcome::Rejected(reason.to_string())
                }
            },
            Err(e) => {
                self.failed += 1;
                log::warn!(
                    "[{}] submit via {} failed: {:#}",
                    self.settings.camera_id,
                    self.sink.name(),
                    e
                );
                SubmitOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    fn log_row(&self, report: &TickReport) {
        let cell = |kind: VitalKind| match report.values.get(kind) {
            Some(v) if kind == VitalKind::Temperature => format!("{:.1}", v),
            Some(v) => format!("{}", v.trunc() as i64),
            None => "-".to_string(),
        };
        let latency = report
            .latency_ms
            .map(|ms| format!("{:.0}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let result = match &report.outcome {
            SubmitOutcome::Accepted(Some(id)) => format!("ok #{}", id),
            SubmitOutcome::Accepted(None) => "ok".to_string(),
            SubmitOutcome::Rejected(reason) | SubmitOutcome::Failed(reason) => {
                format!("err {}", reason.chars().take(15).collect::<String>())
            }
            SubmitOutcome::Skipped(reason) => format!("skip {}", reason),
        };
        log::info!(
            "[{}] {:<4} {:<5} {:<5} {:<4} {:<6} {:<5.2} {:<6} {}",
            self.settings.camera_id,
            report.mode.as_str(),
            cell(VitalKind::HeartRate),
            cell(VitalKind::Spo2),
            cell(VitalKind::RespRate),
            cell(VitalKind::Temperature),
            report.confidence,
            latency,
            result
        );
    }

    fn log_stats(&self) {
        let stats = self.source.stats();
        let extraction_rate = self.extracted as f64 / self.ticks.max(1) as f64 * 100.0;
        log::info!(
            "[{}] --- stats: {} sent | extracted: {:.0}% | drops: {:.1}% | p95 lat: {:.0}ms ---",
            self.settings.camera_id,
            self.sent,
            extraction_rate,
            stats.drop_rate,
            stats.latency_p95_ms
        );
    }

    fn summary(&self, stop: StopReason) -> RunSummary {
        RunSummary {
            camera_id: self.settings.camera_id.clone(),
            ticks: self.ticks,
            sent: self.sent,
            accepted: self.accepted,
            rejected: self.rejected,
            failed: self.failed,
            extracted: self.extracted,
            stop,
            final_state: self.state,
            stream: self.source.stats(),
        }
    }
}

/// Sleep in short slices so a shutdown request is noticed promptly.
fn interruptible_sleep(duration: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_policy_parses_both_spellings() -> Result<()> {
        assert_eq!(
            "fail-fast".parse::<FailurePolicy>()?,
            FailurePolicy::FailFast
        );
        assert_eq!(
            "DEGRADE_TO_SIMULATION".parse::<FailurePolicy>()?,
            FailurePolicy::DegradeToSimulation
        );
        assert!("retry-forever".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::default(), FailurePolicy::DegradeToSimulation);
        Ok(())
    }

    #[test]
    fn sleep_returns_immediately_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        let started = Instant::now();
        interruptible_sleep(Duration::from_secs(10), &shutdown);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn rounding_helper() {
        assert_eq!(round_to(12.345, 1), 12.3);
        assert_eq!(round_to(0.126, 2), 0.13);
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;

use vitals_connector::extract::SimulationProfile;
use vitals_connector::ingest::StreamStatsWindow;
use vitals_connector::{
    Extraction, FailurePolicy, Frame, FrameSource, IngestAck, IngestPayload, LinkState, Mode,
    PipelineSettings, SamplingLoop, StopReason, StreamStats, SubmitOutcome, TemporalSmoother,
    VitalKind, VitalRanges, VitalSet, VitalsExtractor, VitalsSimulator, VitalsSink,
};

#[derive(Clone, Default)]
struct Counters {
    connects: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

/// Source whose connect results and frame availability are scripted.
struct ScriptedSource {
    connect_results: VecDeque<bool>,
    connect_default: bool,
    frames: VecDeque<bool>,
    connected: bool,
    /// A missing frame also drops the link, as a dead socket would.
    drop_link_on_miss: bool,
    sequence: u64,
    stats: StreamStatsWindow,
    counters: Counters,
}

impl ScriptedSource {
    fn new(connect_results: &[bool], connect_default: bool, frames: &[bool], counters: Counters) -> Self {
        Self {
            connect_results: connect_results.iter().copied().collect(),
            connect_default,
            frames: frames.iter().copied().collect(),
            connected: false,
            drop_link_on_miss: false,
            sequence: 0,
            stats: StreamStatsWindow::new(),
            counters,
        }
    }

    fn offline(counters: Counters) -> Self {
        Self::new(&[], false, &[], counters)
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted://bed".to_string()
    }

    fn connect(&mut self) -> Result<()> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let ok = self
            .connect_results
            .pop_front()
            .unwrap_or(self.connect_default);
        self.connected = ok;
        if ok {
            Ok(())
        } else {
            Err(anyhow!("camera offline"))
        }
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if !self.connected {
            self.stats.record_drop();
            return None;
        }
        if self.frames.pop_front().unwrap_or(false) {
            self.sequence += 1;
            self.stats.record_frame(3.0);
            Frame::from_rgb(vec![0; 12], 2, 2, self.sequence).ok()
        } else {
            self.stats.record_drop();
            if self.drop_link_on_miss {
                self.connected = false;
            }
            None
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn release(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
    }

    fn stats(&self) -> StreamStats {
        self.stats.snapshot("scripted://bed")
    }
}

/// Extractor that replays a list of readings, repeating the last one.
struct ReplayExtractor {
    readings: VecDeque<VitalSet>,
    last: VitalSet,
    fail_warm_up: bool,
}

impl ReplayExtractor {
    fn repeating(values: VitalSet) -> Self {
        Self {
            readings: VecDeque::new(),
            last: values,
            fail_warm_up: false,
        }
    }

    fn sequence(readings: Vec<VitalSet>) -> Self {
        Self {
            readings: readings.into(),
            last: VitalSet::new(),
            fail_warm_up: false,
        }
    }
}

impl VitalsExtractor for ReplayExtractor {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn mode(&self) -> Mode {
        Mode::Ocr
    }

    fn extract(&mut self, _frame: &Frame) -> Result<Extraction> {
        if let Some(next) = self.readings.pop_front() {
            self.last = next;
        }
        Ok(Extraction::new(self.last, 0.88))
    }

    fn warm_up(&mut self) -> Result<()> {
        if self.fail_warm_up {
            Err(anyhow!("model not loaded"))
        } else {
            Ok(())
        }
    }
}

/// Sink that records every payload.
#[derive(Clone, Default)]
struct RecordingSink {
    payloads: Arc<Mutex<Vec<IngestPayload>>>,
    fail: bool,
}

impl RecordingSink {
    fn payloads(&self) -> Vec<IngestPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

impl VitalsSink for RecordingSink {
    fn name(&self) -> String {
        "recording".to_string()
    }

    fn submit(&mut self, payload: &IngestPayload) -> Result<IngestAck> {
        if self.fail {
            return Err(anyhow!("connection refused"));
        }
        let mut payloads = self.payloads.lock().unwrap();
        payloads.push(payload.clone());
        Ok(IngestAck::accepted(Some(Value::from(payloads.len()))))
    }
}

fn full_reading() -> VitalSet {
    VitalSet::new()
        .with(VitalKind::HeartRate, 150.0)
        .with(VitalKind::Spo2, 97.0)
        .with(VitalKind::RespRate, 45.0)
}

fn settings(policy: FailurePolicy, attempts: u32, ticks: u64) -> PipelineSettings {
    PipelineSettings {
        sample_interval: Duration::ZERO,
        reconnect_delay: Duration::ZERO,
        frame_grace: Duration::ZERO,
        max_reconnect_attempts: attempts,
        failure_policy: policy,
        max_ticks: Some(ticks),
        ..PipelineSettings::default()
    }
}

fn build(
    settings: PipelineSettings,
    source: ScriptedSource,
    extractor: ReplayExtractor,
    sink: RecordingSink,
) -> SamplingLoop {
    SamplingLoop::new(
        settings,
        Box::new(source),
        Box::new(extractor),
        VitalsSimulator::seeded(SimulationProfile::default(), VitalRanges::default(), 7),
        TemporalSmoother::default(),
        Box::new(sink),
    )
}

fn modes(payloads: &[IngestPayload]) -> Vec<String> {
    payloads
        .iter()
        .map(|p| p.metadata["mode"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn disconnected_camera_submits_thirty_simulated_readings() -> Result<()> {
    let counters = Counters::default();
    let sink = RecordingSink::default();
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 2, 30),
        ScriptedSource::offline(counters.clone()),
        ReplayExtractor::repeating(full_reading()),
        sink.clone(),
    );

    let summary = sampling.run(&AtomicBool::new(false))?;

    assert_eq!(summary.stop, StopReason::TickLimit);
    assert_eq!(summary.final_state, LinkState::Failed);
    assert_eq!(summary.ticks, 30);
    assert_eq!(summary.sent, 30);
    assert_eq!(summary.accepted, 30);
    assert_eq!(summary.extracted, 0);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    assert!(counters.releases.load(Ordering::SeqCst) >= 1);

    let payloads = sink.payloads();
    assert_eq!(payloads.len(), 30);
    for payload in &payloads {
        assert_eq!(payload.metadata["mode"], "SIM");
        assert!(payload.metadata.get("latency_ms").is_none());
        let hr = payload.vitals.hr.expect("simulated hr");
        assert!((125..=155).contains(&hr), "hr {} far from baseline", hr);
        assert!((0.0..=1.0).contains(&payload.confidence));
        assert!(!serde_json::to_string(payload)?.contains("null"));
    }
    Ok(())
}

#[test]
fn fail_fast_stops_when_camera_never_connects() -> Result<()> {
    let counters = Counters::default();
    let sink = RecordingSink::default();
    let mut sampling = build(
        settings(FailurePolicy::FailFast, 3, 30),
        ScriptedSource::offline(counters.clone()),
        ReplayExtractor::repeating(full_reading()),
        sink.clone(),
    );

    let summary = sampling.run(&AtomicBool::new(false))?;

    assert_eq!(summary.stop, StopReason::SourceFailed);
    assert_eq!(summary.ticks, 0);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
    assert!(counters.releases.load(Ordering::SeqCst) >= 1);
    assert!(sink.payloads().is_empty());
    Ok(())
}

#[test]
fn mid_run_disconnect_reconnects_on_next_tick() -> Result<()> {
    let counters = Counters::default();
    let sink = RecordingSink::default();
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 3, 6),
        ScriptedSource::new(
            &[true, false, true],
            false,
            &[true, true, false, true, true],
            counters.clone(),
        ),
        ReplayExtractor::repeating(full_reading()),
        sink.clone(),
    );

    let summary = sampling.run(&AtomicBool::new(false))?;

    assert_eq!(summary.stop, StopReason::TickLimit);
    assert_eq!(summary.extracted, 4);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
    assert_eq!(
        modes(&sink.payloads()),
        vec!["OCR", "OCR", "SIM", "SIM", "OCR", "OCR"]
    );
    let first = &sink.payloads()[0];
    assert!(first.metadata.contains_key("latency_ms"));
    assert!(first.metadata.contains_key("drop_rate"));
    Ok(())
}

fn graced(frame_grace: Duration) -> PipelineSettings {
    PipelineSettings {
        frame_grace,
        ..settings(FailurePolicy::DegradeToSimulation, 3, 3)
    }
}

#[test]
fn missing_frame_within_grace_keeps_link() {
    let counters = Counters::default();
    let mut sampling = build(
        graced(Duration::from_secs(60)),
        ScriptedSource::new(&[true], false, &[true, false, true], counters.clone()),
        ReplayExtractor::repeating(full_reading()),
        RecordingSink::default(),
    );

    assert_eq!(sampling.tick().mode, Mode::Ocr);
    let missed = sampling.tick();
    assert!(!missed.frame_read);
    assert_eq!(missed.state, LinkState::Connected);
    assert_eq!(missed.mode, Mode::Sim);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 0);

    let resumed = sampling.tick();
    assert!(resumed.frame_read);
    assert_eq!(resumed.mode, Mode::Ocr);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_frame_after_grace_releases() {
    let counters = Counters::default();
    let mut sampling = build(
        graced(Duration::ZERO),
        ScriptedSource::new(&[true], true, &[true, false, true], counters.clone()),
        ReplayExtractor::repeating(full_reading()),
        RecordingSink::default(),
    );

    sampling.tick();
    let missed = sampling.tick();
    assert_eq!(missed.state, LinkState::Disconnected);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);

    assert!(sampling.tick().frame_read);
    assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn dead_link_releases_despite_grace() {
    let counters = Counters::default();
    let mut source = ScriptedSource::new(&[true], true, &[true, false, true], counters.clone());
    source.drop_link_on_miss = true;
    let mut sampling = build(
        graced(Duration::from_secs(60)),
        source,
        ReplayExtractor::repeating(full_reading()),
        RecordingSink::default(),
    );

    sampling.tick();
    let missed = sampling.tick();
    assert_eq!(missed.state, LinkState::Disconnected);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    assert_eq!(sampling.state(), LinkState::Disconnected);
}

#[test]
fn exhausted_reconnects_degrade_to_simulation() -> Result<()> {
    let counters = Counters::default();
    let sink = RecordingSink::default();
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 2, 6),
        ScriptedSource::new(&[true], false, &[true], counters.clone()),
        ReplayExtractor::repeating(full_reading()),
        sink.clone(),
    );

    let summary = sampling.run(&AtomicBool::new(false))?;

    assert_eq!(summary.stop, StopReason::TickLimit);
    assert_eq!(summary.final_state, LinkState::Failed);
    // startup + two failed reconnects, then no more attempts
    assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
    assert_eq!(
        modes(&sink.payloads()),
        vec!["OCR", "SIM", "SIM", "SIM", "SIM", "SIM"]
    );
    Ok(())
}

#[test]
fn exhausted_reconnects_fail_fast_mid_run() -> Result<()> {
    let counters = Counters::default();
    let sink = RecordingSink::default();
    let mut sampling = build(
        settings(FailurePolicy::FailFast, 2, 10),
        ScriptedSource::new(&[true], false, &[true], counters.clone()),
        ReplayExtractor::repeating(full_reading()),
        sink.clone(),
    );

    let summary = sampling.run(&AtomicBool::new(false))?;

    assert_eq!(summary.stop, StopReason::SourceFailed);
    assert_eq!(summary.final_state, LinkState::Failed);
    assert_eq!(summary.ticks, 4);
    assert_eq!(modes(&sink.payloads()), vec!["OCR", "SIM", "SIM"]);
    assert!(counters.releases.load(Ordering::SeqCst) >= 2);
    Ok(())
}

#[test]
fn below_quorum_extraction_is_replaced_by_simulation() {
    let sink = RecordingSink::default();
    let only_hr = VitalSet::new().with(VitalKind::HeartRate, 180.0);
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 3, 1),
        ScriptedSource::new(&[true], true, &[true; 4], Counters::default()),
        ReplayExtractor::repeating(only_hr),
        sink.clone(),
    );

    let report = sampling.tick();

    assert!(report.frame_read);
    assert_eq!(report.mode, Mode::Sim);
    assert_eq!(report.values.len(), 4);
    assert!((0.87..=0.97).contains(&report.confidence));
    let payload = &sink.payloads()[0];
    assert_eq!(payload.metadata["mode"], "SIM");
    assert_ne!(payload.vitals.hr, Some(180));
}

#[test]
fn outlier_is_discarded_and_smoothing_settles() {
    let sink = RecordingSink::default();
    let readings = [150.0, 152.0, 300.0, 148.0, 151.0]
        .into_iter()
        .map(|hr| {
            VitalSet::new()
                .with(VitalKind::HeartRate, hr)
                .with(VitalKind::Spo2, 97.0)
                .with(VitalKind::RespRate, 45.0)
        })
        .collect();
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 3, 5),
        ScriptedSource::new(&[true], true, &[true; 5], Counters::default()),
        ReplayExtractor::sequence(readings),
        sink.clone(),
    );

    let hr: Vec<Option<f64>> = (0..5)
        .map(|_| sampling.tick())
        .inspect(|report| assert_eq!(report.mode, Mode::Ocr))
        .map(|report| report.values.get(VitalKind::HeartRate))
        .collect();

    assert_eq!(
        hr,
        vec![Some(150.0), Some(152.0), None, Some(150.0), Some(151.0)]
    );
    let last = hr[4].unwrap();
    assert!((148.0..=152.0).contains(&last));
    assert_eq!(sink.payloads()[2].vitals.hr, None);
}

#[test]
fn failed_submissions_do_not_stop_the_loop() -> Result<()> {
    let sink = RecordingSink {
        fail: true,
        ..RecordingSink::default()
    };
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 1, 4),
        ScriptedSource::offline(Counters::default()),
        ReplayExtractor::repeating(full_reading()),
        sink,
    );

    let summary = sampling.run(&AtomicBool::new(false))?;

    assert_eq!(summary.ticks, 4);
    assert_eq!(summary.sent, 4);
    assert_eq!(summary.failed, 4);
    assert_eq!(summary.accepted, 0);
    Ok(())
}

#[test]
fn tick_reports_failed_submission_outcome() {
    let sink = RecordingSink {
        fail: true,
        ..RecordingSink::default()
    };
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 5, 1),
        ScriptedSource::offline(Counters::default()),
        ReplayExtractor::repeating(full_reading()),
        sink,
    );

    let report = sampling.tick();
    assert_eq!(report.state, LinkState::Disconnected);
    assert!(matches!(report.outcome, SubmitOutcome::Failed(ref e) if e.contains("connection refused")));
}

#[test]
fn warm_up_failure_aborts_and_releases_source() {
    let counters = Counters::default();
    let mut extractor = ReplayExtractor::repeating(full_reading());
    extractor.fail_warm_up = true;
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 3, 5),
        ScriptedSource::offline(counters.clone()),
        extractor,
        RecordingSink::default(),
    );

    let err = sampling.run(&AtomicBool::new(false)).unwrap_err();
    assert!(format!("{:#}", err).contains("model not loaded"));
    assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_flag_stops_before_first_tick() -> Result<()> {
    let sink = RecordingSink::default();
    let mut sampling = build(
        settings(FailurePolicy::DegradeToSimulation, 3, 100),
        ScriptedSource::new(&[], true, &[true; 10], Counters::default()),
        ReplayExtractor::repeating(full_reading()),
        sink.clone(),
    );

    let summary = sampling.run(&AtomicBool::new(true))?;
    assert_eq!(summary.stop, StopReason::Shutdown);
    assert_eq!(summary.ticks, 0);
    assert!(sink.payloads().is_empty());
    Ok(())
}

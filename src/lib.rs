//! Vitals Connector
//!
//! Samples a camera pointed at a bedside monitor, derives neonatal vital
//! signs from each sampled frame, smooths them, and submits them to a
//! dashboard ingestion endpoint (HTTP) or an MQTT broker.
//!
//! # Pipeline
//!
//! ```text
//! FrameSource -> VitalsExtractor -> TemporalSmoother -> VitalsSink
//!        \_____________ SamplingLoop (one per camera) ________/
//! ```
//!
//! The pipeline holds these properties by construction:
//!
//! 1. **Range-checked values**: every value is checked against its vital's
//!    range; out-of-range values are discarded, never clamped.
//! 2. **Quorum**: a frame reading with fewer than two vitals is replaced by a
//!    simulated one and labelled `SIM`.
//! 3. **Bounded confidence**: confidence is always within [0, 1], never NaN.
//! 4. **No nulls on the wire**: missing vitals are omitted from payloads.
//! 5. **Released handles**: a loop releases its camera on every exit path.
//!
//! # Module Structure
//!
//! - `vitals`: vital kinds, ranges and value sets
//! - `frame`: decoded frames
//! - `ingest`: frame sources (RTSP, HTTP MJPEG/snapshot, stub)
//! - `extract`: extraction strategies (mock, pattern/OCR, VLM)
//! - `smooth`: per-vital median smoothing
//! - `submit`: payloads and sinks (HTTP, MQTT)
//! - `sampler`: the sampling loop and its failure policy
//! - `config`: file + environment configuration

pub mod config;
pub mod extract;
pub mod frame;
pub mod ingest;
pub mod sampler;
pub mod smooth;
pub mod submit;
pub mod vitals;

pub use config::{CameraConfig, ConnectorConfig, SinkKind};
pub use extract::{
    build_extractor, extract_or_empty, Extraction, ExtractorKind, ExtractorSettings,
    VitalsExtractor, VitalsSimulator,
};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, SourceOptions, StreamStats};
pub use sampler::{
    FailurePolicy, LinkState, PipelineSettings, RunSummary, SamplingLoop, StopReason,
    SubmitOutcome, TickReport,
};
pub use smooth::TemporalSmoother;
pub use submit::{HttpSubmitter, IngestAck, IngestPayload, MqttPublisher, VitalsSink};
pub use vitals::{Mode, VitalKind, VitalRange, VitalRanges, VitalSet};

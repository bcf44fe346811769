use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::extract::{ExtractorKind, ExtractorSettings};
use crate::ingest::{source_scheme, SourceOptions};
use crate::sampler::{FailurePolicy, PipelineSettings};
use crate::smooth::{DEFAULT_MIN_SAMPLES, DEFAULT_WINDOW};
use crate::submit::MqttConfig;
use crate::vitals::{VitalKind, VitalRange, VitalRanges};

const DEFAULT_INGEST_URL: &str = "http://localhost:3001/api/vitals/ingest";
const DEFAULT_INGEST_TIMEOUT_SECS: u64 = 5;
const DEFAULT_CAMERA_ID: &str = "camera-001";
const DEFAULT_PATIENT_ID: u64 = 1;
const DEFAULT_STREAM_URL: &str = "stub://camera-001";
const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 5;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 2000;
const DEFAULT_WARMUP_FRAMES: u32 = 5;
const DEFAULT_QUORUM: usize = 2;

#[derive(Debug, Deserialize, Default)]
struct ConnectorConfigFile {
    sink: Option<String>,
    ingest: Option<IngestConfigFile>,
    mqtt: Option<MqttConfigFile>,
    extractor: Option<ExtractorConfigFile>,
    sampling: Option<SamplingConfigFile>,
    smoothing: Option<SmoothingConfigFile>,
    ranges: Option<RangesConfigFile>,
    simulation: Option<SimulationConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ExtractorConfigFile {
    kind: Option<String>,
    tesseract_bin: Option<PathBuf>,
    tesseract_psm: Option<u8>,
    vlm_host: Option<String>,
    vlm_model: Option<String>,
    vlm_timeout_secs: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    interval_secs: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_secs: Option<u64>,
    frame_grace_secs: Option<u64>,
    frame_timeout_ms: Option<u64>,
    warmup_frames: Option<u32>,
    quorum: Option<usize>,
    failure_policy: Option<String>,
    source_label: Option<String>,
    stats_every: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SmoothingConfigFile {
    window: Option<usize>,
    min_samples: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RangesConfigFile {
    hr: Option<VitalRange>,
    spo2: Option<VitalRange>,
    rr: Option<VitalRange>,
    temp: Option<VitalRange>,
}

#[derive(Debug, Deserialize, Default)]
struct SimulationConfigFile {
    hr: Option<f64>,
    spo2: Option<f64>,
    rr: Option<f64>,
    temp: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    id: Option<String>,
    patient_id: Option<u64>,
    url: Option<String>,
    enabled: Option<bool>,
}

/// Where readings go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Http,
    Mqtt,
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(SinkKind::Http),
            "mqtt" => Ok(SinkKind::Mqtt),
            other => Err(anyhow!("unknown sink '{}'; expected http or mqtt", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    pub patient_id: u64,
    pub url: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub frame_grace: Duration,
    pub quorum: usize,
    pub failure_policy: FailurePolicy,
    pub source_label: String,
    pub stats_every: u64,
}

#[derive(Debug, Clone)]
pub struct SmoothingSettings {
    pub window: usize,
    pub min_samples: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub sink: SinkKind,
    pub ingest_url: String,
    pub ingest_timeout: Duration,
    pub mqtt: MqttConfig,
    pub extractor: ExtractorSettings,
    pub sampling: SamplingSettings,
    pub source: SourceOptions,
    pub smoothing: SmoothingSettings,
    pub ranges: VitalRanges,
    pub cameras: Vec<CameraConfig>,
}

impl ConnectorConfig {
    /// Load from `VITALS_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from `path`, falling back to `VITALS_CONFIG`, then apply
    /// environment overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("VITALS_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => ConnectorConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConnectorConfigFile) -> Result<Self> {
        let sink = match file.sink.as_deref() {
            Some(sink) => sink.parse()?,
            None => SinkKind::Http,
        };

        let ingest = file.ingest.unwrap_or_default();
        let ingest_url = ingest
            .url
            .unwrap_or_else(|| DEFAULT_INGEST_URL.to_string());
        let ingest_timeout =
            Duration::from_secs(ingest.timeout_secs.unwrap_or(DEFAULT_INGEST_TIMEOUT_SECS));

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt_defaults = MqttConfig::default();
        let mqtt = MqttConfig {
            broker: mqtt_file.broker.unwrap_or(mqtt_defaults.broker),
            client_id: mqtt_file.client_id.unwrap_or(mqtt_defaults.client_id),
            topic_prefix: mqtt_file
                .topic_prefix
                .unwrap_or(mqtt_defaults.topic_prefix),
            username: mqtt_file.username,
            password: mqtt_file.password,
        };

        let extractor_file = file.extractor.unwrap_or_default();
        let mut extractor = ExtractorSettings::default();
        if let Some(kind) = extractor_file.kind.as_deref() {
            extractor.kind = kind.parse()?;
        }
        if let Some(bin) = extractor_file.tesseract_bin {
            extractor.tesseract.binary = bin;
        }
        if let Some(psm) = extractor_file.tesseract_psm {
            extractor.tesseract.psm = psm;
        }
        if let Some(host) = extractor_file.vlm_host {
            extractor.vlm.host = host;
        }
        if let Some(model) = extractor_file.vlm_model {
            extractor.vlm.model = model;
        }
        if let Some(secs) = extractor_file.vlm_timeout_secs {
            extractor.vlm.timeout = Duration::from_secs(secs);
        }
        if let Some(quality) = extractor_file.jpeg_quality {
            extractor.vlm.jpeg_quality = quality;
        }
        if let Some(sim) = file.simulation {
            let profile = &mut extractor.simulation;
            profile.heart_rate = sim.hr.unwrap_or(profile.heart_rate);
            profile.spo2 = sim.spo2.unwrap_or(profile.spo2);
            profile.resp_rate = sim.rr.unwrap_or(profile.resp_rate);
            profile.temperature = sim.temp.unwrap_or(profile.temperature);
        }

        let sampling_file = file.sampling.unwrap_or_default();
        let pipeline_defaults = PipelineSettings::default();
        let failure_policy = match sampling_file.failure_policy.as_deref() {
            Some(policy) => policy.parse()?,
            None => FailurePolicy::default(),
        };
        let sampling = SamplingSettings {
            interval: Duration::from_secs(
                sampling_file
                    .interval_secs
                    .unwrap_or(DEFAULT_SAMPLE_INTERVAL_SECS),
            ),
            max_reconnect_attempts: sampling_file
                .max_reconnect_attempts
                .unwrap_or(pipeline_defaults.max_reconnect_attempts),
            reconnect_delay: sampling_file
                .reconnect_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(pipeline_defaults.reconnect_delay),
            frame_grace: sampling_file
                .frame_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(pipeline_defaults.frame_grace),
            quorum: sampling_file.quorum.unwrap_or(DEFAULT_QUORUM),
            failure_policy,
            source_label: sampling_file
                .source_label
                .unwrap_or(pipeline_defaults.source_label),
            stats_every: sampling_file
                .stats_every
                .unwrap_or(pipeline_defaults.stats_every),
        };
        let source = SourceOptions {
            frame_timeout: Duration::from_millis(
                sampling_file
                    .frame_timeout_ms
                    .unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
            ),
            warmup_frames: sampling_file
                .warmup_frames
                .unwrap_or(DEFAULT_WARMUP_FRAMES),
            ..SourceOptions::default()
        };

        let smoothing_file = file.smoothing.unwrap_or_default();
        let smoothing = SmoothingSettings {
            window: smoothing_file.window.unwrap_or(DEFAULT_WINDOW),
            min_samples: smoothing_file.min_samples.unwrap_or(DEFAULT_MIN_SAMPLES),
        };

        let mut ranges = VitalRanges::default();
        if let Some(file_ranges) = file.ranges {
            for (kind, range) in [
                (VitalKind::HeartRate, file_ranges.hr),
                (VitalKind::Spo2, file_ranges.spo2),
                (VitalKind::RespRate, file_ranges.rr),
                (VitalKind::Temperature, file_ranges.temp),
            ] {
                if let Some(range) = range {
                    ranges.set(kind, range);
                }
            }
        }

        let cameras = match file.cameras {
            Some(cameras) if !cameras.is_empty() => cameras
                .into_iter()
                .enumerate()
                .map(|(idx, camera)| {
                    let id = camera
                        .id
                        .unwrap_or_else(|| format!("camera-{:03}", idx + 1));
                    CameraConfig {
                        url: camera.url.unwrap_or_else(|| format!("stub://{}", id)),
                        patient_id: camera.patient_id.unwrap_or(DEFAULT_PATIENT_ID),
                        enabled: camera.enabled.unwrap_or(true),
                        id,
                    }
                })
                .collect(),
            _ => vec![default_camera()],
        };

        Ok(Self {
            sink,
            ingest_url,
            ingest_timeout,
            mqtt,
            extractor,
            sampling,
            source,
            smoothing,
            ranges,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("VITALS_INGEST_URL") {
            if !url.trim().is_empty() {
                self.ingest_url = url;
            }
        }
        if let Ok(url) = std::env::var("VITALS_STREAM_URL") {
            if !url.trim().is_empty() {
                if let Some(camera) = self.cameras.first_mut() {
                    camera.url = url;
                }
            }
        }
        if let Ok(kind) = std::env::var("VITALS_EXTRACTOR") {
            if !kind.trim().is_empty() {
                self.extractor.kind = kind.parse::<ExtractorKind>()?;
            }
        }
        if let Ok(policy) = std::env::var("VITALS_FAILURE_POLICY") {
            if !policy.trim().is_empty() {
                self.sampling.failure_policy = policy.parse()?;
            }
        }
        if let Ok(interval) = std::env::var("VITALS_SAMPLE_INTERVAL_SECS") {
            if !interval.trim().is_empty() {
                let seconds: u64 = interval.trim().parse().map_err(|_| {
                    anyhow!("VITALS_SAMPLE_INTERVAL_SECS must be an integer number of seconds")
                })?;
                self.sampling.interval = Duration::from_secs(seconds);
            }
        }
        if let Ok(sink) = std::env::var("VITALS_SINK") {
            if !sink.trim().is_empty() {
                self.sink = sink.parse()?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sink == SinkKind::Http {
            require_scheme("ingest url", &self.ingest_url, &["http", "https"])?;
        }
        if self.sink == SinkKind::Mqtt {
            crate::submit::mqtt::parse_mqtt_endpoint(&self.mqtt.broker)?;
        }
        if self.extractor.kind == ExtractorKind::Vlm {
            require_scheme("vlm host", &self.extractor.vlm.host, &["http", "https"])?;
        }
        if !(1..=100).contains(&self.extractor.vlm.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }

        if self.ingest_timeout < Duration::from_secs(1) {
            return Err(anyhow!("ingest timeout must be at least 1 second"));
        }
        if self.sampling.interval < Duration::from_secs(1) {
            return Err(anyhow!("sample interval must be at least 1 second"));
        }
        if self.sampling.max_reconnect_attempts == 0 {
            return Err(anyhow!("max_reconnect_attempts must be greater than zero"));
        }
        if self.sampling.quorum == 0 || self.sampling.quorum > VitalKind::ALL.len() {
            return Err(anyhow!(
                "quorum must be between 1 and {}",
                VitalKind::ALL.len()
            ));
        }
        if self.smoothing.window == 0 || self.smoothing.min_samples == 0 {
            return Err(anyhow!("smoothing window and min_samples must be positive"));
        }
        if self.smoothing.min_samples > self.smoothing.window {
            return Err(anyhow!(
                "smoothing min_samples ({}) must not exceed window ({})",
                self.smoothing.min_samples,
                self.smoothing.window
            ));
        }
        self.ranges.validate()?;

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(anyhow!("camera id must not be empty"));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
            if camera.patient_id == 0 {
                return Err(anyhow!(
                    "camera '{}' patient_id must be greater than zero",
                    camera.id
                ));
            }
            let scheme = source_scheme(&camera.url)
                .map_err(|e| anyhow!("camera '{}' url: {}", camera.id, e))?;
            if RTSP_SCHEMES.contains(&scheme.as_str()) && !cfg!(feature = "rtsp-gstreamer") {
                return Err(anyhow!(
                    "camera '{}' url uses {}, which requires the rtsp-gstreamer feature",
                    camera.id,
                    scheme
                ));
            }
            require_scheme(
                &format!("camera '{}' url", camera.id),
                &camera.url,
                &["stub", "rtsp", "rtsps", "http", "https"],
            )?;
        }
        if !self.cameras.iter().any(|camera| camera.enabled) {
            return Err(anyhow!("at least one camera must be enabled"));
        }
        Ok(())
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|camera| camera.enabled)
    }

    /// Loop settings for one camera.
    pub fn pipeline_settings(&self, camera: &CameraConfig) -> PipelineSettings {
        PipelineSettings {
            camera_id: camera.id.clone(),
            patient_id: camera.patient_id,
            source_label: self.sampling.source_label.clone(),
            sample_interval: self.sampling.interval,
            max_reconnect_attempts: self.sampling.max_reconnect_attempts,
            reconnect_delay: self.sampling.reconnect_delay,
            frame_grace: self.sampling.frame_grace,
            quorum: self.sampling.quorum,
            failure_policy: self.sampling.failure_policy,
            ranges: self.ranges,
            stats_every: self.sampling.stats_every,
            max_ticks: None,
        }
    }
}

fn default_camera() -> CameraConfig {
    CameraConfig {
        id: DEFAULT_CAMERA_ID.to_string(),
        patient_id: DEFAULT_PATIENT_ID,
        url: DEFAULT_STREAM_URL.to_string(),
        enabled: true,
    }
}

const RTSP_SCHEMES: [&str; 2] = ["rtsp", "rtsps"];

fn require_scheme(what: &str, url: &str, allowed: &[&str]) -> Result<()> {
    let scheme = source_scheme(url).map_err(|e| anyhow!("{}: {}", what, e))?;
    if !allowed.contains(&scheme.as_str()) {
        return Err(anyhow!(
            "{} must use one of {:?}, got '{}'",
            what,
            allowed,
            scheme
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<ConnectorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

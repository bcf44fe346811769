//! Vision-language-model strategy.
//!
//! The frame is JPEG-encoded, base64'd and sent to an Ollama chat endpoint
//! with a prompt asking for a flat JSON object of readings. Replies that are
//! not valid JSON are mined with labelled regexes instead.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::extractor::{Extraction, VitalsExtractor};
use super::truncate_chars;
use crate::frame::Frame;
use crate::vitals::{Mode, VitalKind, VitalRange, VitalRanges, VitalSet};

pub const VLM_PROMPT: &str = "Look at this image of a patient monitor display.
Extract any visible vital signs numbers you can see.

Return ONLY a JSON object with these fields (use null if not visible):
{
  \"hr\": <heart rate number>,
  \"spo2\": <oxygen saturation percentage>,
  \"rr\": <respiratory rate number>,
  \"temp\": <temperature number>,
  \"bp_sys\": <systolic blood pressure>,
  \"bp_dia\": <diastolic blood pressure>
}

Only return the JSON, no other text.";

const PING_PROMPT: &str = "Say \"ready\" if you can see images.";

/// Neonatal blood pressure bounds. Blood pressure is metadata only.
pub const BP_SYSTOLIC_RANGE: VitalRange = VitalRange::new(40.0, 120.0);
pub const BP_DIASTOLIC_RANGE: VitalRange = VitalRange::new(20.0, 80.0);

/// Longest model reply forwarded as metadata.
const MAX_RESPONSE_METADATA: usize = 500;

#[derive(Clone, Debug, PartialEq)]
pub struct VlmSettings {
    /// Ollama base URL.
    pub host: String,
    pub model: String,
    /// Upper bound on one chat request. Local models are slow.
    pub timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for VlmSettings {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "moondream".to_string(),
            timeout: Duration::from_secs(60),
            jpeg_quality: 85,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}

/// Minimal blocking client for Ollama's `/api/chat`.
pub struct OllamaClient {
    settings: VlmSettings,
    endpoint: String,
    agent: ureq::Agent,
}

impl OllamaClient {
    pub fn new(settings: VlmSettings) -> Result<Self> {
        let base = url::Url::parse(&settings.host)
            .with_context(|| format!("invalid ollama host '{}'", settings.host))?;
        let endpoint = base
            .join("api/chat")
            .with_context(|| format!("build chat endpoint from '{}'", settings.host))?
            .to_string();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout(settings.timeout)
            .build();
        Ok(Self {
            settings,
            endpoint,
            agent,
        })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Send one non-streaming chat message and return the reply text.
    pub fn chat(&self, prompt: &str, images: Vec<String>) -> Result<String> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
                images,
            }],
            stream: false,
        };
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(&request)
            .with_context(|| format!("ollama chat request to {}", self.endpoint))?;
        let reply: ChatResponse = response.into_json().context("parse ollama chat response")?;
        Ok(reply.message.content)
    }

    /// Check the model answers at all.
    pub fn ping(&self) -> Result<String> {
        self.chat(PING_PROMPT, Vec::new())
    }
}

/// `vlm` strategy.
pub struct VlmExtractor {
    client: OllamaClient,
    ranges: VitalRanges,
}

impl VlmExtractor {
    pub fn new(client: OllamaClient, ranges: VitalRanges) -> Self {
        Self { client, ranges }
    }
}

impl VitalsExtractor for VlmExtractor {
    fn name(&self) -> &'static str {
        "vlm"
    }

    fn mode(&self) -> Mode {
        Mode::Vlm
    }

    fn warm_up(&mut self) -> Result<()> {
        let reply = self
            .client
            .ping()
            .with_context(|| format!("model '{}' not reachable", self.client.model()))?;
        log::info!(
            "VlmExtractor: {} ready ({})",
            self.client.model(),
            truncate_chars(reply.trim(), 50)
        );
        Ok(())
    }

    fn extract(&mut self, frame: &Frame) -> Result<Extraction> {
        let jpeg = frame.encode_jpeg(self.client.settings.jpeg_quality)?;
        let image = general_purpose::STANDARD.encode(jpeg);
        let reply = self.client.chat(VLM_PROMPT, vec![image])?;

        let parsed = parse_vlm_response(&reply, &self.ranges);
        let mut extraction = Extraction::new(parsed.values, parsed.confidence())
            .with_raw(truncate_chars(reply.trim(), 50))
            .with_extra(
                "vlm_response",
                truncate_chars(&reply, MAX_RESPONSE_METADATA),
            );
        if let Some(sys) = parsed.bp_sys {
            extraction = extraction.with_extra("bp_sys", sys);
        }
        if let Some(dia) = parsed.bp_dia {
            extraction = extraction.with_extra("bp_dia", dia);
        }
        Ok(extraction)
    }
}

/// Readings recovered from a model reply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VlmReadings {
    pub values: VitalSet,
    pub bp_sys: Option<f64>,
    pub bp_dia: Option<f64>,
}

impl VlmReadings {
    /// Number of valid fields, blood pressure included.
    pub fn count(&self) -> usize {
        self.values.len() + self.bp_sys.is_some() as usize + self.bp_dia.is_some() as usize
    }

    /// `min(0.95, 0.5 + 0.1 n)`, or 0 when nothing was read.
    pub fn confidence(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => (0.5 + 0.1 * n as f64).min(0.95),
        }
    }
}

fn json_object_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^{}]*\}").expect("static json object regex"))
}

fn fallback_patterns() -> &'static [(VitalKind, Regex)] {
    static PATTERNS: OnceLock<Vec<(VitalKind, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (VitalKind::HeartRate, r"(?i)(?:hr|heart\s*rate)[:\s]*(\d{2,3})"),
            (VitalKind::Spo2, r"(?i)(?:spo2|oxygen|sat)[:\s]*(\d{2,3})"),
            (VitalKind::RespRate, r"(?i)(?:rr|resp)[:\s]*(\d{1,3})"),
            (VitalKind::Temperature, r"(?i)temp[:\s]*(\d{2}\.?\d?)"),
        ]
        .into_iter()
        .map(|(kind, source)| (kind, Regex::new(source).expect("static vlm regex")))
        .collect()
    })
}

/// Parse a model reply.
///
/// The first flat `{...}` object is read as JSON; numbers and numeric strings
/// are accepted, everything else is ignored. When no object parses, labelled
/// regexes are tried on the whole reply. Out-of-range values are dropped.
pub fn parse_vlm_response(reply: &str, ranges: &VitalRanges) -> VlmReadings {
    let object = json_object_regex()
        .find(reply)
        .and_then(|m| serde_json::from_str::<serde_json::Map<String, Value>>(m.as_str()).ok());

    let mut readings = VlmReadings::default();
    match object {
        Some(object) => {
            for kind in VitalKind::ALL {
                if let Some(value) = object.get(kind.key()).and_then(json_number) {
                    readings.values.insert_checked(kind, value, ranges);
                }
            }
            readings.bp_sys = object
                .get("bp_sys")
                .and_then(json_number)
                .filter(|v| BP_SYSTOLIC_RANGE.contains(*v));
            readings.bp_dia = object
                .get("bp_dia")
                .and_then(json_number)
                .filter(|v| BP_DIASTOLIC_RANGE.contains(*v));
        }
        None => {
            for (kind, re) in fallback_patterns() {
                let value = re
                    .captures(reply)
                    .and_then(|caps| caps.get(1)?.as_str().parse::<f64>().ok());
                if let Some(value) = value {
                    readings.values.insert_checked(*kind, value, ranges);
                }
            }
        }
    }
    readings
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_reply_is_parsed_with_bp_kept_apart() {
        let reply = "Sure! {\"hr\": 148, \"spo2\": \"96\", \"rr\": null, \"temp\": 36.7, \"bp_sys\": 65, \"bp_dia\": 40}";
        let readings = parse_vlm_response(reply, &VitalRanges::default());
        assert_eq!(readings.values.get(VitalKind::HeartRate), Some(148.0));
        assert_eq!(readings.values.get(VitalKind::Spo2), Some(96.0));
        assert_eq!(readings.values.get(VitalKind::RespRate), None);
        assert_eq!(readings.values.get(VitalKind::Temperature), Some(36.7));
        assert_eq!(readings.bp_sys, Some(65.0));
        assert_eq!(readings.bp_dia, Some(40.0));
        assert_eq!(readings.count(), 5);
        assert_eq!(readings.confidence(), 0.95);
    }

    #[test]
    fn out_of_range_json_values_are_dropped() {
        let reply = r#"{"hr": 400, "spo2": 97, "bp_sys": 200}"#;
        let readings = parse_vlm_response(reply, &VitalRanges::default());
        assert_eq!(readings.values.get(VitalKind::HeartRate), None);
        assert_eq!(readings.bp_sys, None);
        assert_eq!(readings.count(), 1);
        assert!((readings.confidence() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn prose_reply_falls_back_to_labels() {
        let reply = "The monitor shows Heart Rate: 152, SpO2 95 and Resp 40. Temp 37.1";
        let readings = parse_vlm_response(reply, &VitalRanges::default());
        assert_eq!(readings.values.get(VitalKind::HeartRate), Some(152.0));
        assert_eq!(readings.values.get(VitalKind::Spo2), Some(95.0));
        assert_eq!(readings.values.get(VitalKind::RespRate), Some(40.0));
        assert_eq!(readings.values.get(VitalKind::Temperature), Some(37.1));
    }

    #[test]
    fn nothing_readable_means_zero_confidence() {
        let readings = parse_vlm_response("I cannot see a monitor.", &VitalRanges::default());
        assert_eq!(readings.count(), 0);
        assert_eq!(readings.confidence(), 0.0);
    }

    #[test]
    fn client_rejects_bad_host() {
        let settings = VlmSettings {
            host: "not a host".to_string(),
            ..VlmSettings::default()
        };
        assert!(OllamaClient::new(settings).is_err());
    }

    #[test]
    fn chat_endpoint_is_joined_onto_host() -> Result<()> {
        let client = OllamaClient::new(VlmSettings::default())?;
        assert_eq!(client.endpoint, "http://localhost:11434/api/chat");
        Ok(())
    }

    #[test]
    fn unreachable_model_fails_warm_up() -> Result<()> {
        let client = OllamaClient::new(VlmSettings {
            host: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(300),
            ..VlmSettings::default()
        })?;
        let mut extractor = VlmExtractor::new(client, VitalRanges::default());
        let err = extractor.warm_up().unwrap_err();
        assert!(err.to_string().contains("not reachable"));
        Ok(())
    }
}

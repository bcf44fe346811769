//! Vitals submission.
//!
//! A reading becomes an `IngestPayload` and is handed to a `VitalsSink`:
//! - `HttpSubmitter`: POST to the dashboard's `/api/vitals/ingest`
//! - `MqttSubmitter`: QoS 1 publish to a per-patient topic
//!
//! Submission is a single attempt. Failures are reported to the caller, which
//! logs and drops the reading; the next tick is the retry.

pub mod http;
pub mod mqtt;

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::vitals::{sanitize_confidence, VitalKind, VitalSet};

pub use http::HttpSubmitter;
pub use mqtt::{vitals_topic, MqttConfig, MqttPublisher, MqttSubmitter};

/// Destination for submitted readings.
pub trait VitalsSink: Send {
    /// Short label for logs.
    fn name(&self) -> String;

    /// Submit one payload. `Err` means the payload never reached the receiver.
    fn submit(&mut self, payload: &IngestPayload) -> Result<IngestAck>;
}

/// Vitals on the wire. Missing vitals are omitted, never `null`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadVitals {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spo2: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rr: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<f64>,
}

impl PayloadVitals {
    /// Integer vitals are truncated; temperature keeps one decimal.
    pub fn from_set(set: &VitalSet) -> Self {
        Self {
            hr: set.get(VitalKind::HeartRate).map(|v| v.trunc() as i64),
            spo2: set.get(VitalKind::Spo2).map(|v| v.trunc() as i64),
            rr: set.get(VitalKind::RespRate).map(|v| v.trunc() as i64),
            temp: set
                .get(VitalKind::Temperature)
                .map(|v| (v * 10.0).round() / 10.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hr.is_none() && self.spo2.is_none() && self.rr.is_none() && self.temp.is_none()
    }
}

/// Body of `POST /api/vitals/ingest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestPayload {
    pub patient_id: u64,
    pub camera_id: String,
    pub vitals: PayloadVitals,
    pub confidence: f64,
    pub inference_time_ms: u64,
    /// RFC 3339, UTC, `Z` suffix.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl IngestPayload {
    /// Build a payload. Refuses a reading without any vitals.
    pub fn new(
        patient_id: u64,
        camera_id: &str,
        values: &VitalSet,
        confidence: f64,
        inference_time: Duration,
        captured_at: DateTime<Utc>,
        metadata: Map<String, Value>,
    ) -> Result<Self> {
        let vitals = PayloadVitals::from_set(values);
        if vitals.is_empty() {
            return Err(anyhow!("refusing to submit a reading without vitals"));
        }
        Ok(Self {
            patient_id,
            camera_id: camera_id.to_string(),
            vitals,
            confidence: sanitize_confidence(confidence),
            inference_time_ms: inference_time.as_millis() as u64,
            timestamp: captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            metadata,
        })
    }
}

/// Receiver's answer to a submission.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct IngestAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default, rename = "vitalId")]
    pub vital_id: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl IngestAck {
    pub fn accepted(vital_id: Option<Value>) -> Self {
        Self {
            success: true,
            vital_id,
            ..Self::default()
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Why the receiver refused, if it did.
    pub fn reason(&self) -> Option<&str> {
        if self.success {
            return None;
        }
        Some(
            self.error
                .as_deref()
                .or(self.message.as_deref())
                .unwrap_or("rejected without reason"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn payload_omits_missing_vitals_and_empty_metadata() -> Result<()> {
        let values = VitalSet::new()
            .with(VitalKind::HeartRate, 152.7)
            .with(VitalKind::Temperature, 36.84);
        let payload = IngestPayload::new(
            3,
            "camera-003",
            &values,
            0.88,
            Duration::from_millis(42),
            at(),
            Map::new(),
        )?;
        let json = serde_json::to_value(&payload)?;
        assert_eq!(
            json,
            serde_json::json!({
                "patientId": 3,
                "cameraId": "camera-003",
                "vitals": {"hr": 152, "temp": 36.8},
                "confidence": 0.88,
                "inferenceTimeMs": 42,
                "timestamp": "2025-01-02T03:04:05.000Z"
            })
        );
        assert!(!serde_json::to_string(&payload)?.contains("null"));
        Ok(())
    }

    #[test]
    fn empty_reading_is_refused() {
        let result = IngestPayload::new(
            1,
            "camera-001",
            &VitalSet::new(),
            0.9,
            Duration::ZERO,
            at(),
            Map::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn confidence_is_sanitized() -> Result<()> {
        let values = VitalSet::new().with(VitalKind::Spo2, 97.0);
        let payload = IngestPayload::new(1, "c", &values, 7.5, Duration::ZERO, at(), Map::new())?;
        assert_eq!(payload.confidence, 1.0);
        Ok(())
    }

    #[test]
    fn ack_parses_success_and_error_shapes() -> Result<()> {
        let ok: IngestAck = serde_json::from_str(r#"{"success": true, "vitalId": 812}"#)?;
        assert!(ok.success);
        assert_eq!(ok.vital_id, Some(Value::from(812)));
        assert_eq!(ok.reason(), None);

        let err: IngestAck = serde_json::from_str(r#"{"error": "patient not found"}"#)?;
        assert_eq!(err.reason(), Some("patient not found"));

        let msg: IngestAck = serde_json::from_str(r#"{"success": false, "message": "bad"}"#)?;
        assert_eq!(msg.reason(), Some("bad"));
        Ok(())
    }
}

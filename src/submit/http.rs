use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::{IngestAck, IngestPayload, VitalsSink};

/// Posts payloads to the dashboard ingestion endpoint.
pub struct HttpSubmitter {
    url: String,
    agent: ureq::Agent,
}

impl HttpSubmitter {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: url.to_string(),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl VitalsSink for HttpSubmitter {
    fn name(&self) -> String {
        format!("http {}", self.url)
    }

    fn submit(&mut self, payload: &IngestPayload) -> Result<IngestAck> {
        match self.agent.post(&self.url).send_json(payload) {
            Ok(response) => {
                let body = response.into_string().context("read ingest response")?;
                if body.trim().is_empty() {
                    return Ok(IngestAck::accepted(None));
                }
                serde_json::from_str(&body)
                    .with_context(|| format!("parse ingest response from {}", self.url))
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                match serde_json::from_str::<IngestAck>(&body) {
                    Ok(ack) => Ok(IngestAck {
                        success: false,
                        error: ack.error.or_else(|| Some(format!("HTTP {}", code))),
                        ..ack
                    }),
                    Err(_) => Err(anyhow!("ingest endpoint returned HTTP {}", code)),
                }
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("post vitals to {}", self.url))),
        }
    }
}

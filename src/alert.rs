//! Outbound alert to the display node.

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::AlertSettings;

pub const ALERT_EVENT: &str = "tea_service_detected";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub event: String,
    pub confidence: f64,
    pub timestamp: String,
}

impl AlertPayload {
    pub fn new(confidence: f32, at: DateTime<Local>) -> Self {
        Self {
            event: ALERT_EVENT.to_string(),
            confidence: widen_score(confidence),
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Widen through the shortest decimal form, so a 0.8 score goes out as 0.8
/// rather than 0.800000011920929.
fn widen_score(score: f32) -> f64 {
    score.to_string().parse().unwrap_or(f64::from(score))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Receiver answered with a non-200 status.
    Rejected(u16),
    /// Connection, timeout or encoding failure.
    Failed(String),
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Delivers alerts. A single attempt per alert; no retries, no queue.
pub trait AlertDispatcher: Send {
    fn dispatch(&mut self, payload: &AlertPayload) -> DispatchOutcome;
}

pub struct HttpAlertSink {
    url: String,
    agent: ureq::Agent,
}

impl HttpAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: url.into(),
            agent,
        }
    }

    pub fn from_settings(settings: &AlertSettings) -> Self {
        Self::new(settings.url(), settings.timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AlertDispatcher for HttpAlertSink {
    fn dispatch(&mut self, payload: &AlertPayload) -> DispatchOutcome {
        let body = match payload.to_json() {
            Ok(body) => body,
            Err(err) => return DispatchOutcome::Failed(format!("encode alert: {}", err)),
        };
        log::info!("sending alert to {}", self.url);
        match self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
        {
            Ok(response) if response.status() == 200 => {
                log::info!("alert delivered");
                DispatchOutcome::Delivered
            }
            Ok(response) => {
                log::warn!("alert sent but receiver returned {}", response.status());
                DispatchOutcome::Rejected(response.status())
            }
            Err(ureq::Error::Status(code, _)) => {
                log::warn!("alert sent but receiver returned {}", code);
                DispatchOutcome::Rejected(code)
            }
            Err(err) => {
                log::warn!("failed to send alert: {}", err);
                DispatchOutcome::Failed(err.to_string())
            }
        }
    }
}

/// Keeps every payload in memory. Used by bench runs and tests.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    pub sent: Vec<AlertPayload>,
    pub outcome: Option<DispatchOutcome>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `outcome` for every dispatch instead of `Delivered`.
    pub fn answering(outcome: DispatchOutcome) -> Self {
        Self {
            sent: Vec::new(),
            outcome: Some(outcome),
        }
    }
}

impl AlertDispatcher for RecordingDispatcher {
    fn dispatch(&mut self, payload: &AlertPayload) -> DispatchOutcome {
        self.sent.push(payload.clone());
        self.outcome.clone().unwrap_or(DispatchOutcome::Delivered)
    }
}

//! Anonymous usage telemetry.
//!
//! A [`Telemetry`] recorder collects whitelisted metrics during one command
//! and posts them in a single event at the end. Recording is cheap and
//! infallible; posting is best-effort.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use crate::error::TelemetryError;

/// Upper bound on one telemetry request, response included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Metric names accepted by the telemetry endpoint.
pub const SUPPORTED_METRICS: [&str; 13] = [
    "os",
    "arch",
    "cmd",
    "dockerCmd",
    "version",
    "env",
    "ci",
    "ciProvider",
    "didReceiveCloudLinkMessage",
    "didParseCloudLink",
    "didAutoSpawnBrowser",
    "warning",
    "error",
];

/// Event type reported for every CLI event.
const EVENT_TYPE: &str = "PRIVADO_CLI";

/// A recorded metric value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Atomic(String),
    Array(Vec<String>),
}

/// Destination and identity for a telemetry post.
#[derive(Debug, Clone)]
pub struct TelemetryRequest {
    pub url: String,
    pub user_hash: String,
    pub session_id: String,
    pub authentication_key_hash: String,
}

#[derive(Debug, Serialize)]
struct EventBody<'a> {
    event_type: &'a str,
    event_message: String,
    user_hash: &'a str,
    session_id: &'a str,
}

#[derive(Debug, Default)]
struct Inner {
    metrics: Mutex<BTreeMap<String, MetricValue>>,
    recorded: AtomicBool,
}

/// Shared metric recorder. Clones record into the same event.
#[derive(Debug, Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    /// Creates a recorder pre-populated with the host `os` and `arch`.
    pub fn new() -> Self {
        let telemetry = Self {
            inner: Arc::new(Inner::default()),
        };
        telemetry.record_atomic("os", std::env::consts::OS);
        telemetry.record_atomic("arch", std::env::consts::ARCH);
        telemetry
    }

    fn is_supported(key: &str) -> bool {
        SUPPORTED_METRICS.contains(&key)
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn record_atomic(&self, key: &str, value: impl ToString) {
        if !Self::is_supported(key) {
            tracing::debug!(key, "Ignoring unsupported telemetry metric");
            return;
        }
        let mut metrics = self
            .inner
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        metrics.insert(key.to_string(), MetricValue::Atomic(value.to_string()));
    }

    /// Appends `value` to the array stored under `key`.
    ///
    /// An atomic value already stored under `key` becomes the first element.
    pub fn record_array(&self, key: &str, value: impl ToString) {
        if !Self::is_supported(key) {
            tracing::debug!(key, "Ignoring unsupported telemetry metric");
            return;
        }
        let value = value.to_string();
        let mut metrics = self
            .inner
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let updated = match metrics.remove(key) {
            Some(MetricValue::Array(mut values)) => {
                values.push(value);
                MetricValue::Array(values)
            }
            Some(MetricValue::Atomic(previous)) => MetricValue::Array(vec![previous, value]),
            None => MetricValue::Array(vec![value]),
        };
        metrics.insert(key.to_string(), updated);
    }

    /// Snapshot of the recorded metrics.
    pub fn metrics(&self) -> BTreeMap<String, MetricValue> {
        self.inner
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether an event was accepted by the endpoint.
    pub fn is_recorded(&self) -> bool {
        self.inner.recorded.load(Ordering::SeqCst)
    }

    /// Serializes the metrics as 4-space indented JSON.
    pub fn event_message(&self) -> Result<String, TelemetryError> {
        let metrics = self.metrics();
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        metrics.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Posts the recorded metrics as a single event.
    ///
    /// Only a `201 Created` response marks the event as recorded.
    pub async fn post(
        &self,
        client: &Client,
        request: &TelemetryRequest,
    ) -> Result<(), TelemetryError> {
        let body = EventBody {
            event_type: EVENT_TYPE,
            event_message: self.event_message()?,
            user_hash: &request.user_hash,
            session_id: &request.session_id,
        };

        let response = client
            .post(&request.url)
            .header("Content-Type", "application/json")
            .header("Authentication", request.authentication_key_hash.as_str())
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| TelemetryError::RequestFailed(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 201 {
            return Err(TelemetryError::UnexpectedStatus(status));
        }

        self.inner.recorded.store(true, Ordering::SeqCst);
        tracing::debug!("Telemetry event recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_records_platform() {
        let metrics = Telemetry::new().metrics();
        assert_eq!(
            metrics.get("os"),
            Some(&MetricValue::Atomic(std::env::consts::OS.to_string()))
        );
        assert!(metrics.contains_key("arch"));
    }

    #[test]
    fn test_unsupported_metrics_ignored() {
        let telemetry = Telemetry::new();
        telemetry.record_atomic("favouriteColour", "blue");
        telemetry.record_array("other", "x");
        assert_eq!(telemetry.metrics().len(), 2);
    }

    #[test]
    fn test_atomic_overwrites() {
        let telemetry = Telemetry::new();
        telemetry.record_atomic("cmd", "scan");
        telemetry.record_atomic("cmd", "upload");
        assert_eq!(
            telemetry.metrics().get("cmd"),
            Some(&MetricValue::Atomic("upload".to_string()))
        );
    }

    #[test]
    fn test_array_appends_and_promotes_atomic() {
        let telemetry = Telemetry::new();
        telemetry.record_array("warning", "first");
        telemetry.record_array("warning", "second");
        assert_eq!(
            telemetry.metrics().get("warning"),
            Some(&MetricValue::Array(vec![
                "first".to_string(),
                "second".to_string()
            ]))
        );

        telemetry.record_atomic("error", "boom");
        telemetry.record_array("error", "again");
        assert_eq!(
            telemetry.metrics().get("error"),
            Some(&MetricValue::Array(vec!["boom".to_string(), "again".to_string()]))
        );
    }

    #[test]
    fn test_clones_share_metrics() {
        let telemetry = Telemetry::new();
        let clone = telemetry.clone();
        clone.record_atomic("ci", true);
        assert_eq!(
            telemetry.metrics().get("ci"),
            Some(&MetricValue::Atomic("true".to_string()))
        );
    }

    #[test]
    fn test_event_message_format() {
        let telemetry = Telemetry::new();
        telemetry.record_array("env", "CI");
        let message = telemetry.event_message().unwrap();

        assert!(message.starts_with("{\n    \""));
        assert!(message.contains("\"env\": [\n        \"CI\"\n    ]"));
        let parsed: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(parsed["env"][0], "CI");
        assert!(!telemetry.is_recorded());
    }
}

//! Reading sinks: where decoded telemetry goes.
//!
//! The object-model publication layer and the shared-memory telemetry
//! aggregator are external collaborators; both sit behind the
//! `ReadingSink` trait. The daemon ships a structured-log sink and an
//! NDJSON file sink, which is also what the integration tests read
//! back.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SinkValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

/// One published scalar: object path, interface, property, value and
/// the sample timestamp (device time when the response carried one,
/// wall clock otherwise).
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub object_path: String,
    pub interface: String,
    pub property: String,
    pub value: SinkValue,
    pub timestamp_ms: u64,
}

pub fn now_timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[async_trait]
pub trait ReadingSink: Send + Sync {
    #[allow(dead_code)]
    fn name(&self) -> &'static str;
    async fn publish(&self, reading: &Reading);
    async fn publish_status(&self, object_path: &str, available: bool, functional: bool);
}

pub struct SinkList {
    sinks: Vec<Arc<dyn ReadingSink>>,
}

impl Default for SinkList {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkList {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn register<S: ReadingSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Arc::new(sink));
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn publish(&self, reading: &Reading) {
        for sink in &self.sinks {
            sink.publish(reading).await;
        }
    }

    pub async fn publish_status(&self, object_path: &str, available: bool, functional: bool) {
        for sink in &self.sinks {
            sink.publish_status(object_path, available, functional).await;
        }
    }
}

/// Appends every reading as one JSON line.
pub struct JsonlSink {
    file: Arc<Mutex<tokio::fs::File>>,
}

impl JsonlSink {
    pub async fn new(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

#[derive(Serialize)]
struct StatusLine<'a> {
    object_path: &'a str,
    available: bool,
    functional: bool,
    timestamp_ms: u64,
}

#[async_trait]
impl ReadingSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn publish(&self, reading: &Reading) {
        if let Ok(json) = serde_json::to_string(reading) {
            let mut f = self.file.lock().await;
            let _ = f.write_all(json.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
            let _ = f.flush().await;
        }
    }

    async fn publish_status(&self, object_path: &str, available: bool, functional: bool) {
        let line = StatusLine {
            object_path,
            available,
            functional,
            timestamp_ms: now_timestamp_ms(),
        };
        if let Ok(json) = serde_json::to_string(&line) {
            let mut f = self.file.lock().await;
            let _ = f.write_all(json.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
            let _ = f.flush().await;
        }
    }
}

/// Emits readings through the log facade: severity, message id and
/// key/value payload.
pub struct LogSink;

#[async_trait]
impl ReadingSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn publish(&self, reading: &Reading) {
        log::info!(
            "[sink] ReadingPublished path={} property={} value={:?} ts={}",
            reading.object_path,
            reading.property,
            reading.value,
            reading.timestamp_ms
        );
    }

    async fn publish_status(&self, object_path: &str, available: bool, functional: bool) {
        log::info!(
            "[sink] StatusChanged path={} available={} functional={}",
            object_path,
            available,
            functional
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jsonl_writes_reading_and_status_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let sink = JsonlSink::new(file.path().to_str().unwrap()).await.unwrap();
        sink.publish(&Reading {
            object_path: "/inventory/gpu0/temp".into(),
            interface: "xyz.openbmc_project.Sensor.Value".into(),
            property: "Value".into(),
            value: SinkValue::Number(42.25),
            timestamp_ms: 1000,
        })
        .await;
        sink.publish_status("/inventory/gpu0/temp", false, false).await;

        let content = tokio::fs::read_to_string(file.path()).await.unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["value"], 42.25);
        assert_eq!(first["property"], "Value");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["available"], false);
    }

    #[tokio::test]
    async fn sink_list_fans_out() {
        let file_a = tempfile::NamedTempFile::new().unwrap();
        let file_b = tempfile::NamedTempFile::new().unwrap();
        let mut sinks = SinkList::new();
        sinks.register(JsonlSink::new(file_a.path().to_str().unwrap()).await.unwrap());
        sinks.register(JsonlSink::new(file_b.path().to_str().unwrap()).await.unwrap());
        sinks
            .publish(&Reading {
                object_path: "/p".into(),
                interface: "i".into(),
                property: "Value".into(),
                value: SinkValue::Bool(true),
                timestamp_ms: 0,
            })
            .await;
        for file in [file_a, file_b] {
            let content = tokio::fs::read_to_string(file.path()).await.unwrap();
            assert_eq!(content.lines().count(), 1);
        }
    }
}

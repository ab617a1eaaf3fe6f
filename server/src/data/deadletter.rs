//! Dead-letter sink for entries the exporter gave up on
//!
//! With the `file` policy each entry becomes one JSON line in
//! `<data_dir>/deadletter/<pipeline>.jsonl`, carrying the original payload
//! (base64) so it can be replayed by hand. With `drop` the entry is only
//! logged.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::config::DeadLetterPolicy;
use crate::data::queue::QueueEntry;
use crate::utils::time::millis_to_iso;

#[derive(Serialize)]
struct DeadLetterRecord<'a> {
    timestamp: String,
    pipeline: &'a str,
    batch_seq: u64,
    kind: &'a str,
    retry_count: u32,
    enqueued_at: String,
    reason: &'a str,
    payload_base64: String,
}

pub struct DeadLetterSink {
    pipeline: String,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl DeadLetterSink {
    pub fn new(pipeline: &str, policy: DeadLetterPolicy, dir: &Path) -> Self {
        let path = match policy {
            DeadLetterPolicy::Drop => None,
            DeadLetterPolicy::File => Some(dir.join(format!("{}.jsonl", pipeline))),
        };
        Self {
            pipeline: pipeline.to_string(),
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an undeliverable entry. Must complete before the entry leaves
    /// the queue.
    pub async fn write(&self, entry: &QueueEntry, reason: &str) -> std::io::Result<()> {
        tracing::warn!(
            pipeline = %self.pipeline,
            batch_seq = entry.batch_seq,
            retry_count = entry.retry_count,
            reason,
            "Dead-lettering batch"
        );

        let Some(path) = &self.path else {
            return Ok(());
        };

        let record = DeadLetterRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            pipeline: &self.pipeline,
            batch_seq: entry.batch_seq,
            kind: entry.kind.as_str(),
            retry_count: entry.retry_count,
            enqueued_at: millis_to_iso(entry.enqueued_at_ms),
            reason,
            payload_base64: BASE64.encode(&entry.payload),
        };
        let mut line = serde_json::to_vec(&record).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SignalKind;
    use bytes::Bytes;

    fn entry() -> QueueEntry {
        QueueEntry {
            id: 3,
            batch_seq: 42,
            kind: SignalKind::Logs,
            payload: Bytes::from_static(b"payload"),
            enqueued_at_ms: 1_500,
            retry_count: 4,
            next_retry_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_file_policy_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DeadLetterSink::new("logs", DeadLetterPolicy::File, dir.path());
        sink.write(&entry(), "HTTP 400: bad request").await.unwrap();
        sink.write(&entry(), "max retries exceeded").await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("logs.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["pipeline"], "logs");
        assert_eq!(first["batch_seq"], 42);
        assert_eq!(first["kind"], "logs");
        assert_eq!(first["retry_count"], 4);
        assert_eq!(first["enqueued_at"], "1970-01-01T00:00:01.500Z");
        assert_eq!(first["reason"], "HTTP 400: bad request");
        let payload = BASE64
            .decode(first["payload_base64"].as_str().unwrap())
            .unwrap();
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn test_drop_policy_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DeadLetterSink::new("logs", DeadLetterPolicy::Drop, dir.path());
        assert!(sink.path().is_none());
        sink.write(&entry(), "rejected").await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

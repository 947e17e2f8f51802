//! Audit Log
//!
//! Append-only JSON-lines record of every sign-in and save attempt:
//! `{"ts": ..., "event": ..., "data": {...}}`. Callers pass token previews,
//! never tokens. Write failures are logged and dropped.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    ts: String,
    event: &'a str,
    data: Value,
}

/// JSON-lines audit sink
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    /// A log that discards every record
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    /// Append one event
    pub async fn record(&self, event: &str, data: Value) {
        let Some(path) = &self.path else {
            return;
        };

        let record = AuditRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
            data,
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(event, error = %e, "Audit record not serializable");
                return;
            }
        };
        line.push('\n');

        // One writer at a time so lines never interleave
        let _guard = self.lock.lock().await;
        if let Err(e) = append(path, line.as_bytes()).await {
            warn!(event, path = %path.display(), error = %e, "Audit write failed");
        }
    }
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

//! Append-only structured audit log.
//!
//! One JSON object per line, one file per UTC day under `audit/`. A single
//! writer task owns each log file; producers hand events over an unbounded
//! channel, so emitting never blocks and events stay totally ordered within
//! a correlation ID. Retention (>= 7 years) is a deployment concern.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use super::tracing::CorrelationId;
use crate::domain::Result;

/// Closed set of audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    #[serde(rename = "receipt.start")]
    ReceiptStart,
    #[serde(rename = "stage.complete")]
    StageComplete,
    #[serde(rename = "file.reject")]
    FileReject,
    #[serde(rename = "receipt.done")]
    ReceiptDone,
    #[serde(rename = "receipt.failed")]
    ReceiptFailed,
    #[serde(rename = "batch.start")]
    BatchStart,
    #[serde(rename = "batch.file")]
    BatchFile,
    #[serde(rename = "batch.done")]
    BatchDone,
    #[serde(rename = "rate.wait")]
    RateWait,
    #[serde(rename = "token.refresh")]
    TokenRefresh,
    #[serde(rename = "purchase.created")]
    PurchaseCreated,
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    /// Process identity
    pub actor: String,
    /// Type-tagged payload, sanitized before serialization
    pub payload: Value,
}

/// Keys always stripped from payloads, matched case-insensitively as substrings
const BUILTIN_SENSITIVE_KEYS: [&str; 6] = [
    "access_token",
    "refresh_token",
    "client_secret",
    "authorization",
    "api_key",
    "card_number",
];

static CARD_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]?){13,19}\b").expect("card number regex"));

fn hash_fragment(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
    format!("[redacted:{}]", hex)
}

fn is_sensitive_key(key: &str, extra: &[String]) -> bool {
    let lower = key.to_ascii_lowercase();
    BUILTIN_SENSITIVE_KEYS.iter().any(|k| lower.contains(k))
        || extra.iter().any(|k| lower.contains(&k.to_ascii_lowercase()))
}

/// Strip secrets from a payload before it reaches disk.
///
/// Sensitive keys are replaced by a hash of their value; card-number-shaped
/// digit runs inside free-text strings are masked.
pub fn sanitize_payload(value: &Value, extra_keys: &[String]) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if is_sensitive_key(key, extra_keys) {
                    let replacement = match val {
                        Value::String(s) => Value::String(hash_fragment(s)),
                        _ => Value::String("[redacted]".to_string()),
                    };
                    out.insert(key.clone(), replacement);
                } else {
                    out.insert(key.clone(), sanitize_payload(val, extra_keys));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items.iter().map(|v| sanitize_payload(v, extra_keys)).collect(),
        ),
        Value::String(s) => {
            if CARD_NUMBER.is_match(s) {
                Value::String(CARD_NUMBER.replace_all(s, "****").into_owned())
            } else {
                value.clone()
            }
        }
        _ => value.clone(),
    }
}

enum Message {
    Event(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Cloneable producer handle
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::UnboundedSender<Message>,
    actor: Arc<String>,
    sensitive_keys: Arc<Vec<String>>,
}

impl AuditLogger {
    /// Emit one event. Never blocks; a closed writer is logged and ignored.
    pub fn emit(&self, correlation_id: &CorrelationId, kind: AuditKind, payload: Value) {
        let event = AuditEvent {
            correlation_id: correlation_id.clone(),
            timestamp: Utc::now(),
            kind,
            actor: self.actor.as_ref().clone(),
            payload: sanitize_payload(&payload, &self.sensitive_keys),
        };
        if self.tx.send(Message::Event(event)).is_err() {
            warn!("audit writer is gone; event dropped");
        }
    }

    /// Wait until every event emitted so far has been written out
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Message::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// A logger wired to a closed channel, for tests and dry paths
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            tx,
            actor: Arc::new("disabled".to_string()),
            sensitive_keys: Arc::new(Vec::new()),
        }
    }
}

/// Single writer task appending to the day files
pub struct AuditWriter {
    dir: PathBuf,
    current_day: String,
    file: Option<File>,
}

impl AuditWriter {
    /// Spawn the writer task and return the producer handle.
    pub fn spawn(dir: PathBuf, sensitive_keys: Vec<String>) -> (AuditLogger, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let actor = format!("expense-ops[{}]", std::process::id());
        let logger = AuditLogger {
            tx,
            actor: Arc::new(actor),
            sensitive_keys: Arc::new(sensitive_keys),
        };

        let mut writer = AuditWriter {
            dir,
            current_day: String::new(),
            file: None,
        };

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Event(event) => {
                        if let Err(e) = writer.append(&event) {
                            warn!(error = %e, "failed to append audit event");
                        }
                    }
                    Message::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        (logger, handle)
    }

    fn append(&mut self, event: &AuditEvent) -> std::io::Result<()> {
        let day = event.timestamp.format("%Y%m%d").to_string();
        if self.file.is_none() || day != self.current_day {
            std::fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(format!("{}.log", day));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.file = Some(file);
            self.current_day = day;
        }
        let file = self.file.as_mut().expect("file opened above");
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)?;
        file.flush()
    }
}

/// Iterate every event across every day file in the audit directory.
/// Unparseable lines are skipped.
pub fn iter_events(dir: &Path) -> Result<Vec<AuditEvent>> {
    let mut events = Vec::new();
    if !dir.exists() {
        return Ok(events);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
        .collect();
    paths.sort();
    for path in paths {
        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            let line = line?;
            if let Ok(event) = serde_json::from_str::<AuditEvent>(&line) {
                events.push(event);
            }
        }
    }
    Ok(events)
}

/// Content hashes of files a previous run of `batch_id` already completed
pub fn completed_batch_hashes(dir: &Path, batch_id: &str) -> Result<HashSet<String>> {
    let mut hashes = HashSet::new();
    for event in iter_events(dir)? {
        if event.kind != AuditKind::BatchFile {
            continue;
        }
        let payload = &event.payload;
        if payload.get("batch_id").and_then(Value::as_str) == Some(batch_id)
            && payload.get("status").and_then(Value::as_str) == Some("done")
        {
            if let Some(hash) = payload.get("content_hash").and_then(Value::as_str) {
                hashes.insert(hash.to_string());
            }
        }
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_redacts_tokens() {
        let payload = json!({
            "vendor": "Marriott",
            "access_token": "ya29.secret-value",
            "nested": { "Refresh_Token": "rt-secret" }
        });
        let clean = sanitize_payload(&payload, &[]);
        assert_eq!(clean["vendor"], "Marriott");
        let token = clean["access_token"].as_str().unwrap();
        assert!(token.starts_with("[redacted:"));
        assert!(!token.contains("secret"));
        assert!(clean["nested"]["Refresh_Token"]
            .as_str()
            .unwrap()
            .starts_with("[redacted:"));
    }

    #[test]
    fn test_sanitize_masks_card_numbers_in_text() {
        let payload = json!({ "note": "paid with 4111 1111 1111 1111 visa" });
        let clean = sanitize_payload(&payload, &[]);
        assert_eq!(clean["note"], "paid with **** visa");
    }

    #[test]
    fn test_sanitize_honors_declared_keys() {
        let payload = json!({ "company_secret_code": "abc" });
        let clean = sanitize_payload(&payload, &["secret_code".to_string()]);
        assert!(clean["company_secret_code"]
            .as_str()
            .unwrap()
            .starts_with("[redacted:"));
    }

    #[tokio::test]
    async fn test_writer_appends_jsonl_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, handle) = AuditWriter::spawn(dir.path().to_path_buf(), Vec::new());
        let cid = CorrelationId::new();

        logger.emit(&cid, AuditKind::ReceiptStart, json!({"file": "a.jpg"}));
        logger.emit(&cid, AuditKind::ReceiptDone, json!({"total": "36.23"}));
        logger.flush().await;

        let events = iter_events(dir.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuditKind::ReceiptStart);
        assert_eq!(events[1].kind, AuditKind::ReceiptDone);
        assert_eq!(events[0].correlation_id, cid);

        drop(logger);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_completed_batch_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _handle) = AuditWriter::spawn(dir.path().to_path_buf(), Vec::new());
        let cid = CorrelationId::new();

        logger.emit(
            &cid,
            AuditKind::BatchFile,
            json!({"batch_id": "batch-1", "content_hash": "h1", "status": "done"}),
        );
        logger.emit(
            &cid,
            AuditKind::BatchFile,
            json!({"batch_id": "batch-1", "content_hash": "h2", "status": "failed"}),
        );
        logger.emit(
            &cid,
            AuditKind::BatchFile,
            json!({"batch_id": "batch-2", "content_hash": "h3", "status": "done"}),
        );
        logger.flush().await;

        let hashes = completed_batch_hashes(dir.path(), "batch-1").unwrap();
        assert!(hashes.contains("h1"));
        assert!(!hashes.contains("h2"));
        assert!(!hashes.contains("h3"));
    }
}

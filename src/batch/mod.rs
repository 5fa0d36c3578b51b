//! Bulk directory processing: walk, dedup by content hash, bounded
//! parallelism, progress reporting and idempotent resume.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glob::Pattern;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::agents::{Orchestrator, Pathway, ProcessOptions};
use crate::domain::{ExpenseOpsError, Result};
use crate::observability::{audit, AuditKind, AuditLogger, CorrelationId};

/// Extensions screened before content sniffing
pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "gif", "bmp", "webp", "pdf"];

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub recursive: bool,
    /// Glob matched against the file name
    pub pattern: Option<String>,
    pub dry_run: bool,
    /// Concurrent receipts in flight
    pub parallel: usize,
    /// Re-accept a previous batch identifier and skip completed files
    pub resume_id: Option<String>,
    pub continue_on_error: bool,
    pub pathway: Pathway,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            pattern: None,
            dry_run: false,
            parallel: 1,
            resume_id: None,
            continue_on_error: true,
            pathway: Pathway::Agents,
        }
    }
}

/// Progress snapshot sent after each completed file
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub current: usize,
    pub total: usize,
    pub eta: Option<Duration>,
}

/// Final tally of a batch run
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub processed: usize,
    pub skipped: usize,
    pub failed: Vec<(PathBuf, String)>,
    /// True when the run stopped on cancellation; the batch id resumes it
    pub canceled: bool,
}

pub struct BatchDriver {
    orchestrator: Arc<Orchestrator>,
    audit: AuditLogger,
    audit_dir: PathBuf,
}

struct FileJob {
    path: PathBuf,
    content_hash: String,
}

impl BatchDriver {
    pub fn new(orchestrator: Arc<Orchestrator>, audit: AuditLogger, audit_dir: PathBuf) -> Self {
        Self {
            orchestrator,
            audit,
            audit_dir,
        }
    }

    /// Process every supported file under `dir`.
    pub async fn run(
        &self,
        dir: &Path,
        opts: BatchOptions,
        progress: Option<mpsc::Sender<BatchProgress>>,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome> {
        if !dir.is_dir() {
            return Err(ExpenseOpsError::invalid_input(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let batch_id = opts
            .resume_id
            .clone()
            .unwrap_or_else(|| format!("batch-{}", Uuid::new_v4()));
        let batch_correlation = CorrelationId::from_string(batch_id.clone());

        let already_done: HashSet<String> = match &opts.resume_id {
            Some(id) => audit::completed_batch_hashes(&self.audit_dir, id)?,
            None => HashSet::new(),
        };

        let jobs = self.collect_jobs(dir, &opts).await?;
        let total = jobs.len();

        // Log the resumable identifier before the first file is touched
        self.audit.emit(
            &batch_correlation,
            AuditKind::BatchStart,
            json!({ "batch_id": batch_id, "total": total, "resumed": opts.resume_id.is_some() }),
        );
        info!(batch_id = %batch_id, total, "batch started");

        let semaphore = Arc::new(Semaphore::new(opts.parallel.max(1)));
        let started = Instant::now();
        let mut tasks: JoinSet<(PathBuf, String, Result<()>)> = JoinSet::new();

        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut failed: Vec<(PathBuf, String)> = Vec::new();
        let mut completed = 0usize;
        let mut canceled = false;

        let mut pending = Vec::new();
        for job in jobs {
            if already_done.contains(&job.content_hash) {
                skipped += 1;
                continue;
            }
            pending.push(job);
        }
        let queued = pending.len();

        let mut queue = pending.into_iter();
        loop {
            // Keep the window full without over-spawning
            while tasks.len() < opts.parallel.max(1) {
                if cancel.is_cancelled() {
                    canceled = true;
                    break;
                }
                let Some(job) = queue.next() else { break };
                let orchestrator = self.orchestrator.clone();
                let audit_log = self.audit.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let batch_id = batch_id.clone();
                let pathway = opts.pathway;
                let dry_run = opts.dry_run;
                tasks.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    let result =
                        process_one(&orchestrator, &audit_log, &batch_id, &job, pathway, dry_run, cancel)
                            .await;
                    (job.path, job.content_hash, result)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (path, _hash, result) = joined
                .map_err(|e| ExpenseOpsError::internal(format!("batch task panicked: {}", e)))?;

            completed += 1;
            match result {
                Ok(()) => processed += 1,
                Err(ExpenseOpsError::Canceled) => {
                    canceled = true;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "batch file failed");
                    failed.push((path, e.to_string()));
                    if !opts.continue_on_error {
                        cancel.cancel();
                        canceled = true;
                    }
                }
            }

            if let Some(progress) = &progress {
                let eta = if completed > 0 && queued > completed {
                    let per_file = started.elapsed() / completed as u32;
                    Some(per_file * (queued - completed) as u32)
                } else {
                    None
                };
                let _ = progress
                    .send(BatchProgress {
                        current: completed + skipped,
                        total,
                        eta,
                    })
                    .await;
            }

            if canceled && tasks.is_empty() {
                break;
            }
        }

        self.audit.emit(
            &batch_correlation,
            AuditKind::BatchDone,
            json!({
                "batch_id": batch_id,
                "processed": processed,
                "skipped": skipped,
                "failed": failed.len(),
                "canceled": canceled,
            }),
        );
        info!(batch_id = %batch_id, processed, skipped, failures = failed.len(), "batch finished");

        Ok(BatchOutcome {
            batch_id,
            processed,
            skipped,
            failed,
            canceled,
        })
    }

    /// Walk the directory, filter to supported extensions and the optional
    /// pattern, hash contents and drop duplicates.
    async fn collect_jobs(&self, dir: &Path, opts: &BatchOptions) -> Result<Vec<FileJob>> {
        let pattern = opts
            .pattern
            .as_deref()
            .map(Pattern::new)
            .transpose()
            .map_err(|e| ExpenseOpsError::invalid_input(format!("bad pattern: {}", e)))?;

        let mut walker = WalkDir::new(dir).follow_links(false);
        if !opts.recursive {
            walker = walker.max_depth(1);
        }

        let mut paths: Vec<PathBuf> = walker
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| has_supported_extension(path))
            .filter(|path| match (&pattern, path.file_name()) {
                (Some(pattern), Some(name)) => pattern.matches(&name.to_string_lossy()),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        paths.sort();

        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(paths.len());
        for path in paths {
            let content = tokio::fs::read(&path).await?;
            let content_hash = hex_digest(&content);
            if !seen.insert(content_hash.clone()) {
                info!(file = %path.display(), "duplicate content skipped");
                continue;
            }
            jobs.push(FileJob { path, content_hash });
        }
        Ok(jobs)
    }
}

async fn process_one(
    orchestrator: &Orchestrator,
    audit_log: &AuditLogger,
    batch_id: &str,
    job: &FileJob,
    pathway: Pathway,
    dry_run: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let content = tokio::fs::read(&job.path).await?;
    let correlation_id = CorrelationId::new();
    let result = orchestrator
        .process(
            content,
            ProcessOptions {
                pathway,
                dry_run,
                context: None,
                correlation_id: Some(correlation_id.clone()),
                cancel,
            },
        )
        .await;

    let status = match &result {
        Ok(_) => "done",
        Err(ExpenseOpsError::Canceled) => "canceled",
        Err(_) => "failed",
    };
    audit_log.emit(
        &correlation_id,
        AuditKind::BatchFile,
        json!({
            "batch_id": batch_id,
            "file": job.path.display().to_string(),
            "content_hash": job.content_hash,
            "status": status,
        }),
    );

    result.map(|_| ())
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lower = ext.to_lowercase();
            SUPPORTED_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

fn hex_digest(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_extension_filter() {
        assert!(has_supported_extension(Path::new("a/receipt.JPG")));
        assert!(has_supported_extension(Path::new("a/receipt.pdf")));
        assert!(!has_supported_extension(Path::new("a/receipt.txt")));
        assert!(!has_supported_extension(Path::new("a/receipt")));
    }

    #[test]
    fn test_hex_digest_stable() {
        assert_eq!(hex_digest(b"abc"), hex_digest(b"abc"));
        assert_ne!(hex_digest(b"abc"), hex_digest(b"abd"));
        assert_eq!(hex_digest(b"abc").len(), 64);
    }
}

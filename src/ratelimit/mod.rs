//! Per-provider request budgets with cross-process enforcement.
//!
//! Every admission runs inside an OS file lock over a small JSON state file,
//! so a CLI invocation and a long-running server sharing the same data
//! directory count against the same RPM and daily caps. The daily counter
//! resets when the day string, computed in a fixed reference zone, rolls
//! over.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use fd_lock::RwLock as FileRwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::{ExpenseOpsError, Result};
use crate::observability::{AuditKind, AuditLogger, CorrelationId};

/// Sliding admission window
pub const WINDOW: Duration = Duration::from_secs(60);

/// File lock acquisition deadline
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded number of sleep-and-retry cycles before giving up
pub const MAX_REENTRIES: u32 = 3;

/// Reference zone for the daily counter
pub const DEFAULT_REFERENCE_ZONE: Tz = chrono_tz::America::Los_Angeles;

/// Persisted limiter state for one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterState {
    /// Request instants within the last minute
    #[serde(default)]
    pub timestamps: Vec<DateTime<Utc>>,

    #[serde(default)]
    pub daily_count: u32,

    /// Day string in the reference zone the counter belongs to
    #[serde(default)]
    pub day: String,
}

/// One admission attempt's verdict
#[derive(Debug)]
pub enum Admission {
    /// Request admitted and counted
    Admitted,
    /// RPM window full; retry after the given delay
    Wait(Duration),
}

pub struct RateLimiter {
    provider: String,
    rpm: u32,
    rpd: u32,
    zone: Tz,
    state_path: PathBuf,
    lock_path: PathBuf,
    audit: AuditLogger,
}

impl RateLimiter {
    pub fn new(
        data_dir: PathBuf,
        provider: impl Into<String>,
        rpm: u32,
        rpd: u32,
        audit: AuditLogger,
    ) -> Self {
        let provider = provider.into();
        Self {
            state_path: data_dir.join(format!("rate_limiter_{}.json", provider)),
            lock_path: data_dir.join(format!("rate_limiter_{}.lock", provider)),
            provider,
            rpm,
            rpd,
            zone: DEFAULT_REFERENCE_ZONE,
            audit,
        }
    }

    pub fn with_zone(mut self, zone: Tz) -> Self {
        self.zone = zone;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Admit one request, sleeping as needed until the RPM window frees up.
    ///
    /// Bounded re-entry guarantees admission within roughly one window of the
    /// first call, or an error. Daily quota exhaustion is not retryable.
    pub async fn check_and_wait(&self, correlation_id: &CorrelationId) -> Result<()> {
        for _ in 0..=MAX_REENTRIES {
            match self.admit_once()? {
                Admission::Admitted => return Ok(()),
                Admission::Wait(delay) => {
                    debug!(provider = %self.provider, ?delay, "rate window full, waiting");
                    self.audit.emit(
                        correlation_id,
                        AuditKind::RateWait,
                        json!({
                            "provider": self.provider,
                            "delay_ms": delay.as_millis() as u64,
                        }),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(ExpenseOpsError::internal(format!(
            "rate limiter for '{}' could not admit within {} retries",
            self.provider, MAX_REENTRIES
        )))
    }

    /// One locked admission attempt. Exposed for simulation tests; callers
    /// normally use [`check_and_wait`](Self::check_and_wait).
    pub fn admit_once(&self) -> Result<Admission> {
        if let Some(dir) = self.state_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        let mut lock = FileRwLock::new(lock_file);
        let guard = acquire_write_lock(&mut lock, LOCK_TIMEOUT)?;

        let mut state = self.load_state();
        let now = Utc::now();

        // Daily counter rolls with the reference-zone calendar
        let today = now.with_timezone(&self.zone).format("%Y-%m-%d").to_string();
        if state.day != today {
            state.day = today;
            state.daily_count = 0;
        }

        if state.daily_count >= self.rpd {
            return Err(ExpenseOpsError::DailyQuotaExceeded {
                provider: self.provider.clone(),
            });
        }

        let cutoff = now - chrono::Duration::from_std(WINDOW).expect("window fits");
        state.timestamps.retain(|t| *t > cutoff);

        if state.timestamps.len() >= self.rpm as usize {
            let oldest = state.timestamps[0];
            let free_at = oldest + chrono::Duration::from_std(WINDOW).expect("window fits");
            let delay = (free_at - now).to_std().unwrap_or(Duration::from_millis(50));
            drop(guard);
            return Ok(Admission::Wait(delay + Duration::from_millis(50)));
        }

        state.timestamps.push(now);
        state.daily_count += 1;
        self.persist_state(&state);
        Ok(Admission::Admitted)
    }

    fn load_state(&self) -> RateLimiterState {
        match std::fs::read_to_string(&self.state_path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => RateLimiterState::default(),
        }
    }

    fn persist_state(&self, state: &RateLimiterState) {
        // A full disk must not deny every future call
        let result = serde_json::to_string(state)
            .map_err(std::io::Error::other)
            .and_then(|contents| std::fs::write(&self.state_path, contents));
        if let Err(e) = result {
            warn!(provider = %self.provider, error = %e, "failed to persist limiter state");
        }
    }
}

fn acquire_write_lock(
    lock: &mut FileRwLock<std::fs::File>,
    timeout: Duration,
) -> Result<fd_lock::RwLockWriteGuard<'_, std::fs::File>> {
    let deadline = Instant::now() + timeout;
    // fd-lock has no timed acquire; poll try_write until the deadline.
    // The borrow checker can't see that only the final, successful try_write()
    // call's guard escapes the loop, so the loop only decides *when* to stop
    // polling and the guard itself is obtained by a single call after it.
    loop {
        match lock.try_write() {
            Ok(_) => break,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(ExpenseOpsError::internal(format!(
                    "rate limiter lock not acquired within {:?}: {}",
                    timeout, e
                )))
            }
        }
    }
    lock.try_write().map_err(|e| {
        ExpenseOpsError::internal(format!(
            "rate limiter lock not acquired within {:?}: {}",
            timeout, e
        ))
    })
}

/// Pre-constructed limiters keyed by provider, built once at startup
#[derive(Clone, Default)]
pub struct RateLimiterRegistry {
    limiters: HashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, limiter: RateLimiter) {
        self.limiters
            .insert(limiter.provider.clone(), Arc::new(limiter));
    }

    pub fn get(&self, provider: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(provider).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(dir: &std::path::Path, rpm: u32, rpd: u32) -> RateLimiter {
        RateLimiter::new(
            dir.to_path_buf(),
            "test-provider",
            rpm,
            rpd,
            AuditLogger::disabled(),
        )
    }

    #[test]
    fn test_admits_up_to_rpm_then_waits() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(dir.path(), 3, 100);

        for _ in 0..3 {
            assert!(matches!(limiter.admit_once().unwrap(), Admission::Admitted));
        }
        match limiter.admit_once().unwrap() {
            Admission::Wait(delay) => {
                assert!(delay <= WINDOW + Duration::from_secs(1));
                assert!(delay > Duration::from_secs(55));
            }
            Admission::Admitted => panic!("fourth call must wait"),
        }
    }

    #[test]
    fn test_daily_quota_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(dir.path(), 100, 2);

        assert!(matches!(limiter.admit_once().unwrap(), Admission::Admitted));
        assert!(matches!(limiter.admit_once().unwrap(), Admission::Admitted));
        let err = limiter.admit_once().unwrap_err();
        assert!(matches!(err, ExpenseOpsError::DailyQuotaExceeded { .. }));
    }

    #[test]
    fn test_day_rollover_resets_counter() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(dir.path(), 100, 2);

        let stale = RateLimiterState {
            timestamps: Vec::new(),
            daily_count: 2,
            day: "1999-12-31".to_string(),
        };
        std::fs::write(
            dir.path().join("rate_limiter_test-provider.json"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        assert!(matches!(limiter.admit_once().unwrap(), Admission::Admitted));
        let state: RateLimiterState = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("rate_limiter_test-provider.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(state.daily_count, 1);
        assert_ne!(state.day, "1999-12-31");
    }

    #[test]
    fn test_state_shared_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let first = limiter(dir.path(), 2, 100);
        let second = limiter(dir.path(), 2, 100);

        assert!(matches!(first.admit_once().unwrap(), Admission::Admitted));
        assert!(matches!(second.admit_once().unwrap(), Admission::Admitted));
        assert!(matches!(first.admit_once().unwrap(), Admission::Wait(_)));
    }

    #[test]
    fn test_corrupt_state_treated_as_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rate_limiter_test-provider.json"), "{oops").unwrap();
        let limiter = limiter(dir.path(), 2, 100);
        assert!(matches!(limiter.admit_once().unwrap(), Admission::Admitted));
    }
}

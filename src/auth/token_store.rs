//! Single-file persistence for the OAuth token bundle.
//!
//! Writes are atomic (temp file + rename in the same directory) and guarded
//! by a cooperative lock file so a CLI invocation and a long-running server
//! on the same host cannot interleave writes.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use fd_lock::RwLock as FileRwLock;
use serde::{Deserialize, Serialize};

use crate::domain::{ExpenseOpsError, Result};

/// Persisted OAuth material for one QuickBooks company
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,

    pub refresh_token: String,

    pub access_token_issued_at: DateTime<Utc>,

    /// Seconds the access token is valid from issue
    pub access_token_lifetime_secs: i64,

    pub refresh_token_issued_at: DateTime<Utc>,

    /// Seconds the refresh token is valid from issue (typically months)
    pub refresh_token_lifetime_secs: i64,

    /// QuickBooks company (realm) identifier
    pub company_id: String,
}

impl TokenBundle {
    pub fn access_expires_at(&self) -> DateTime<Utc> {
        self.access_token_issued_at + Duration::seconds(self.access_token_lifetime_secs)
    }

    pub fn refresh_expires_at(&self) -> DateTime<Utc> {
        self.refresh_token_issued_at + Duration::seconds(self.refresh_token_lifetime_secs)
    }

    /// A bundle is stale once `now` reaches expiry minus the refresh skew,
    /// or when the access token is empty.
    pub fn is_stale(&self, skew: Duration, now: DateTime<Utc>) -> bool {
        self.access_token.is_empty() || now >= self.access_expires_at() - skew
    }

    pub fn refresh_token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_expires_at()
    }
}

/// File-backed store for the token bundle
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current bundle; `None` when no authorization has happened yet
    pub fn load(&self) -> Result<Option<TokenBundle>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let bundle = serde_json::from_str(&contents)?;
                Ok(Some(bundle))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the bundle on disk.
    ///
    /// Temp file and rename stay within the same directory, so the replace is
    /// atomic on POSIX filesystems; a lock file serializes concurrent writers
    /// across processes. File mode is 0600.
    pub fn save(&self, bundle: &TokenBundle) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| ExpenseOpsError::internal("token path has no parent directory"))?;
        std::fs::create_dir_all(dir)?;

        let lock_path = dir.join("tokens.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        let mut lock = FileRwLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|e| ExpenseOpsError::internal(format!("token lock: {}", e)))?;

        let tmp_path = dir.join(format!(".tokens.json.tmp-{}", std::process::id()));
        let contents = serde_json::to_string_pretty(bundle)?;
        std::fs::write(&tmp_path, contents)?;
        restrict_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle() -> TokenBundle {
        TokenBundle {
            access_token: "at-1".to_string(),
            refresh_token: "rt-1".to_string(),
            access_token_issued_at: Utc::now(),
            access_token_lifetime_secs: 3600,
            refresh_token_issued_at: Utc::now(),
            refresh_token_lifetime_secs: 8_726_400,
            company_id: "9130350000000000".to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        let bundle = sample_bundle();

        store.save(&bundle).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, bundle);
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        let mut bundle = sample_bundle();
        store.save(&bundle).unwrap();

        bundle.access_token = "at-2".to_string();
        bundle.refresh_token = "rt-2".to_string();
        store.save(&bundle).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, "at-2");
        assert_eq!(loaded.refresh_token, "rt-2");
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        store.save(&sample_bundle()).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_staleness_window() {
        let mut bundle = sample_bundle();
        let now = Utc::now();
        bundle.access_token_issued_at = now;
        bundle.access_token_lifetime_secs = 3600;

        let skew = Duration::minutes(5);
        assert!(!bundle.is_stale(skew, now));
        assert!(bundle.is_stale(skew, now + Duration::seconds(3600 - 299)));
        assert!(bundle.is_stale(skew, now + Duration::seconds(3601)));

        bundle.access_token = String::new();
        assert!(bundle.is_stale(skew, now));
    }
}

//! Integrity lockfile: records the content hash of every backend this
//! gateway has ever fetched, so a subsequent fetch that disagrees with
//! the recorded hash is surfaced as a pending approval rather than
//! silently executed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{BackendFqdn, BackendType, LockfileEntry};

#[derive(Debug, thiserror::Error)]
pub enum LockfileError {
    #[error("failed to read lockfile at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write lockfile at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lockfile at {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LockfileDocument {
    entries: HashMap<String, LockfileEntry>,
}

/// Outcome of checking a freshly-fetched backend against the lockfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// No prior record; the entry was created and is trusted on first use.
    FirstSeen,
    /// Hash matches the recorded entry.
    Unchanged,
    /// Hash disagrees with the recorded entry — caller must route this
    /// through the pending-approval flow before trusting the backend.
    Changed { previous_integrity: String },
}

pub struct Lockfile {
    path: PathBuf,
    entries: HashMap<String, LockfileEntry>,
}

impl Lockfile {
    /// Load the lockfile from `path`, treating a missing file as an empty
    /// one (first run).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LockfileError> {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<LockfileDocument>(&raw)
                .map_err(|source| LockfileError::Parse { path: path.clone(), source })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LockfileDocument::default(),
            Err(source) => return Err(LockfileError::Read { path, source }),
        };
        Ok(Self { path, entries: doc.entries })
    }

    /// Writes through a sibling temp file and `rename`s it into place so a
    /// crash or a concurrent writer never leaves a truncated lockfile on
    /// disk.
    pub fn save(&self) -> Result<(), LockfileError> {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let doc = LockfileDocument { entries: self.entries.clone() };
        let raw = serde_json::to_string_pretty(&doc).expect("lockfile document is always serializable");

        let tmp_path = self.path.with_extension(format!(
            "{}.tmp-{}",
            self.path.extension().and_then(|e| e.to_str()).unwrap_or("lock"),
            Uuid::new_v4()
        ));
        std::fs::write(&tmp_path, raw).map_err(|source| LockfileError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| LockfileError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn entry(&self, fqdn: &BackendFqdn) -> Option<&LockfileEntry> {
        self.entries.get(&fqdn.base())
    }

    /// Compare a freshly-computed integrity hash against the recorded
    /// entry (keyed by the fqdn's 4-segment base, ignoring any
    /// content-hash suffix) and record the result.
    pub fn check_and_record(
        &mut self,
        fqdn: &BackendFqdn,
        integrity: impl Into<String>,
        backend_type: BackendType,
        now: DateTime<Utc>,
    ) -> IntegrityCheck {
        let integrity = integrity.into();
        let key = fqdn.base();

        match self.entries.get_mut(&key) {
            None => {
                info!(backend = %key, "recording new backend integrity entry");
                self.entries.insert(
                    key,
                    LockfileEntry {
                        fqdn: fqdn.clone(),
                        integrity,
                        fetched_at: now,
                        last_validated_at: now,
                        backend_type,
                        approved: true,
                    },
                );
                IntegrityCheck::FirstSeen
            }
            Some(entry) if entry.integrity == integrity => {
                entry.last_validated_at = now;
                IntegrityCheck::Unchanged
            }
            Some(entry) => {
                let previous_integrity = entry.integrity.clone();
                warn!(
                    backend = %key,
                    previous = %previous_integrity,
                    current = %integrity,
                    "backend integrity hash changed since last fetch"
                );
                entry.integrity = integrity;
                entry.fetched_at = now;
                entry.last_validated_at = now;
                entry.approved = false;
                IntegrityCheck::Changed { previous_integrity }
            }
        }
    }

    /// Mark a changed entry as user-approved, unblocking subsequent fetches
    /// of the same hash.
    pub fn approve(&mut self, fqdn: &BackendFqdn) {
        if let Some(entry) = self.entries.get_mut(&fqdn.base()) {
            entry.approved = true;
        }
    }

    pub fn is_approved(&self, fqdn: &BackendFqdn) -> bool {
        self.entries.get(&fqdn.base()).map(|e| e.approved).unwrap_or(false)
    }

    /// Drop entries older than `max_age` once at least `keep` newer entries
    /// exist, so the lockfile doesn't grow unboundedly across a long-lived
    /// gateway's lifetime.
    pub fn gc(&mut self, keep: usize, max_age: Duration, now: DateTime<Utc>) -> usize {
        if self.entries.len() <= keep {
            return 0;
        }
        let cutoff = now - max_age;
        let mut ordered: Vec<&String> = self.entries.keys().collect();
        ordered.sort_by_key(|k| self.entries[*k].last_validated_at);

        let removable = ordered.len().saturating_sub(keep);
        let to_remove: Vec<String> = ordered
            .into_iter()
            .take(removable)
            .filter(|k| self.entries[*k].last_validated_at < cutoff)
            .cloned()
            .collect();

        for key in &to_remove {
            self.entries.remove(key);
        }
        to_remove.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn default_path(workspace: &Path) -> PathBuf {
    pml_commons::paths::lockfile_path(workspace)
}

//! Durable per-profile runner records
//!
//! Provides the keyed store every component reads and writes through:
//! - `get` never fails for an unknown profile, it yields a default record
//! - `update` merges a partial patch atomically per key
//! - `list` returns every known record
//!
//! Two backends are available: an in-memory map and a JSON file that is
//! re-read on every call and rewritten atomically (temp file + rename) after
//! every update.

use crate::error::PersistenceError;
use crate::types::{ProfileId, RunnerState, RunnerStatePatch};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Keyed store of runner records
#[async_trait]
pub trait RunnerStateStore: Send + Sync + Debug {
    /// Current record, or a default one if the profile is unknown
    async fn get(&self, profile: &ProfileId) -> Result<RunnerState, PersistenceError>;

    /// Merge `patch` into the profile's record and return the result
    async fn update(
        &self,
        profile: &ProfileId,
        patch: RunnerStatePatch,
    ) -> Result<RunnerState, PersistenceError>;

    /// Every stored record, ordered by profile id
    async fn list(&self) -> Result<Vec<RunnerState>, PersistenceError>;
}

/// Apply a patch under the map's per-key lock
fn merge(
    records: &DashMap<ProfileId, RunnerState>,
    profile: &ProfileId,
    patch: &RunnerStatePatch,
) -> RunnerState {
    let mut entry = records
        .entry(profile.clone())
        .or_insert_with(|| RunnerState::new(profile.clone()));
    entry.apply(patch);
    entry.updated_at = Some(Utc::now());
    entry.clone()
}

fn sorted(records: &DashMap<ProfileId, RunnerState>) -> Vec<RunnerState> {
    let mut out: Vec<RunnerState> = records.iter().map(|e| e.value().clone()).collect();
    out.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
    out
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: DashMap<ProfileId, RunnerState>,
}

impl MemoryStateStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunnerStateStore for MemoryStateStore {
    async fn get(&self, profile: &ProfileId) -> Result<RunnerState, PersistenceError> {
        Ok(self
            .records
            .get(profile)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| RunnerState::new(profile.clone())))
    }

    async fn update(
        &self,
        profile: &ProfileId,
        patch: RunnerStatePatch,
    ) -> Result<RunnerState, PersistenceError> {
        Ok(merge(&self.records, profile, &patch))
    }

    async fn list(&self) -> Result<Vec<RunnerState>, PersistenceError> {
        Ok(sorted(&self.records))
    }
}

/// On-disk document layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    profiles: BTreeMap<ProfileId, RunnerState>,
}

/// JSON-file backed store
///
/// The file is the only source of truth, so records written by another
/// process (the CLI pausing a profile, say) are seen on the next read and are
/// never overwritten wholesale. `update` re-reads the document, merges the
/// patch into the one record it targets and renames a fresh copy into place.
/// A failed write leaves the file untouched.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Open the store at `path`, checking any existing file is a state document
    ///
    /// # Errors
    /// - `PersistenceError::Io` if the file or its directory is unreadable
    /// - `PersistenceError::Serialization` if the file is not a state document
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let doc = read_document(&path).await?;

        tracing::debug!(
            path = %path.display(),
            profiles = doc.profiles.len(),
            "state store opened"
        );

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the backing file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, doc: &StateDocument) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(doc)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", std::process::id()));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

async fn read_document(path: &Path) -> Result<StateDocument, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(StateDocument::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateDocument::default()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl RunnerStateStore for FileStateStore {
    async fn get(&self, profile: &ProfileId) -> Result<RunnerState, PersistenceError> {
        let mut doc = read_document(&self.path).await?;
        Ok(doc
            .profiles
            .remove(profile)
            .unwrap_or_else(|| RunnerState::new(profile.clone())))
    }

    async fn update(
        &self,
        profile: &ProfileId,
        patch: RunnerStatePatch,
    ) -> Result<RunnerState, PersistenceError> {
        let _guard = self.write_lock.lock().await;

        let mut doc = read_document(&self.path).await?;
        let record = doc
            .profiles
            .entry(profile.clone())
            .or_insert_with(|| RunnerState::new(profile.clone()));
        record.apply(&patch);
        record.updated_at = Some(Utc::now());
        let merged = record.clone();

        if let Err(e) = self.save(&doc).await {
            tracing::error!(profile = %profile, error = %e, "failed to persist runner state");
            return Err(e);
        }
        Ok(merged)
    }

    async fn list(&self) -> Result<Vec<RunnerState>, PersistenceError> {
        let doc = read_document(&self.path).await?;
        Ok(doc.profiles.into_values().collect())
    }
}

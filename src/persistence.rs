//! Crash-safe snapshots of scheduler state.
//!
//! The state file is a JSON array `[flags, {job_id: job}]`. It is written to a
//! sibling temp file and renamed into place so a crash mid-write leaves the
//! previous snapshot intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};
use crate::scheduler::RenderJob;

/// Bumped whenever the persisted job layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalFlags {
    pub autostart: bool,
    pub verbose: bool,
    pub schema_version: u32,
}

impl GlobalFlags {
    pub fn new(autostart: bool, verbose: bool) -> Self {
        Self {
            autostart,
            verbose,
            schema_version: SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot(pub GlobalFlags, pub BTreeMap<String, RenderJob>);

impl Snapshot {
    pub fn flags(&self) -> GlobalFlags {
        self.0
    }

    pub fn jobs(&self) -> &BTreeMap<String, RenderJob> {
        &self.1
    }

    pub fn into_jobs(self) -> BTreeMap<String, RenderJob> {
        self.1
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let body = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| ControllerError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            ControllerError::Persistence(format!("rename to {}: {}", self.path.display(), e))
        })?;

        tracing::debug!(path = %self.path.display(), jobs = snapshot.jobs().len(), "State saved");
        Ok(())
    }

    /// Read the snapshot, if there is a usable one.
    ///
    /// A missing file is a normal first start. A file that does not parse or was
    /// written by another schema version is logged and ignored.
    pub async fn load(&self) -> Option<Snapshot> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No saved state found");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read saved state");
                return None;
            }
        };

        let snapshot: Snapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Saved state is corrupt or outdated, starting empty"
                );
                return None;
            }
        };

        if snapshot.flags().schema_version != SCHEMA_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                found = snapshot.flags().schema_version,
                expected = SCHEMA_VERSION,
                "Saved state schema version mismatch, starting empty"
            );
            return None;
        }

        tracing::info!(path = %self.path.display(), jobs = snapshot.jobs().len(), "Saved state loaded");
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{EnqueueParams, Priority};

    #[tokio::test]
    async fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("serverstate.json"));
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn save_then_load_keeps_flags_and_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("a.blend");
        std::fs::write(&project, b"").unwrap();
        let universe = vec!["n1".to_string()];
        let params = EnqueueParams::new(project.to_str().unwrap(), 1, 3, &["n1"])
            .with_priority(Priority::High);
        let job = RenderJob::new("job1", params, &universe).unwrap();

        let store = StateStore::new(dir.path().join("state").join("serverstate.json"));
        let mut jobs = BTreeMap::new();
        jobs.insert("job1".to_string(), job);
        store.save(&Snapshot(GlobalFlags::new(false, true), jobs)).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.flags(), GlobalFlags::new(false, true));
        let job = &loaded.jobs()["job1"];
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.total_frames(), 3);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn schema_mismatch_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serverstate.json");
        std::fs::write(
            &path,
            r#"[{"autostart": true, "verbose": false, "schema_version": 999}, {}]"#,
        )
        .unwrap();
        assert!(StateStore::new(&path).load().await.is_none());
    }

    #[tokio::test]
    async fn legacy_layout_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serverstate.json");
        std::fs::write(&path, r#"[{"verbose": 0, "autostart": 1}, {"1": ["/a.blend", 1, 5]}]"#)
            .unwrap();
        assert!(StateStore::new(&path).load().await.is_none());
    }
}

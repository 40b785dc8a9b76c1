//! Object-storage interface for run artifacts and per-response artefacts.
//!
//! The pipeline only depends on the trait; the filesystem backend here
//! mirrors the blob keyspace layout:
//!
//! ```text
//! live/blueprints/{configId}/{runLabel}_{safeTimestamp}_comparison.json
//! live/blueprints/{configId}/{runLabel}_{safeTimestamp}/responses/{promptId}/{safeModelId}.json
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::artifact::safe_model_id;
use crate::error::{Error, Result};

/// Storage collaborator used by the artifact writer and the run cloner.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Persist the main run document. All-or-nothing: a partial write is a
    /// failure.
    async fn save_result(&self, config_id: &str, file_name: &str, payload: &Value)
        -> Result<String>;

    async fn get_result_by_file_name(
        &self,
        config_id: &str,
        file_name: &str,
    ) -> Result<Option<Value>>;

    /// Persist one per-response artefact under the run's `responses/` keyspace.
    async fn save_response_artifact(
        &self,
        config_id: &str,
        run_label: &str,
        safe_timestamp: &str,
        prompt_id: &str,
        model_id: &str,
        payload: &Value,
    ) -> Result<String>;

    /// Read back one per-response artefact's coverage slice.
    async fn get_coverage_result(
        &self,
        config_id: &str,
        run_label: &str,
        safe_timestamp: &str,
        prompt_id: &str,
        model_id: &str,
    ) -> Result<Option<Value>>;

    async fn list_config_ids(&self) -> Result<Vec<String>>;

    /// File names of the runs stored for one config, unsorted.
    async fn list_runs_for_config(&self, config_id: &str) -> Result<Vec<String>>;
}

/// Filesystem-backed store rooted at a directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn config_dir(&self, config_id: &str) -> PathBuf {
        self.root.join("live").join("blueprints").join(config_id)
    }

    fn response_path(
        &self,
        config_id: &str,
        run_label: &str,
        safe_timestamp: &str,
        prompt_id: &str,
        model_id: &str,
    ) -> PathBuf {
        self.config_dir(config_id)
            .join(format!("{run_label}_{safe_timestamp}"))
            .join("responses")
            .join(prompt_id)
            .join(format!("{}.json", safe_model_id(model_id)))
    }

    fn write_atomic(path: &Path, payload: &Value) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("no parent for {}", path.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Storage(format!("create {}: {e}", parent.display())))?;

        // Write to a sibling temp file, then rename into place.
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string(payload)?;
        std::fs::write(&tmp, text)
            .map_err(|e| Error::Storage(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::Storage(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    fn read_json(path: &Path) -> Result<Option<Value>> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("read {}: {e}", path.display()))),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn save_result(
        &self,
        config_id: &str,
        file_name: &str,
        payload: &Value,
    ) -> Result<String> {
        let path = self.config_dir(config_id).join(file_name);
        Self::write_atomic(&path, payload)?;
        debug!(path = %path.display(), "saved run artifact");
        Ok(format!("live/blueprints/{config_id}/{file_name}"))
    }

    async fn get_result_by_file_name(
        &self,
        config_id: &str,
        file_name: &str,
    ) -> Result<Option<Value>> {
        Self::read_json(&self.config_dir(config_id).join(file_name))
    }

    async fn save_response_artifact(
        &self,
        config_id: &str,
        run_label: &str,
        safe_timestamp: &str,
        prompt_id: &str,
        model_id: &str,
        payload: &Value,
    ) -> Result<String> {
        let path = self.response_path(config_id, run_label, safe_timestamp, prompt_id, model_id);
        Self::write_atomic(&path, payload)?;
        Ok(format!(
            "live/blueprints/{config_id}/{run_label}_{safe_timestamp}/responses/{prompt_id}/{}.json",
            safe_model_id(model_id)
        ))
    }

    async fn get_coverage_result(
        &self,
        config_id: &str,
        run_label: &str,
        safe_timestamp: &str,
        prompt_id: &str,
        model_id: &str,
    ) -> Result<Option<Value>> {
        let path = self.response_path(config_id, run_label, safe_timestamp, prompt_id, model_id);
        let Some(artefact) = Self::read_json(&path)? else {
            return Ok(None);
        };
        Ok(artefact.get("coverage").cloned().filter(|v| !v.is_null()))
    }

    async fn list_config_ids(&self) -> Result<Vec<String>> {
        let dir = self.root.join("live").join("blueprints");
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(Error::Storage(format!("read {}: {e}", dir.display()))),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
            if entry.path().is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(ids)
    }

    async fn list_runs_for_config(&self, config_id: &str) -> Result<Vec<String>> {
        let dir = self.config_dir(config_id);
        let mut runs = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(Error::Storage(format!("read {}: {e}", dir.display()))),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with("_comparison.json") {
                runs.push(name);
            }
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn result_roundtrip() {
        let (_dir, store) = store();
        let payload = json!({"runLabel": "abc123", "configId": "bp"});

        let key = store
            .save_result("bp", "abc123_2026-08-01T00-00-00-000Z_comparison.json", &payload)
            .await
            .unwrap();
        assert_eq!(
            key,
            "live/blueprints/bp/abc123_2026-08-01T00-00-00-000Z_comparison.json"
        );

        let loaded = store
            .get_result_by_file_name("bp", "abc123_2026-08-01T00-00-00-000Z_comparison.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, payload);

        assert!(store
            .get_result_by_file_name("bp", "missing.json")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn response_artifact_keys_use_safe_model_ids() {
        let (dir, store) = store();
        let payload = json!({"finalAssistantResponseText": "A", "coverage": {"keyPointsCount": 1}});

        let key = store
            .save_response_artifact("bp", "abc", "ts", "p1", "openai:m[temp:0.0]", &payload)
            .await
            .unwrap();
        assert_eq!(
            key,
            "live/blueprints/bp/abc_ts/responses/p1/openai_m_temp_0.0_.json"
        );
        assert!(dir
            .path()
            .join("live/blueprints/bp/abc_ts/responses/p1/openai_m_temp_0.0_.json")
            .exists());

        let coverage = store
            .get_coverage_result("bp", "abc", "ts", "p1", "openai:m[temp:0.0]")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coverage["keyPointsCount"], 1);

        assert!(store
            .get_coverage_result("bp", "abc", "ts", "p2", "openai:m[temp:0.0]")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn listings() {
        let (_dir, store) = store();
        assert!(store.list_config_ids().await.unwrap().is_empty());

        store
            .save_result("bp-a", "l1_t1_comparison.json", &json!({}))
            .await
            .unwrap();
        store
            .save_result("bp-a", "l2_t2_comparison.json", &json!({}))
            .await
            .unwrap();
        store
            .save_result("bp-b", "l3_t3_comparison.json", &json!({}))
            .await
            .unwrap();

        let mut configs = store.list_config_ids().await.unwrap();
        configs.sort();
        assert_eq!(configs, vec!["bp-a".to_string(), "bp-b".to_string()]);

        let mut runs = store.list_runs_for_config("bp-a").await.unwrap();
        runs.sort();
        assert_eq!(
            runs,
            vec![
                "l1_t1_comparison.json".to_string(),
                "l2_t2_comparison.json".to_string()
            ]
        );
        assert!(store.list_runs_for_config("missing").await.unwrap().is_empty());
    }
}

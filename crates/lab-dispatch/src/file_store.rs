use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{TrialId, WorkFn};
use crate::store::{check_rebind, Store};

const BINDINGS_FILE: &str = "bindings.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct BindingDocument {
    schema_version: String,
    bindings: BTreeMap<TrialId, BindingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BindingEntry {
    work_fn: String,
    bound_at: String,
}

/// Directory-backed store. All bindings live in one JSON document that is
/// replaced atomically on every write.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    uri: String,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let uri = format!("file://{}", root.display());
        Self {
            root,
            uri,
            write_lock: Mutex::new(()),
        }
    }

    fn bindings_path(&self) -> PathBuf {
        self.root.join(BINDINGS_FILE)
    }

    async fn load(&self) -> Result<BindingDocument, StoreError> {
        let path = self.bindings_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BindingDocument {
                    schema_version: "trial_bindings_v1".to_string(),
                    bindings: BTreeMap::new(),
                })
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }
}

async fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp).await.map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_err(e));
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
    Ok(())
}

#[async_trait]
impl Store for FileStore {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn add_trial_run_fn(
        &self,
        trial_ids: &[TrialId],
        work_fn: &WorkFn,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        for id in trial_ids {
            check_rebind(
                id,
                doc.bindings.get(id).map(|e| e.work_fn.as_str()),
                work_fn,
            )?;
        }
        let bound_at = Utc::now().to_rfc3339();
        for id in trial_ids {
            doc.bindings
                .entry(id.clone())
                .or_insert_with(|| BindingEntry {
                    work_fn: work_fn.name.clone(),
                    bound_at: bound_at.clone(),
                });
        }
        let path = self.bindings_path();
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|source| StoreError::Encode {
                path: path.clone(),
                source,
            })?;
        atomic_write_bytes(&path, &bytes).await
    }

    async fn trial_run_fn(&self, trial_id: &TrialId) -> Result<Option<WorkFn>, StoreError> {
        let doc = self.load().await?;
        Ok(doc
            .bindings
            .get(trial_id)
            .map(|e| WorkFn::named(e.work_fn.clone())))
    }
}

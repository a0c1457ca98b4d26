use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;
use crate::model::{TrialId, WorkFn};

/// The shared trial store as seen by the dispatcher.
#[async_trait]
pub trait Store: Send + Sync {
    /// Default connection descriptor handed to runners.
    fn uri(&self) -> &str;

    /// Binds every trial id to `work_fn`. Either all bindings are persisted or
    /// none are.
    async fn add_trial_run_fn(
        &self,
        trial_ids: &[TrialId],
        work_fn: &WorkFn,
    ) -> Result<(), StoreError>;

    async fn trial_run_fn(&self, trial_id: &TrialId) -> Result<Option<WorkFn>, StoreError>;
}

pub(crate) fn check_rebind(
    trial_id: &TrialId,
    existing: Option<&str>,
    work_fn: &WorkFn,
) -> Result<(), StoreError> {
    match existing {
        Some(bound) if bound != work_fn.name => Err(StoreError::AlreadyBound {
            trial_id: trial_id.clone(),
            bound: bound.to_string(),
            requested: work_fn.name.clone(),
        }),
        _ => Ok(()),
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    uri: String,
    bindings: RwLock<HashMap<TrialId, WorkFn>>,
}

impl MemoryStore {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory://")
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn add_trial_run_fn(
        &self,
        trial_ids: &[TrialId],
        work_fn: &WorkFn,
    ) -> Result<(), StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in trial_ids {
            check_rebind(id, bindings.get(id).map(|f| f.name.as_str()), work_fn)?;
        }
        for id in trial_ids {
            bindings.insert(id.clone(), work_fn.clone());
        }
        Ok(())
    }

    async fn trial_run_fn(&self, trial_id: &TrialId) -> Result<Option<WorkFn>, StoreError> {
        let bindings = self
            .bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(bindings.get(trial_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<TrialId> {
        raw.iter().map(|s| TrialId::new(*s)).collect()
    }

    #[tokio::test]
    async fn binds_and_resolves() {
        let store = MemoryStore::default();
        let f = WorkFn::named("fit_ebm");
        store
            .add_trial_run_fn(&ids(&["t1", "t2"]), &f)
            .await
            .expect("bind");
        assert_eq!(
            store.trial_run_fn(&TrialId::new("t2")).await.unwrap(),
            Some(f)
        );
        assert_eq!(store.trial_run_fn(&TrialId::new("t9")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn same_fn_rebind_is_idempotent() {
        let store = MemoryStore::default();
        let f = WorkFn::named("fit_ebm");
        store.add_trial_run_fn(&ids(&["t1"]), &f).await.unwrap();
        store.add_trial_run_fn(&ids(&["t1"]), &f).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_rebind_writes_nothing() {
        let store = MemoryStore::default();
        store
            .add_trial_run_fn(&ids(&["t2"]), &WorkFn::named("fit_ebm"))
            .await
            .unwrap();
        let err = store
            .add_trial_run_fn(&ids(&["t1", "t2", "t3"]), &WorkFn::named("fit_lgbm"))
            .await
            .expect_err("conflict");
        assert!(matches!(err, StoreError::AlreadyBound { .. }));
        assert_eq!(store.trial_run_fn(&TrialId::new("t1")).await.unwrap(), None);
        assert_eq!(store.trial_run_fn(&TrialId::new("t3")).await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }
}

use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{DispatchError, StoreError};
use crate::model::{Trial, TrialId, WorkFn};
use crate::store::Store;

#[derive(Clone)]
pub struct SubmissionRecord {
    store: Arc<dyn Store>,
}

impl SubmissionRecord {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Persists `work_fn` for every trial in one store call.
    pub async fn record(&self, work_fn: &WorkFn, trials: &[Trial]) -> Result<usize, DispatchError> {
        if trials.is_empty() {
            return Err(DispatchError::NoTrials);
        }
        let mut seen = BTreeSet::new();
        let mut ids = Vec::with_capacity(trials.len());
        for trial in trials {
            if !seen.insert(&trial.id) {
                return Err(DispatchError::DuplicateTrial(trial.id.clone()));
            }
            ids.push(trial.id.clone());
        }
        self.store.add_trial_run_fn(&ids, work_fn).await?;
        Ok(ids.len())
    }

    pub async fn resolve(&self, trial_id: &TrialId) -> Result<Option<WorkFn>, StoreError> {
        self.store.trial_run_fn(trial_id).await
    }
}

pub type TrialRunFn = Arc<dyn Fn(&Trial) -> Result<()> + Send + Sync>;

// Runners resolve a persisted work fn name through a registry built from the
// same code as the dispatcher's.
#[derive(Default, Clone)]
pub struct WorkFnRegistry {
    fns: HashMap<String, TrialRunFn>,
}

impl WorkFnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Trial) -> Result<()> + Send + Sync + 'static,
    {
        self.fns.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn get(&self, work_fn: &WorkFn) -> Option<TrialRunFn> {
        self.fns.get(&work_fn.name).cloned()
    }

    /// Runs the function a persisted binding names against `trial`.
    pub fn run(&self, work_fn: &WorkFn, trial: &Trial) -> Result<()> {
        let f = self
            .get(work_fn)
            .ok_or_else(|| anyhow!("work fn not registered: {}", work_fn.name))?;
        f(trial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn trials(raw: &[&str]) -> Vec<Trial> {
        raw.iter().map(|s| Trial::new(*s)).collect()
    }

    #[tokio::test]
    async fn runner_side_resolves_what_dispatcher_recorded() {
        let store = Arc::new(MemoryStore::default());
        let record = SubmissionRecord::new(store.clone());
        let fit = WorkFn::named("fit_ebm");
        let n = record
            .record(&fit, &trials(&["t1", "t2", "t3"]))
            .await
            .expect("record");
        assert_eq!(n, 3);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = WorkFnRegistry::new().register("fit_ebm", move |_trial| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // a separate handle on the same store, as a runner process would have
        let runner_side = SubmissionRecord::new(store);
        for trial in trials(&["t1", "t3"]) {
            let bound = runner_side
                .resolve(&trial.id)
                .await
                .expect("lookup")
                .expect("bound");
            registry.run(&bound, &trial).expect("run");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejects_empty_and_duplicate_submissions() {
        let store = Arc::new(MemoryStore::default());
        let record = SubmissionRecord::new(store.clone());
        let fit = WorkFn::named("fit_ebm");
        assert!(matches!(
            record.record(&fit, &[]).await,
            Err(DispatchError::NoTrials)
        ));
        match record.record(&fit, &trials(&["t1", "t2", "t1"])).await {
            Err(DispatchError::DuplicateTrial(id)) => assert_eq!(id.as_str(), "t1"),
            other => panic!("expected duplicate error, got {:?}", other),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_work_fn_is_an_error() {
        let registry = WorkFnRegistry::new();
        let err = registry
            .run(&WorkFn::named("missing"), &Trial::new("t1"))
            .expect_err("unregistered");
        assert!(err.to_string().contains("missing"));
    }
}

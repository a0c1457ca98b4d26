use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::IsolationBackend;
use crate::config::DispatchConfig;
use crate::docker::DockerCli;
use crate::error::{DispatchError, LaunchError, LaunchFailure};
use crate::launcher::Launcher;
use crate::model::{
    ExperimentId, LaunchAssignment, OutcomeCode, RunnerId, RunnerReport, Submission, Trial,
    WorkFn,
};
use crate::partition::partition;
use crate::record::SubmissionRecord;
use crate::sink::{LogSink, OutcomeSink};
use crate::store::Store;

type HandleKey = (ExperimentId, RunnerId);

#[derive(Debug)]
pub struct RunnerHandle {
    experiment_id: ExperimentId,
    runner_id: RunnerId,
    task: JoinHandle<Result<OutcomeCode, LaunchFailure>>,
}

impl RunnerHandle {
    pub fn experiment_id(&self) -> &ExperimentId {
        &self.experiment_id
    }

    pub fn runner_id(&self) -> RunnerId {
        self.runner_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> RunnerReport {
        let result = match self.task.await {
            Ok(result) => result,
            Err(err) => Err(LaunchFailure {
                experiment_id: self.experiment_id.clone(),
                runner_id: self.runner_id,
                error: LaunchError::Panicked(err.to_string()),
            }),
        };
        RunnerReport {
            experiment_id: self.experiment_id,
            runner_id: self.runner_id,
            result,
        }
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    store: Arc<dyn Store>,
    record: SubmissionRecord,
    launcher: Arc<Launcher>,
    sink: Arc<dyn OutcomeSink>,
    pool: Arc<Semaphore>,
    pool_size: usize,
    submit_lock: tokio::sync::Mutex<()>,
    handles: Mutex<BTreeMap<HandleKey, RunnerHandle>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn Store>,
        backend: Arc<dyn IsolationBackend>,
    ) -> Self {
        let pool_size = config.pool_size();
        let launcher = Launcher::new(backend).with_entrypoint(config.entrypoint.clone());
        Self {
            record: SubmissionRecord::new(Arc::clone(&store)),
            store,
            launcher: Arc::new(launcher),
            sink: Arc::new(LogSink),
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            submit_lock: tokio::sync::Mutex::new(()),
            handles: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    /// A dispatcher that launches runners as local docker containers.
    pub fn docker(config: DispatchConfig, store: Arc<dyn Store>) -> Self {
        let backend = Arc::new(DockerCli::new(config.docker_program.clone()));
        Self::new(config, store, backend)
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn image(&self) -> &str {
        &self.config.image
    }

    pub fn db_uri_override(&self) -> Option<&str> {
        self.config.db_uri.as_deref()
    }

    pub fn max_runners(&self) -> Option<usize> {
        self.config.max_runners
    }

    pub fn raise_exception(&self) -> bool {
        self.config.raise_exception
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn idle_slots(&self) -> usize {
        self.pool.available_permits()
    }

    /// The descriptor every runner of a submission receives.
    pub fn connection_uri(&self) -> String {
        self.config
            .db_uri
            .clone()
            .unwrap_or_else(|| self.store.uri().to_string())
    }

    /// Returns once launches are queued. Nothing is launched if the binding
    /// cannot be persisted.
    pub async fn submit(
        &self,
        experiment_id: &ExperimentId,
        work_fn: &WorkFn,
        trials: &[Trial],
        timeout: Option<Duration>,
    ) -> Result<Submission, DispatchError> {
        let _serial = self.submit_lock.lock().await;
        let connection_uri = self.connection_uri();
        self.record.record(work_fn, trials).await?;

        let n_runners = partition(trials.len(), self.config.max_runners);
        info!(
            experiment_id = %experiment_id,
            trials = trials.len(),
            runners = n_runners,
            pool_size = self.pool_size,
            work_fn = %work_fn.name,
            "dispatching experiment"
        );

        let spawned: Vec<RunnerHandle> = (0..n_runners)
            .map(|runner_id| {
                self.spawn_runner(LaunchAssignment {
                    experiment_id: experiment_id.clone(),
                    runner_id,
                    connection_uri: connection_uri.clone(),
                    timeout,
                    raise_exception: self.config.raise_exception,
                    image: self.config.image.clone(),
                })
            })
            .collect();

        let mut handles = self.lock_handles();
        for handle in spawned {
            let key = (handle.experiment_id.clone(), handle.runner_id);
            if handles.insert(key, handle).is_some() {
                debug!(
                    experiment_id = %experiment_id,
                    "replaced handle from an earlier submission; its runner keeps its slot"
                );
            }
        }

        Ok(Submission {
            experiment_id: experiment_id.clone(),
            runner_ids: (0..n_runners).collect(),
            connection_uri,
        })
    }

    fn spawn_runner(&self, assignment: LaunchAssignment) -> RunnerHandle {
        let pool = Arc::clone(&self.pool);
        let launcher = Arc::clone(&self.launcher);
        let sink = Arc::clone(&self.sink);
        let experiment_id = assignment.experiment_id.clone();
        let runner_id = assignment.runner_id;
        let task = tokio::spawn(async move {
            let experiment_id = assignment.experiment_id.clone();
            let runner_id = assignment.runner_id;
            match run_in_slot(pool, launcher, assignment).await {
                Ok(code) => {
                    info!(
                        experiment_id = %experiment_id,
                        runner_id,
                        exit_code = code.0,
                        "runner finished"
                    );
                    Ok(code)
                }
                Err(error) => {
                    let failure = LaunchFailure {
                        experiment_id,
                        runner_id,
                        error,
                    };
                    sink.on_failure(&failure);
                    Err(failure)
                }
            }
        });
        RunnerHandle {
            experiment_id,
            runner_id,
            task,
        }
    }

    fn lock_handles(&self) -> MutexGuard<'_, BTreeMap<HandleKey, RunnerHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn runner_ids(&self, experiment_id: &ExperimentId) -> Vec<RunnerId> {
        self.lock_handles()
            .keys()
            .filter(|(exp, _)| exp == experiment_id)
            .map(|(_, runner_id)| *runner_id)
            .collect()
    }

    /// `None` when no handle is retained for the runner.
    pub fn is_finished(&self, experiment_id: &ExperimentId, runner_id: RunnerId) -> Option<bool> {
        self.lock_handles()
            .get(&(experiment_id.clone(), runner_id))
            .map(RunnerHandle::is_finished)
    }

    pub fn take_handle(
        &self,
        experiment_id: &ExperimentId,
        runner_id: RunnerId,
    ) -> Option<RunnerHandle> {
        self.lock_handles().remove(&(experiment_id.clone(), runner_id))
    }

    pub async fn join(&self) -> Vec<RunnerReport> {
        let handles = std::mem::take(&mut *self.lock_handles());
        let mut reports = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            reports.push(handle.wait().await);
        }
        reports
    }
}

async fn run_in_slot(
    pool: Arc<Semaphore>,
    launcher: Arc<Launcher>,
    assignment: LaunchAssignment,
) -> Result<OutcomeCode, LaunchError> {
    let _permit = pool
        .acquire_owned()
        .await
        .map_err(|_| LaunchError::PoolClosed)?;
    // Launch in its own task so a panic comes back as a JoinError.
    let launch = tokio::spawn(async move { launcher.launch(&assignment).await });
    match launch.await {
        Ok(result) => result,
        Err(err) => Err(LaunchError::Panicked(err.to_string())),
    }
}

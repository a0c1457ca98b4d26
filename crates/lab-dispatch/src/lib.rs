pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod docker;
pub mod error;
pub mod file_store;
pub mod launcher;
pub mod model;
pub mod partition;
pub mod record;
pub mod sink;
pub mod store;

pub use backend::{IsolationBackend, NetworkMode, UnitId, UnitSpec};
pub use config::DispatchConfig;
pub use dispatcher::{Dispatcher, RunnerHandle};
pub use docker::DockerCli;
pub use error::{BackendError, DispatchError, LaunchError, LaunchFailure, StoreError};
pub use file_store::FileStore;
pub use launcher::Launcher;
pub use model::{
    ExperimentId, LaunchAssignment, OutcomeCode, RunnerId, RunnerReport, Submission, Trial,
    TrialId, WorkFn,
};
pub use partition::{host_parallelism, partition};
pub use record::{SubmissionRecord, WorkFnRegistry};
pub use sink::{LogSink, OutcomeSink, RecordingSink};
pub use store::{MemoryStore, Store};

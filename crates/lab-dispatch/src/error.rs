use std::path::PathBuf;
use thiserror::Error;

use crate::model::{ExperimentId, RunnerId, TrialId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt binding document {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode binding document {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("trial {trial_id} is already bound to work fn '{bound}', refusing '{requested}'")]
    AlreadyBound {
        trial_id: TrialId,
        bound: String,
        requested: String,
    },
}

/// Errors returned synchronously from `submit`; nothing has been launched when
/// one of these comes back.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("submit requires at least one trial")]
    NoTrials,
    #[error("duplicate trial id in submission: {0}")]
    DuplicateTrial(TrialId),
    #[error("failed to persist work fn binding: {0}")]
    Binding(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("isolation backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to spawn `{program}`: {message}")]
    Spawn { program: String, message: String },
    #[error("`{program} {op}` exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        op: String,
        status: String,
        stderr: String,
    },
    #[error("could not parse exit code from {0:?}")]
    BadExitCode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("failed to create execution unit: {0}")]
    Create(#[source] BackendError),
    #[error("failed waiting on unit {unit}: {source}")]
    Wait {
        unit: String,
        #[source]
        source: BackendError,
    },
    #[error("unit {unit} exited with {code} but could not be removed: {source}")]
    Remove {
        unit: String,
        code: i64,
        #[source]
        source: BackendError,
    },
    #[error("runner exited with {code}")]
    RunnerFailed { code: i64 },
    #[error("launch task panicked: {0}")]
    Panicked(String),
    #[error("worker pool closed before launch")]
    PoolClosed,
}

/// A launch error tagged with the runner it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("experiment {experiment_id} runner {runner_id}: {error}")]
pub struct LaunchFailure {
    pub experiment_id: ExperimentId,
    pub runner_id: RunnerId,
    #[source]
    pub error: LaunchError,
}

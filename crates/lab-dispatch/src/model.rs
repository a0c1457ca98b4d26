use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::LaunchFailure;

pub type RunnerId = usize;

pub const ENV_EXPERIMENT_ID: &str = "EXPERIMENT_ID";
pub const ENV_RUNNER_ID: &str = "RUNNER_ID";
pub const ENV_DB_URL: &str = "DB_URL";
pub const ENV_TIMEOUT: &str = "TIMEOUT";
pub const ENV_RAISE_EXCEPTION: &str = "RAISE_EXCEPTION";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(String);

impl TrialId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of work. Only its id ever leaves the dispatching process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
}

impl Trial {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TrialId::new(id),
        }
    }
}

/// Serializable reference to a work function registered by name in a
/// [`WorkFnRegistry`](crate::record::WorkFnRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkFn {
    pub name: String,
}

impl WorkFn {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutcomeCode(pub i64);

impl OutcomeCode {
    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a single isolated execution context is told about its work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchAssignment {
    pub experiment_id: ExperimentId,
    pub runner_id: RunnerId,
    pub connection_uri: String,
    pub timeout: Option<Duration>,
    pub raise_exception: bool,
    pub image: String,
}

impl LaunchAssignment {
    /// The five variables the in-context runner reads on startup. Names and
    /// key set are fixed; `TIMEOUT` is whole seconds with `0` meaning unbounded.
    pub fn environment(&self) -> Vec<(String, String)> {
        let timeout = self.timeout.map(timeout_seconds).unwrap_or(0);
        let raise = if self.raise_exception { "True" } else { "False" };
        vec![
            (ENV_EXPERIMENT_ID.to_string(), self.experiment_id.to_string()),
            (ENV_RUNNER_ID.to_string(), self.runner_id.to_string()),
            (ENV_DB_URL.to_string(), self.connection_uri.clone()),
            (ENV_TIMEOUT.to_string(), timeout.to_string()),
            (ENV_RAISE_EXCEPTION.to_string(), raise.to_string()),
        ]
    }
}

// Rounds up so a bounded timeout never renders as the unbounded `0`.
fn timeout_seconds(timeout: Duration) -> u64 {
    timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub experiment_id: ExperimentId,
    pub runner_ids: Vec<RunnerId>,
    pub connection_uri: String,
}

#[derive(Debug, Clone)]
pub struct RunnerReport {
    pub experiment_id: ExperimentId,
    pub runner_id: RunnerId,
    pub result: Result<OutcomeCode, LaunchFailure>,
}

impl RunnerReport {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(code) if code.is_success())
    }
}

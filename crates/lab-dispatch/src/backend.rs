use async_trait::async_trait;
use std::fmt;

use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Host,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Host => "host",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    /// Unique name assigned before creation; a unit that fails to start can
    /// still be removed by it.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub network: NetworkMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitId(pub String);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates, reaps and removes isolated execution units.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Creates the unit and starts it without waiting for it to finish. A unit
    /// that was created but failed to start is removed before returning.
    async fn run_detached(&self, spec: &UnitSpec) -> Result<UnitId, BackendError>;

    /// Blocks until the unit terminates and returns its exit code.
    async fn wait(&self, unit: &UnitId) -> Result<i64, BackendError>;

    async fn remove(&self, unit: &UnitId) -> Result<(), BackendError>;
}

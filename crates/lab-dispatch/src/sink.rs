use std::sync::Mutex;
use tracing::error;

use crate::error::LaunchFailure;

/// Receives launches that ended in an error instead of an outcome code.
/// Implementations must not panic; they run on the runner's own task.
pub trait OutcomeSink: Send + Sync {
    fn on_failure(&self, failure: &LaunchFailure);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl OutcomeSink for LogSink {
    fn on_failure(&self, failure: &LaunchFailure) {
        error!(
            experiment_id = %failure.experiment_id,
            runner_id = failure.runner_id,
            error = %failure.error,
            "runner launch failed"
        );
    }
}

/// Logs like [`LogSink`] and keeps every failure for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    failures: Mutex<Vec<LaunchFailure>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<LaunchFailure> {
        self.failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.failures().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutcomeSink for RecordingSink {
    fn on_failure(&self, failure: &LaunchFailure) {
        LogSink.on_failure(failure);
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(failure.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchError;
    use crate::model::ExperimentId;

    #[test]
    fn recording_sink_keeps_failures_in_order() {
        let sink = RecordingSink::new();
        for runner_id in [2, 0] {
            sink.on_failure(&LaunchFailure {
                experiment_id: ExperimentId::new("exp_1"),
                runner_id,
                error: LaunchError::PoolClosed,
            });
        }
        let ids: Vec<_> = sink.failures().iter().map(|f| f.runner_id).collect();
        assert_eq!(ids, vec![2, 0]);
    }
}

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{IsolationBackend, NetworkMode, UnitSpec};
use crate::error::LaunchError;
use crate::model::{LaunchAssignment, OutcomeCode};

pub fn default_entrypoint() -> Vec<String> {
    vec![
        "python".to_string(),
        "-m".to_string(),
        "powerlift.run".to_string(),
    ]
}

/// Runs one assignment in one isolated unit and reaps it.
#[derive(Clone)]
pub struct Launcher {
    backend: Arc<dyn IsolationBackend>,
    entrypoint: Vec<String>,
}

impl Launcher {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            backend,
            entrypoint: default_entrypoint(),
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    pub fn unit_spec(&self, assignment: &LaunchAssignment) -> UnitSpec {
        UnitSpec {
            name: unit_name(assignment),
            image: assignment.image.clone(),
            command: self.entrypoint.clone(),
            env: assignment.environment(),
            network: NetworkMode::Host,
        }
    }

    /// Blocks for the full life of the unit. The unit is removed whether or
    /// not its exit code could be read.
    pub async fn launch(&self, assignment: &LaunchAssignment) -> Result<OutcomeCode, LaunchError> {
        let spec = self.unit_spec(assignment);
        let unit = self
            .backend
            .run_detached(&spec)
            .await
            .map_err(LaunchError::Create)?;
        debug!(
            experiment_id = %assignment.experiment_id,
            runner_id = assignment.runner_id,
            unit = %unit,
            "unit running"
        );

        let backend = Arc::clone(&self.backend);
        let waiting = unit.clone();
        let waited = tokio::spawn(async move { backend.wait(&waiting).await }).await;
        let removed = self.backend.remove(&unit).await;

        let code = match waited {
            Ok(result) => result.map_err(|source| LaunchError::Wait {
                unit: unit.to_string(),
                source,
            })?,
            Err(err) => return Err(LaunchError::Panicked(err.to_string())),
        };
        if let Err(source) = removed {
            return Err(LaunchError::Remove {
                unit: unit.to_string(),
                code,
                source,
            });
        }

        let outcome = OutcomeCode(code);
        if !outcome.is_success() {
            if assignment.raise_exception {
                return Err(LaunchError::RunnerFailed { code });
            }
            warn!(
                experiment_id = %assignment.experiment_id,
                runner_id = assignment.runner_id,
                exit_code = code,
                "runner exited non-zero"
            );
        }
        Ok(outcome)
    }
}

/// `lab-<experiment>-<runner>-<micros>`, restricted to the characters docker
/// accepts in container names.
fn unit_name(assignment: &LaunchAssignment) -> String {
    let experiment: String = assignment
        .experiment_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "lab-{}-{}-{}",
        experiment,
        assignment.runner_id,
        Utc::now().timestamp_micros()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UnitId;
    use crate::error::BackendError;
    use crate::model::ExperimentId;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedBackend {
        fail_create: bool,
        fail_wait: bool,
        fail_remove: bool,
        panic_wait: bool,
        exit_code: i64,
        calls: Mutex<Vec<String>>,
        specs: Mutex<Vec<UnitSpec>>,
    }

    #[async_trait]
    impl IsolationBackend for ScriptedBackend {
        async fn run_detached(&self, spec: &UnitSpec) -> Result<UnitId, BackendError> {
            self.calls.lock().unwrap().push("run".to_string());
            self.specs.lock().unwrap().push(spec.clone());
            if self.fail_create {
                return Err(BackendError::Unavailable("daemon down".to_string()));
            }
            Ok(UnitId("c0ffee".to_string()))
        }

        async fn wait(&self, _unit: &UnitId) -> Result<i64, BackendError> {
            self.calls.lock().unwrap().push("wait".to_string());
            if self.panic_wait {
                panic!("wait blew up");
            }
            if self.fail_wait {
                return Err(BackendError::BadExitCode("".to_string()));
            }
            Ok(self.exit_code)
        }

        async fn remove(&self, unit: &UnitId) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("rm {}", unit));
            if self.fail_remove {
                return Err(BackendError::Unavailable("daemon down".to_string()));
            }
            Ok(())
        }
    }

    fn assignment(raise_exception: bool) -> LaunchAssignment {
        LaunchAssignment {
            experiment_id: ExperimentId::new("exp_1"),
            runner_id: 0,
            connection_uri: "postgresql://localhost/bench".to_string(),
            timeout: None,
            raise_exception,
            image: "interpretml/powerlift:0.1.11".to_string(),
        }
    }

    #[tokio::test]
    async fn runs_waits_and_removes() {
        let backend = Arc::new(ScriptedBackend::default());
        let launcher = Launcher::new(backend.clone());
        let code = launcher.launch(&assignment(false)).await.expect("launch");
        assert_eq!(code, OutcomeCode(0));
        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec!["run", "wait", "rm c0ffee"]
        );
        let specs = backend.specs.lock().unwrap();
        assert_eq!(specs[0].network, NetworkMode::Host);
        assert_eq!(specs[0].command, default_entrypoint());
        assert_eq!(specs[0].env.len(), 5);
    }

    #[tokio::test]
    async fn create_failure_never_waits() {
        let backend = Arc::new(ScriptedBackend {
            fail_create: true,
            ..Default::default()
        });
        let err = Launcher::new(backend.clone())
            .launch(&assignment(false))
            .await
            .expect_err("create fails");
        assert!(matches!(err, LaunchError::Create(BackendError::Unavailable(_))));
        assert_eq!(*backend.calls.lock().unwrap(), vec!["run"]);
    }

    #[tokio::test]
    async fn wait_failure_still_removes_unit() {
        let backend = Arc::new(ScriptedBackend {
            fail_wait: true,
            ..Default::default()
        });
        let err = Launcher::new(backend.clone())
            .launch(&assignment(false))
            .await
            .expect_err("wait fails");
        assert!(matches!(err, LaunchError::Wait { .. }));
        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec!["run", "wait", "rm c0ffee"]
        );
    }

    #[tokio::test]
    async fn panicking_wait_still_removes_unit() {
        let backend = Arc::new(ScriptedBackend {
            panic_wait: true,
            ..Default::default()
        });
        let err = Launcher::new(backend.clone())
            .launch(&assignment(false))
            .await
            .expect_err("wait panics");
        assert!(matches!(err, LaunchError::Panicked(_)));
        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec!["run", "wait", "rm c0ffee"]
        );
    }

    #[test]
    fn unit_names_are_docker_safe() {
        let mut a = assignment(false);
        a.experiment_id = ExperimentId::new("adult income/ebm:v2");
        a.runner_id = 4;
        let name = Launcher::new(Arc::new(ScriptedBackend::default()))
            .unit_spec(&a)
            .name;
        assert!(name.starts_with("lab-adult_income_ebm_v2-4-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
    }

    #[tokio::test]
    async fn remove_failure_keeps_exit_code() {
        let backend = Arc::new(ScriptedBackend {
            fail_remove: true,
            exit_code: 3,
            ..Default::default()
        });
        let err = Launcher::new(backend)
            .launch(&assignment(false))
            .await
            .expect_err("rm fails");
        match err {
            LaunchError::Remove { code, unit, .. } => {
                assert_eq!(code, 3);
                assert_eq!(unit, "c0ffee");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_respects_failure_policy() {
        let backend = Arc::new(ScriptedBackend {
            exit_code: 1,
            ..Default::default()
        });
        let launcher = Launcher::new(backend);
        assert_eq!(
            launcher.launch(&assignment(false)).await.expect("swallowed"),
            OutcomeCode(1)
        );
        assert_eq!(
            launcher.launch(&assignment(true)).await.expect_err("raised"),
            LaunchError::RunnerFailed { code: 1 }
        );
    }
}

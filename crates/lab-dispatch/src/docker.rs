use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::{IsolationBackend, UnitId, UnitSpec};
use crate::error::BackendError;

// Env values go through the client's environment and are forwarded by name
// (`-e KEY`), keeping them off argument lists.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run_command(&self, spec: &UnitSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(run_args(spec));
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    async fn output(&self, op: &str, mut cmd: Command) -> Result<Output, BackendError> {
        cmd.kill_on_drop(true);
        let output = cmd.output().await.map_err(|e| BackendError::Spawn {
            program: self.program.clone(),
            message: e.to_string(),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BackendError::CommandFailed {
                program: self.program.clone(),
                op: op.to_string(),
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr,
            });
        }
        Ok(output)
    }
}

fn run_args(spec: &UnitSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.as_str().to_string(),
    ];
    for (key, _) in &spec.env {
        args.push("-e".to_string());
        args.push(key.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn parse_exit_code(stdout: &[u8]) -> Result<i64, BackendError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    line.parse::<i64>()
        .map_err(|_| BackendError::BadExitCode(line.to_string()))
}

#[async_trait]
impl IsolationBackend for DockerCli {
    async fn run_detached(&self, spec: &UnitSpec) -> Result<UnitId, BackendError> {
        let output = match self.output("run", self.run_command(spec)).await {
            Ok(output) => output,
            Err(err @ BackendError::CommandFailed { .. }) => {
                // `run` may have created the container before failing to start it.
                if let Err(rm_err) = self.remove(&UnitId(spec.name.clone())).await {
                    debug!(
                        container = %spec.name,
                        error = %rm_err,
                        "no container left to remove"
                    );
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            warn!(container = %spec.name, "docker run returned no container id");
            return Ok(UnitId(spec.name.clone()));
        }
        debug!(container = %id, image = %spec.image, "container started");
        Ok(UnitId(id))
    }

    async fn wait(&self, unit: &UnitId) -> Result<i64, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("wait").arg(&unit.0);
        let output = self.output("wait", cmd).await?;
        parse_exit_code(&output.stdout)
    }

    async fn remove(&self, unit: &UnitId) -> Result<(), BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("rm").arg("--force").arg(&unit.0);
        self.output("rm", cmd).await.map(|_| ())
    }
}

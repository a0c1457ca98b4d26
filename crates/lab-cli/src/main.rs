use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use lab_dispatch::{
    DispatchConfig, Dispatcher, ExperimentId, FileStore, RecordingSink, RunnerReport, Store,
    Trial, TrialId, WorkFn,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lab", version = "0.3.0", about = "AgentLab trial dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Submit {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        work_fn: String,
        #[arg(long = "trial")]
        trials: Vec<String>,
        #[arg(long)]
        trials_file: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        max_runners: Option<usize>,
        #[arg(long)]
        db_uri: Option<String>,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        #[arg(long)]
        raise_exception: bool,
        #[arg(long)]
        json: bool,
    },
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Binding {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        trial: String,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command).await {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok") == Some(&Value::Bool(false)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Submit {
            store,
            experiment,
            work_fn,
            trials,
            trials_file,
            config,
            image,
            max_runners,
            db_uri,
            timeout_seconds,
            raise_exception,
            json,
        } => {
            let mut config = resolve_config(config.as_deref())?;
            if let Some(image) = image {
                config.image = image;
            }
            if max_runners.is_some() {
                config.max_runners = max_runners;
            }
            if db_uri.is_some() {
                config.db_uri = db_uri;
            }
            config.raise_exception |= raise_exception;
            config.validate()?;

            let mut trial_ids = trials;
            if let Some(path) = trials_file {
                trial_ids.extend(load_trial_ids(&path)?);
            }
            let trials: Vec<Trial> = trial_ids.into_iter().map(Trial::new).collect();

            let sink = Arc::new(RecordingSink::new());
            let dispatcher =
                Dispatcher::docker(config, Arc::new(FileStore::new(store))).with_sink(sink.clone());
            let experiment_id = ExperimentId::new(experiment);
            let submission = dispatcher
                .submit(
                    &experiment_id,
                    &WorkFn::named(work_fn),
                    &trials,
                    timeout_seconds.map(Duration::from_secs),
                )
                .await?;
            let reports = dispatcher.join().await;
            let failed = summarize(&experiment_id, &reports, sink.len());

            if json {
                return Ok(Some(json!({
                    "ok": failed == 0,
                    "command": "submit",
                    "experiment": submission.experiment_id.as_str(),
                    "trials": trials.len(),
                    "image": dispatcher.image(),
                    "pool_size": dispatcher.pool_size(),
                    "connection_uri_overridden": dispatcher.db_uri_override().is_some(),
                    "runners": reports.iter().map(report_to_json).collect::<Vec<_>>(),
                    "launch_failures": sink.len(),
                })));
            }
            println!("experiment: {}", submission.experiment_id);
            println!("trials: {}", trials.len());
            println!("image: {}", dispatcher.image());
            println!("pool_size: {}", dispatcher.pool_size());
            for report in &reports {
                println!("{}", report_line(report));
            }
            if failed > 0 {
                return Err(anyhow!(
                    "{} of {} runners failed ({} launch failures)",
                    failed,
                    reports.len(),
                    sink.len()
                ));
            }
        }
        Commands::Config { config, json } => {
            let config = resolve_config(config.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "config",
                    "config": config_to_json(&config),
                })));
            }
            println!("image: {}", config.image);
            println!("entrypoint: {:?}", config.entrypoint);
            match config.max_runners {
                Some(n) => println!("max_runners: {}", n),
                None => println!("max_runners: host ({})", config.pool_size()),
            }
            println!("db_uri_override: {}", config.db_uri.is_some());
            println!("raise_exception: {}", config.raise_exception);
            println!("docker: {}", config.docker_program);
        }
        Commands::Binding { store, trial, json } => {
            let store = FileStore::new(store);
            let bound = store.trial_run_fn(&TrialId::new(trial.clone())).await?;
            if json {
                return Ok(Some(json!({
                    "ok": bound.is_some(),
                    "command": "binding",
                    "trial": trial,
                    "work_fn": bound.as_ref().map(|f| f.name.clone()),
                })));
            }
            match bound {
                Some(f) => println!("{}: {}", trial, f.name),
                None => return Err(anyhow!("trial {} has no work fn binding", trial)),
            }
        }
    }
    Ok(None)
}

fn resolve_config(path: Option<&Path>) -> Result<DispatchConfig> {
    let base = match path {
        Some(p) => DispatchConfig::load(p)?,
        None => DispatchConfig::default(),
    };
    base.with_env_overrides()
}

/// Accepts a JSON array of trial ids or of objects with an `id` field.
fn load_trial_ids(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let value: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    let items = value
        .as_array()
        .ok_or_else(|| anyhow!("{} must contain a JSON array", path.display()))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .or_else(|| item.get("id").and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow!("trial entry without id: {}", item))
        })
        .collect()
}

/// Logs the outcome of a joined submission and returns the failed runner count.
fn summarize(
    experiment_id: &ExperimentId,
    reports: &[RunnerReport],
    launch_failures: usize,
) -> usize {
    let failed = reports.iter().filter(|r| !r.succeeded()).count();
    if failed == 0 {
        info!(
            experiment_id = %experiment_id,
            runners = reports.len(),
            "submission finished"
        );
    } else {
        warn!(
            experiment_id = %experiment_id,
            runners = reports.len(),
            failed,
            launch_failures,
            "submission finished with failures"
        );
    }
    failed
}

fn report_line(report: &RunnerReport) -> String {
    match &report.result {
        Ok(code) => format!("runner {}: exit {}", report.runner_id, code),
        Err(failure) => format!("runner {}: failed: {}", report.runner_id, failure.error),
    }
}

fn report_to_json(report: &RunnerReport) -> Value {
    match &report.result {
        Ok(code) => json!({
            "runner_id": report.runner_id,
            "exit_code": code.0,
            "ok": code.is_success(),
        }),
        Err(failure) => json!({
            "runner_id": report.runner_id,
            "ok": false,
            "error": failure.error.to_string(),
        }),
    }
}

fn config_to_json(config: &DispatchConfig) -> Value {
    json!({
        "image": config.image,
        "entrypoint": config.entrypoint,
        "max_runners": config.max_runners,
        "pool_size": config.pool_size(),
        "db_uri_override": config.db_uri.is_some(),
        "raise_exception": config.raise_exception,
        "docker": config.docker_program,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Submit { json, .. }
        | Commands::Config { json, .. }
        | Commands::Binding { json, .. } => *json,
    }
}

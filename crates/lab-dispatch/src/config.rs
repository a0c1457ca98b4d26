use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::launcher::default_entrypoint;
use crate::partition::host_parallelism;

pub const DEFAULT_IMAGE: &str = "interpretml/powerlift:0.1.11";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub image: String,
    pub entrypoint: Vec<String>,
    /// Maximum number of units running at once; host parallelism when unset.
    pub max_runners: Option<usize>,
    /// Connection descriptor handed to runners instead of the store's own.
    pub db_uri: Option<String>,
    pub raise_exception: bool,
    pub docker_program: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            entrypoint: default_entrypoint(),
            max_runners: None,
            db_uri: None,
            raise_exception: false,
            docker_program: "docker".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading dispatch config {}", path.display()))?;
        let config: DispatchConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing dispatch config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        self.apply_env(&vars)
    }

    /// Applies `LAB_*` overrides from `vars`.
    pub fn apply_env(mut self, vars: &HashMap<String, String>) -> Result<Self> {
        if let Some(image) = vars.get("LAB_IMAGE") {
            self.image = image.clone();
        }
        if let Some(raw) = vars.get("LAB_MAX_RUNNERS") {
            let n = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| anyhow!("LAB_MAX_RUNNERS must be a positive integer, got {:?}", raw))?;
            self.max_runners = Some(n);
        }
        if let Some(uri) = vars.get("LAB_DB_URI") {
            self.db_uri = Some(uri.clone());
        }
        if let Some(raw) = vars.get("LAB_RAISE_EXCEPTION") {
            self.raise_exception = parse_flag(raw)
                .ok_or_else(|| anyhow!("LAB_RAISE_EXCEPTION must be a boolean, got {:?}", raw))?;
        }
        if let Some(program) = vars.get("LAB_DOCKER") {
            self.docker_program = program.clone();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_runners == Some(0) {
            return Err(anyhow!("max_runners must be at least 1"));
        }
        if self.image.trim().is_empty() {
            return Err(anyhow!("image must not be empty"));
        }
        if self.entrypoint.is_empty() {
            return Err(anyhow!("entrypoint must not be empty"));
        }
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.max_runners.unwrap_or_else(host_parallelism).max(1)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config: DispatchConfig =
            serde_yaml::from_str("max_runners: 4\ndb_uri: postgresql://db/bench\n").unwrap();
        assert_eq!(config.max_runners, Some(4));
        assert_eq!(config.db_uri.as_deref(), Some("postgresql://db/bench"));
        assert_eq!(config.image, DEFAULT_IMAGE);
        assert_eq!(config.entrypoint, default_entrypoint());
        assert!(!config.raise_exception);
        assert_eq!(config.pool_size(), 4);
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        assert!(serde_yaml::from_str::<DispatchConfig>("n_cpus: 4\n").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let config = DispatchConfig::default()
            .apply_env(&vars(&[
                ("LAB_IMAGE", "bench:dev"),
                ("LAB_MAX_RUNNERS", "2"),
                ("LAB_RAISE_EXCEPTION", "true"),
                ("LAB_DB_URI", "postgresql://host/db"),
            ]))
            .expect("valid env");
        assert_eq!(config.image, "bench:dev");
        assert_eq!(config.max_runners, Some(2));
        assert!(config.raise_exception);
        assert_eq!(config.db_uri.as_deref(), Some("postgresql://host/db"));
    }

    #[test]
    fn invalid_env_values_are_errors() {
        assert!(DispatchConfig::default()
            .apply_env(&vars(&[("LAB_MAX_RUNNERS", "many")]))
            .is_err());
        assert!(DispatchConfig::default()
            .apply_env(&vars(&[("LAB_MAX_RUNNERS", "0")]))
            .is_err());
        assert!(DispatchConfig::default()
            .apply_env(&vars(&[("LAB_RAISE_EXCEPTION", "maybe")]))
            .is_err());
    }

    #[test]
    fn default_pool_size_follows_host() {
        assert_eq!(DispatchConfig::default().pool_size(), host_parallelism());
    }

    #[test]
    fn load_reads_yaml_file() {
        let path = std::env::temp_dir().join(format!(
            "lab_dispatch_config_{}_{}.yaml",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::write(&path, "image: bench:ci\nraise_exception: true\n").unwrap();
        let config = DispatchConfig::load(&path).expect("load");
        assert_eq!(config.image, "bench:ci");
        assert!(config.raise_exception);
        let _ = fs::remove_file(path);
    }
}

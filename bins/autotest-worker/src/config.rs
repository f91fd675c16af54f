// Worker configuration, loaded once at startup and shared read-only
use crate::rlimit::ResourceLimitPolicy;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/autotest.json";

/// Inclusive port range handed to one identity's tests through `PORT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// Extra per-identity resources exposed to tests as environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityResources {
    #[serde(default)]
    pub port: Option<PortRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub user: String,
    #[serde(default)]
    pub queues: Vec<String>,
    #[serde(default)]
    pub resources: IdentityResources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Root under which `workers/<identity>` workspaces are created.
    pub workspace: PathBuf,
    pub workers: Vec<IdentityConfig>,
    #[serde(default)]
    pub rlimit_settings: ResourceLimitPolicy,
    /// Shared scratch directories swept for files left by an identity.
    #[serde(default = "default_scratch_dirs")]
    pub scratch_dirs: Vec<PathBuf>,
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
    /// Number of jobs processed at once; defaults to the number of identities.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Base requirements installed into every provisioned Python environment.
    #[serde(default)]
    pub python_requirements: Option<PathBuf>,
    /// JUnit console launcher used by the Java tester.
    #[serde(default)]
    pub junit_jar: Option<PathBuf>,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_scratch_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/tmp")]
}

fn default_result_ttl() -> u64 {
    autotest_common::redis::RESULT_TTL_SECONDS
}

impl WorkerConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Worker config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let mut config: WorkerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from `AUTOTEST_CONFIG`, falling back to config/autotest.json
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("AUTOTEST_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            bail!("At least one worker user must be configured");
        }
        for worker in &self.workers {
            if worker.user.trim().is_empty() {
                bail!("Worker user names cannot be empty");
            }
            if let Some(port) = &worker.resources.port {
                if port.min > port.max {
                    bail!("Invalid port range for {}: {} > {}", worker.user, port.min, port.max);
                }
            }
        }
        // Surface unknown limit names at startup rather than on the first job.
        self.rlimit_settings
            .resolve_current()
            .context("Invalid rlimit_settings")?;
        Ok(())
    }

    /// Every queue any identity listens on, without duplicates
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for queue in self.workers.iter().flat_map(|w| w.queues.iter()) {
            if !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        queues
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(self.workers.len()).max(1)
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.workspace.join("workers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = write_config(
            r#"{
                "workspace": "/home/docker/.autotesting",
                "workers": [
                    {"user": "autotst0", "queues": ["high", "low"]},
                    {"user": "autotst1", "queues": ["low"], "resources": {"port": {"min": 5000, "max": 5010}}}
                ],
                "rlimit_settings": {"nproc": [300, 300]}
            }"#,
        );

        let config = WorkerConfig::load(file.path()).unwrap();

        assert_eq!(config.queues(), vec!["high".to_string(), "low".to_string()]);
        assert_eq!(config.concurrency(), 2);
        assert_eq!(config.result_ttl_secs, 3600);
        assert_eq!(config.scratch_dirs, vec![PathBuf::from("/tmp")]);
        assert_eq!(config.workers_dir(), PathBuf::from("/home/docker/.autotesting/workers"));
        assert!(config.workers[1].resources.port.is_some());
    }

    #[test]
    fn test_missing_file() {
        let err = WorkerConfig::load(Path::new("/nonexistent/autotest.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_rejects_unknown_limit() {
        let file = write_config(
            r#"{"workspace": "/w", "workers": [{"user": "a"}], "rlimit_settings": {"bananas": [1, 1]}}"#,
        );
        assert!(WorkerConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_rejects_empty_pool() {
        let file = write_config(r#"{"workspace": "/w", "workers": []}"#);
        assert!(WorkerConfig::load(file.path()).is_err());
    }
}

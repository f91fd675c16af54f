// Interpreter environments for testers that need one, created by the worker
// before any tester process starts.
use anyhow::{Context, Result, bail};
use autotest_common::types::TesterSettings;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, instrument};

const DEFAULT_PYTHON_VERSION: &str = "3";

/// Whether testers of this type run inside a Python environment.
pub fn needs_environment(tester_type: &str) -> bool {
    matches!(tester_type, "py" | "jupyter")
}

pub struct EnvironmentProvisioner {
    /// Requirements file installed into every environment.
    base_requirements: Option<PathBuf>,
}

impl EnvironmentProvisioner {
    pub fn new(base_requirements: Option<PathBuf>) -> Self {
        Self { base_requirements }
    }

    /// Return the `_env` variables for `tester`, creating an environment at
    /// `<workspace>/.autotest_env_<index>` when none was provided.
    #[instrument(skip(self, tester, workspace, files_dir), fields(tester_type = %tester.tester_type))]
    pub async fn ensure(
        &self,
        tester: &TesterSettings,
        index: usize,
        workspace: &Path,
        files_dir: Option<&Path>,
    ) -> Result<BTreeMap<String, String>> {
        let mut env = tester.env.clone();
        if !needs_environment(&tester.tester_type) || env.contains_key("PYTHON") {
            return Ok(env);
        }

        let env_dir = workspace.join(format!(".autotest_env_{}", index));
        let version = tester
            .env_data
            .python_version
            .as_deref()
            .unwrap_or(DEFAULT_PYTHON_VERSION);

        run(
            Command::new(format!("python{}", version))
                .args(["-m", "venv", "--clear"])
                .arg(&env_dir),
        )
        .await
        .context("create tester environment failed")?;

        let mut install = Command::new(env_dir.join("bin").join("pip"));
        install.arg("install").arg("wheel");
        if let Some(requirements) = &self.base_requirements {
            install.arg("-r").arg(requirements);
        }
        if let Some(extra) = &tester.env_data.pip_requirements {
            install.args(extra.split_whitespace());
        }
        if let Some(file) = tester.env_data.pip_requirements_file.as_deref().filter(|f| !f.is_empty()) {
            let Some(files_dir) = files_dir else {
                bail!("create tester environment failed:\nno assignment files for {}", file);
            };
            install.arg("-r").arg(files_dir.join(file));
        }
        run(&mut install).await.context("create tester environment failed")?;

        let python = env_dir.join("bin").join("python3");
        info!(python = %python.display(), "Tester environment ready");
        env.insert("PYTHON".to_string(), python.to_string_lossy().into_owned());
        Ok(env)
    }
}

async fn run(cmd: &mut Command) -> Result<()> {
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to start {:?}", cmd.as_std().get_program()))?;
    if !output.status.success() {
        bail!(
            "{:?} exited with {}\nDetails (captured stderr):\n{}",
            cmd.as_std().get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

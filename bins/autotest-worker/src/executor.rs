/// Tester process execution
///
/// **Responsibility:**
/// Launch one tester child per test group, as the job's identity, in the
/// job's workspace, with resource limits installed, and collect what it
/// printed.
///
/// The child is this same binary running its `tester` subcommand; it reads
/// its specs from stdin. This module knows nothing about:
/// - How a tester judges submissions (testers/)
/// - How output becomes a group result (report.rs)

use crate::config::PortRange;
use crate::identity::WorkerIdentity;
use crate::rlimit::{self, PolicyError, ResolvedLimit, ResourceLimitPolicy};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use autotest_common::types::TesterSpecs;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// How long to wait for output pipes to close after killing a tester.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// One test group to run.
pub struct GroupRequest<'a> {
    pub identity: &'a WorkerIdentity,
    pub workspace: &'a Path,
    pub specs: &'a TesterSpecs,
    pub env: &'a HashMap<String, String>,
    /// Seconds of wall time before the group is killed.
    pub timeout: Option<u64>,
}

/// What a tester child left behind.
#[derive(Debug, Clone, Default)]
pub struct GroupOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

#[async_trait]
pub trait TesterExecutor: Send + Sync {
    async fn run_group(&self, request: GroupRequest<'_>) -> Result<GroupOutput>;

    /// Kill every process left running as `identity`.
    async fn reap(&self, identity: &WorkerIdentity) -> Result<()>;
}

/// Environment variables handed to an identity's tests for its resources.
pub fn identity_env(identity: &WorkerIdentity) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    if let Some(range) = &identity.resources.port {
        let port = available_port(range)
            .with_context(|| format!("No free port between {} and {}", range.min, range.max))?;
        vars.insert("PORT".to_string(), port.to_string());
    }
    Ok(vars)
}

/// First port of `range` that can currently be bound on localhost.
pub fn available_port(range: &PortRange) -> Option<u16> {
    (range.min..=range.max).find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
}

/// Add the job's variables to `base`. Jobs may not replace anything the
/// worker already set.
pub fn merge_job_env(
    mut base: HashMap<String, String>,
    job_vars: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut conflicts: Vec<&str> = job_vars
        .keys()
        .filter(|key| base.contains_key(*key))
        .map(String::as_str)
        .collect();
    if !conflicts.is_empty() {
        conflicts.sort_unstable();
        bail!(
            "The following environment variables cannot be overwritten for this test: {}",
            conflicts.join(", ")
        );
    }
    base.extend(job_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(base)
}

/// Runs testers as child processes of this binary.
pub struct ChildProcessExecutor {
    worker_exe: PathBuf,
    policy: ResourceLimitPolicy,
    limits: Vec<ResolvedLimit>,
    junit_jar: Option<PathBuf>,
}

impl ChildProcessExecutor {
    /// Limits are resolved against this process now, and again by the tester
    /// itself once it runs as the identity.
    pub fn new(
        worker_exe: PathBuf,
        policy: ResourceLimitPolicy,
        junit_jar: Option<PathBuf>,
    ) -> Result<Self, PolicyError> {
        let limits = policy.resolve_current()?;
        Ok(Self {
            worker_exe,
            policy,
            limits,
            junit_jar,
        })
    }

    fn command(&self, request: &GroupRequest<'_>) -> Result<Command> {
        let prefix = request.identity.command_prefix();
        let mut cmd = match prefix.split_first() {
            Some((program, args)) => {
                let mut cmd = Command::new(program);
                cmd.args(args).arg(&self.worker_exe);
                cmd
            }
            None => Command::new(&self.worker_exe),
        };
        cmd.arg("tester");
        if let Some(jar) = &self.junit_jar {
            cmd.arg("--junit-jar").arg(jar);
        }
        if !self.policy.is_empty() {
            cmd.arg("--rlimits").arg(serde_json::to_string(&self.policy)?);
        }
        cmd.current_dir(request.workspace)
            .env_clear()
            .envs(request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let limits = self.limits.clone();
        // SAFETY: only async-signal-safe setrlimit calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || rlimit::install(&limits).map_err(std::io::Error::from));
        }
        Ok(cmd)
    }

    /// Kill whatever the tester started and left running.
    async fn stop_leftovers(&self, identity: &WorkerIdentity, pid: Option<u32>) -> Result<()> {
        if identity.is_current_user() {
            if let Some(pid) = pid {
                // ESRCH: the group is already gone.
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            Ok(())
        } else {
            self.reap(identity).await
        }
    }
}

/// Bytes read from a pipe so far; kept even when reading never finishes.
type Captured = Arc<Mutex<Vec<u8>>>;

fn drain<R>(pipe: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured: Captured = Arc::default();
    let sink = Arc::clone(&captured);
    let handle = tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => lock(&sink).extend_from_slice(&chunk[..n]),
                // A read error just truncates what was captured.
                Err(_) => break,
            }
        }
    });
    (captured, handle)
}

fn lock(captured: &Captured) -> std::sync::MutexGuard<'_, Vec<u8>> {
    captured.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn collect((captured, handle): (Captured, JoinHandle<()>)) -> String {
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Output reader failed"),
        Err(_) => warn!("Tester output still open, keeping what was read"),
    }
    let bytes = lock(&captured);
    String::from_utf8_lossy(&bytes).into_owned()
}

#[async_trait]
impl TesterExecutor for ChildProcessExecutor {
    #[instrument(skip_all, fields(identity = %request.identity.name, tester = %request.specs.tester_type))]
    async fn run_group(&self, request: GroupRequest<'_>) -> Result<GroupOutput> {
        let payload = serde_json::to_vec(request.specs)?;
        let start = Instant::now();
        let mut child = self
            .command(&request)?
            .spawn()
            .context("Failed to start tester process")?;
        let pid = child.id();

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        if let Some(mut stdin) = child.stdin.take() {
            // Written on its own so a tester that never reads cannot stall the
            // timeout; dropping the pipe afterwards signals end of input.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Tester closed stdin early");
                }
            });
        }

        let mut timed_out = false;
        match request.timeout {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
                    Ok(status) => {
                        status?;
                    }
                    Err(_) => {
                        warn!(timeout_secs = secs, "Tester timed out, killing");
                        timed_out = true;
                    }
                }
            }
            None => {
                child.wait().await?;
            }
        }
        // Anything the tester left behind still holds its output pipes.
        self.stop_leftovers(request.identity, pid).await?;
        if timed_out {
            let _ = child.kill().await;
        }
        let elapsed_ms = start.elapsed().as_millis() as u64;

        Ok(GroupOutput {
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
            elapsed_ms,
            timed_out,
        })
    }

    async fn reap(&self, identity: &WorkerIdentity) -> Result<()> {
        if identity.is_current_user() {
            return Ok(());
        }
        let prefix = identity.command_prefix();
        let status = Command::new(&prefix[0])
            .args(&prefix[1..])
            .arg(&self.worker_exe)
            .arg("reap")
            .stdin(Stdio::null())
            .status()
            .await
            .with_context(|| format!("Failed to reap processes of {}", identity.name))?;
        if !status.success() {
            bail!("Reaping processes of {} exited with {}", identity.name, status);
        }
        Ok(())
    }
}

/// Kill every process this account may signal, except this one.
pub fn kill_all_own_processes() -> nix::Result<()> {
    nix::sys::signal::kill(Pid::from_raw(-1), Signal::SIGKILL)
}

// Runs one job from settings lookup to cleanup
//
// RESOLVING_SETTINGS -> FAILED_SETTINGS (publish, done)
//                    -> ACQUIRING_IDENTITY -> PREPARING_WORKSPACE -> RUNNING_TESTER
//                    -> PUBLISHING_RESULT -> CLEANING_UP -> DONE

use crate::executor::{self, GroupRequest, TesterExecutor};
use crate::files::{self, ArchiveSource};
use crate::identity::{WorkerIdentity, WorkerIdentityPool};
use crate::report;
use crate::store::JobStore;
use crate::testers::env::EnvironmentProvisioner;
use crate::workspace::WorkspaceCustodian;
use anyhow::{anyhow, Context, Result};
use autotest_common::types::{Job, JobResult, Settings, TestGroupResult, TesterSpecs};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub const SETTINGS_ERROR: &str = "Failed to run tests: Error in test settings";
pub const INVALID_JOB_ERROR: &str = "Failed to run tests: Invalid job";
pub const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Error text published for a failure nobody anticipated.
pub fn traceback(err: &anyhow::Error) -> String {
    format!("{}\n{:?}", TRACEBACK_HEADER, err)
}

enum SettingsOutcome {
    Ready(Settings),
    Failed(String),
}

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    archives: Arc<dyn ArchiveSource>,
    pool: Arc<WorkerIdentityPool>,
    custodian: Arc<WorkspaceCustodian>,
    executor: Arc<dyn TesterExecutor>,
    provisioner: Arc<EnvironmentProvisioner>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        archives: Arc<dyn ArchiveSource>,
        pool: Arc<WorkerIdentityPool>,
        custodian: Arc<WorkspaceCustodian>,
        executor: Arc<dyn TesterExecutor>,
        provisioner: Arc<EnvironmentProvisioner>,
    ) -> Self {
        Self {
            store,
            archives,
            pool,
            custodian,
            executor,
            provisioner,
        }
    }

    /// Run `job` and publish exactly one result for it.
    ///
    /// Never fails: every error ends up in the published result, and the
    /// identity's processes and files are cleaned up whatever happened.
    #[instrument(skip(self, job), fields(test_id = %job.test_id, settings_id = %job.settings_id))]
    pub async fn run(self: &Arc<Self>, job: Job) -> JobResult {
        let test_id = job.test_id.clone();

        let settings = match self.resolve_settings(&job).await {
            Ok(SettingsOutcome::Ready(settings)) => settings,
            Ok(SettingsOutcome::Failed(message)) => {
                warn!(error = %message, "Settings unusable, not running tests");
                return self.finish(&test_id, JobResult::failed(message)).await;
            }
            Err(e) => {
                error!(error = ?e, "Settings lookup failed");
                return self.finish(&test_id, JobResult::failed(traceback(&e))).await;
            }
        };

        let lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                return self.finish(&test_id, JobResult::failed(traceback(&anyhow!(e)))).await;
            }
        };
        let identity: WorkerIdentity = (*lease).clone();
        info!(identity = %identity.name, "Running job");

        // Own task, so that a panic is contained like any other error.
        let this = Arc::clone(self);
        let task_identity = identity.clone();
        let outcome =
            tokio::spawn(async move { this.run_tests(&job, &settings, &task_identity).await }).await;

        let result = match outcome {
            Ok(Ok(test_groups)) => JobResult {
                test_groups,
                error: None,
            },
            Ok(Err(e)) => {
                error!(error = ?e, "Job failed");
                JobResult::failed(traceback(&e))
            }
            Err(join) => {
                error!(error = %join, "Job task panicked");
                let message = match join.try_into_panic() {
                    Ok(payload) => payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string()),
                    Err(join) => join.to_string(),
                };
                JobResult::failed(traceback(&anyhow!("job task panicked: {}", message)))
            }
        };

        let result = self.finish(&test_id, result).await;
        self.clean_up(&identity).await;
        drop(lease);
        result
    }

    async fn resolve_settings(&self, job: &Job) -> Result<SettingsOutcome> {
        let Some(settings) = self.store.get_settings(&job.settings_id).await? else {
            return Ok(SettingsOutcome::Failed(format!(
                "{}: no settings found for {}",
                SETTINGS_ERROR, job.settings_id
            )));
        };

        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.store.touch_settings(&job.settings_id, &settings, now).await {
            warn!(error = %e, "Failed to record settings access");
        }

        match settings.failure() {
            Some(Some(message)) => Ok(SettingsOutcome::Failed(format!("{}: {}", SETTINGS_ERROR, message))),
            Some(None) => Ok(SettingsOutcome::Failed(SETTINGS_ERROR.to_string())),
            None => Ok(SettingsOutcome::Ready(settings)),
        }
    }

    async fn run_tests(
        &self,
        job: &Job,
        settings: &Settings,
        identity: &WorkerIdentity,
    ) -> Result<Vec<TestGroupResult>> {
        let workspace = self.custodian.prepare(identity).await?;

        let credentials = self.store.get_credentials(&job.user).await?;
        let archive = self
            .archives
            .fetch(&job.files_url, credentials.as_ref())
            .await?;
        let group = (!identity.is_current_user()).then_some(identity.gid);
        let files_dir = settings.files.clone();
        let target = workspace.clone();
        tokio::task::spawn_blocking(move || files::materialise(&archive, files_dir.as_deref(), &target, group))
            .await
            .context("File setup panicked")??;
        debug!(workspace = %workspace.display(), "Files in place");

        let base_env: HashMap<String, String> = std::env::vars().collect();
        let mut groups = Vec::new();
        for (index, tester) in settings.testers.iter().enumerate() {
            let tester_env = self
                .provisioner
                .ensure(tester, index, &workspace, settings.files.as_deref())
                .await?;

            for test_data in tester.test_data.iter().filter(|td| td.matches_any(&job.categories)) {
                let mut specs = tester.specs_for(test_data);
                specs.env = tester_env.clone();
                groups.push(self.run_group(job, identity, &workspace, &specs, &base_env).await);
            }
        }
        Ok(groups)
    }

    async fn run_group(
        &self,
        job: &Job,
        identity: &WorkerIdentity,
        workspace: &Path,
        specs: &TesterSpecs,
        base_env: &HashMap<String, String>,
    ) -> TestGroupResult {
        let extra_info = &specs.test_data.extra_info;
        let env = match group_env(identity, specs, base_env, &job.test_env_vars) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "Test group not run");
                return report::build_group_result("", &e.to_string(), 0, extra_info, None);
            }
        };

        let timeout = specs.test_data.timeout;
        let start = Instant::now();
        let output = match self
            .executor
            .run_group(GroupRequest {
                identity,
                workspace,
                specs,
                env: &env,
                timeout,
            })
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(tester = %specs.tester_type, error = ?e, "Test group failed to run");
                let elapsed_ms = start.elapsed().as_millis() as u64;
                return report::build_group_result("", &format!("{:#}", e), elapsed_ms, extra_info, None);
            }
        };
        info!(
            tester = %specs.tester_type,
            elapsed_ms = output.elapsed_ms,
            timed_out = output.timed_out,
            "Test group finished"
        );

        let (stderr, timed_out_after) = match timeout.filter(|_| output.timed_out) {
            Some(secs) => {
                let message = report::timeout_message(specs.test_data.group_name(), secs);
                (with_timeout_message(output.stderr, &message), Some(secs))
            }
            None => (output.stderr, None),
        };
        report::build_group_result(&output.stdout, &stderr, output.elapsed_ms, extra_info, timed_out_after)
    }

    /// Publish a failure for a job whose payload could not be read.
    pub async fn reject(&self, test_id: &str, error: &str) -> JobResult {
        let result = JobResult::failed(format!("{}: {}", INVALID_JOB_ERROR, error));
        self.finish(test_id, result).await
    }

    async fn finish(&self, test_id: &str, result: JobResult) -> JobResult {
        match self.store.publish_result(test_id, &result).await {
            Ok(()) => info!(test_id, groups = result.test_groups.len(), "Result published"),
            Err(e) => error!(test_id, error = %e, "Failed to publish result"),
        }
        result
    }

    async fn clean_up(&self, identity: &WorkerIdentity) {
        if let Err(e) = self.executor.reap(identity).await {
            warn!(identity = %identity.name, error = %e, "Failed to stop tester processes");
        }
        if let Err(e) = self.custodian.purge(identity).await {
            warn!(identity = %identity.name, error = %e, "Failed to clean workspace");
        }
    }
}

/// The kernel's bare "Killed" says nothing the timeout message does not;
/// anything else the tester wrote is kept ahead of it.
fn with_timeout_message(stderr: String, message: &str) -> String {
    let detail = stderr.trim_end();
    if detail.is_empty() || detail == "Killed" {
        return message.to_string();
    }
    format!("{}\n{}", detail, message)
}

/// Worker environment, then the identity's resources, then the tester's
/// environment, then the job's own variables.
fn group_env(
    identity: &WorkerIdentity,
    specs: &TesterSpecs,
    base_env: &HashMap<String, String>,
    job_vars: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut env = base_env.clone();
    env.extend(executor::identity_env(identity)?);
    env.extend(specs.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    executor::merge_job_env(env, job_vars)
}

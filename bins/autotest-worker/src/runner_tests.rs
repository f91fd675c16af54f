/// Job runner tests
///
/// The runner is driven end to end with in-process fakes for the store,
/// the archive download and the tester processes:
/// 1. Settings failures publish an error and run nothing
/// 2. Download failures publish a traceback and release the identity
/// 3. Only groups of the requested categories run
/// 4. Job variables never replace worker variables
/// 5. Timed out groups carry the timeout message
/// 6. A group whose tester cannot start does not sink the others
/// 7. Unreadable jobs still get a published failure

#[cfg(test)]
mod job_runner_tests {
    use crate::executor::{GroupOutput, GroupRequest, TesterExecutor};
    use crate::files::ArchiveSource;
    use crate::files::tests::zip_of;
    use crate::identity::{WorkerIdentity, WorkerIdentityPool};
    use crate::runner::{INVALID_JOB_ERROR, JobRunner};
    use crate::store::MemoryStore;
    use crate::testers::env::EnvironmentProvisioner;
    use crate::workspace::WorkspaceCustodian;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use autotest_common::types::{Credentials, Job, Settings};
    use nix::unistd::{Gid, Uid};
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct FakeArchives {
        failure: Option<String>,
    }

    #[async_trait]
    impl ArchiveSource for FakeArchives {
        async fn fetch(&self, _url: &str, _credentials: Option<&Credentials>) -> Result<Vec<u8>> {
            if let Some(message) = &self.failure {
                bail!("{}", message);
            }
            Ok(zip_of(&[("submission.py", "def answer():\n    return 42\n")]))
        }
    }

    /// What the runner asked a tester process to do.
    #[derive(Debug, Clone)]
    struct Launched {
        scripts: Vec<String>,
        timeout: Option<u64>,
        submission_present: bool,
    }

    struct FakeExecutor {
        stdout: String,
        stderr: String,
        timed_out: bool,
        /// Groups running this script fail to start.
        broken_script: Option<String>,
        launched: Mutex<Vec<Launched>>,
        reaped: Mutex<usize>,
    }

    impl FakeExecutor {
        fn printing(stdout: &str) -> Self {
            Self {
                stdout: stdout.to_string(),
                stderr: String::new(),
                timed_out: false,
                broken_script: None,
                launched: Mutex::new(Vec::new()),
                reaped: Mutex::new(0),
            }
        }

        fn launched(&self) -> Vec<Launched> {
            self.launched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TesterExecutor for FakeExecutor {
        async fn run_group(&self, request: GroupRequest<'_>) -> Result<GroupOutput> {
            self.launched.lock().unwrap().push(Launched {
                scripts: request.specs.script_paths(),
                timeout: request.timeout,
                submission_present: request.workspace.join("submission.py").exists(),
            });
            if let Some(script) = &self.broken_script {
                if request.specs.script_paths().contains(script) {
                    bail!("Failed to start tester process: sudo: unknown user");
                }
            }
            Ok(GroupOutput {
                stdout: self.stdout.clone(),
                stderr: self.stderr.clone(),
                elapsed_ms: 12,
                timed_out: self.timed_out,
            })
        }

        async fn reap(&self, _identity: &WorkerIdentity) -> Result<()> {
            *self.reaped.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        store: Arc<MemoryStore>,
        executor: Arc<FakeExecutor>,
        pool: Arc<WorkerIdentityPool>,
        runner: Arc<JobRunner>,
    }

    fn harness(settings: serde_json::Value, archives: FakeArchives, executor: FakeExecutor) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let workers = dir.path().join("workers");
        let root = workers.join("me");
        let identity = WorkerIdentity::new("me", Uid::current(), Gid::current(), root.clone());
        let pool = WorkerIdentityPool::new(vec![identity]);

        let settings: Settings = serde_json::from_value(settings).unwrap();
        let store = Arc::new(MemoryStore::new().with_settings("7", settings));
        let executor = Arc::new(executor);
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            Arc::new(archives),
            pool.clone(),
            Arc::new(WorkspaceCustodian::with_paths(workers, Vec::new(), PathBuf::from("/bin/false"))),
            executor.clone(),
            Arc::new(EnvironmentProvisioner::new(None)),
        ));

        Harness {
            _dir: dir,
            root,
            store,
            executor,
            pool,
            runner,
        }
    }

    fn job(categories: &[&str], env: &[(&str, &str)]) -> Job {
        Job {
            settings_id: "7".to_string(),
            test_id: "t-100".to_string(),
            files_url: "http://files.local/submission.zip".to_string(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            user: "instructor".to_string(),
            test_env_vars: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn script_settings() -> serde_json::Value {
        json!({
            "testers": [{
                "tester_type": "custom",
                "test_data": [
                    {"script_files": ["student.sh"], "category": ["student"], "extra_info": {"name": "visible"}},
                    {"script_files": ["admin.sh"], "category": ["admin"]}
                ]
            }],
            "_env_status": "ready"
        })
    }

    #[tokio::test]
    async fn test_settings_error_is_published_without_running() {
        let h = harness(
            json!({"_error": "Invalid configuration"}),
            FakeArchives { failure: None },
            FakeExecutor::printing(""),
        );

        let result = h.runner.run(job(&["student"], &[])).await;

        assert_eq!(
            result.error.as_deref(),
            Some("Failed to run tests: Error in test settings: Invalid configuration")
        );
        assert!(result.test_groups.is_empty());
        assert_eq!(h.store.published().len(), 1);
        assert!(h.executor.launched().is_empty());
    }

    #[tokio::test]
    async fn test_env_status_error_is_published() {
        let h = harness(
            json!({"_env_status": "error"}),
            FakeArchives { failure: None },
            FakeExecutor::printing(""),
        );

        let result = h.runner.run(job(&["student"], &[])).await;

        assert_eq!(result.error.as_deref(), Some("Failed to run tests: Error in test settings"));
    }

    #[tokio::test]
    async fn test_missing_settings_are_a_settings_error() {
        let h = harness(json!({}), FakeArchives { failure: None }, FakeExecutor::printing(""));
        let mut job = job(&["student"], &[]);
        job.settings_id = "404".to_string();

        let result = h.runner.run(job).await;

        let error = result.error.unwrap();
        assert!(error.starts_with("Failed to run tests: Error in test settings"));
        assert!(error.contains("404"));
    }

    #[tokio::test]
    async fn test_settings_access_is_recorded() {
        let h = harness(script_settings(), FakeArchives { failure: None }, FakeExecutor::printing(""));

        h.runner.run(job(&["student"], &[])).await;

        assert!(h.store.settings("7").unwrap().last_access.is_some());
    }

    #[tokio::test]
    async fn test_download_failure_is_a_traceback() {
        let h = harness(
            script_settings(),
            FakeArchives {
                failure: Some("connection reset".to_string()),
            },
            FakeExecutor::printing(""),
        );

        let result = h.runner.run(job(&["student"], &[])).await;

        let error = result.error.unwrap();
        assert!(error.starts_with("Traceback (most recent call last):"));
        assert!(error.contains("connection reset"));
        assert!(result.test_groups.is_empty());
        assert_eq!(h.store.published().len(), 1);
        assert_eq!(h.pool.available(), h.pool.size());
        assert_eq!(*h.executor.reaped.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_only_requested_categories_run() {
        let stdout = concat!(
            r#"{"name": "test_answer", "output": "", "marks_earned": 1, "marks_total": 1, "status": "pass", "time": null}"#,
            "\n",
            r#"{"tags": ["fast"]}"#,
            "\n"
        );
        let h = harness(script_settings(), FakeArchives { failure: None }, FakeExecutor::printing(stdout));

        let result = h.runner.run(job(&["student"], &[])).await;

        assert!(result.error.is_none());
        assert_eq!(result.test_groups.len(), 1);
        let group = &result.test_groups[0];
        assert_eq!(group.tests.len(), 1);
        assert_eq!(group.tests[0]["name"], "test_answer");
        assert_eq!(group.tags, Some(json!(["fast"])));
        assert_eq!(group.extra_info["name"], "visible");
        assert_eq!(group.time, 12);

        let launched = h.executor.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].scripts, vec!["student.sh".to_string()]);
        assert!(launched[0].submission_present);

        let published = h.store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "t-100");
        assert_eq!(published[0].1, result);
    }

    #[tokio::test]
    async fn test_workspace_is_empty_after_job() {
        let h = harness(script_settings(), FakeArchives { failure: None }, FakeExecutor::printing(""));

        h.runner.run(job(&["student", "admin"], &[])).await;

        assert_eq!(h.executor.launched().len(), 2);
        assert!(h.root.is_dir());
        assert_eq!(std::fs::read_dir(&h.root).unwrap().count(), 0);
        assert_eq!(h.pool.available(), 1);
    }

    #[tokio::test]
    async fn test_job_env_conflict_fails_the_group() {
        let settings = json!({
            "testers": [{
                "tester_type": "custom",
                "_env": {"PYTHON": "/envs/py/bin/python3"},
                "test_data": [{"script_files": ["student.sh"], "category": ["student"]}]
            }]
        });
        let h = harness(settings, FakeArchives { failure: None }, FakeExecutor::printing(""));

        let result = h.runner.run(job(&["student"], &[("PYTHON", "/tmp/python")])).await;

        assert!(result.error.is_none());
        assert_eq!(result.test_groups.len(), 1);
        assert_eq!(
            result.test_groups[0].stderr.as_deref(),
            Some("The following environment variables cannot be overwritten for this test: PYTHON")
        );
        assert!(h.executor.launched().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_group_reports_limit() {
        let settings = json!({
            "testers": [{
                "tester_type": "custom",
                "test_data": [{
                    "script_files": ["slow.sh"],
                    "category": ["student"],
                    "timeout": 2,
                    "extra_info": {"name": "slow tests"}
                }]
            }]
        });
        let mut executor = FakeExecutor::printing("");
        executor.timed_out = true;
        let h = harness(settings, FakeArchives { failure: None }, executor);

        let result = h.runner.run(job(&["student"], &[])).await;

        let group = &result.test_groups[0];
        assert_eq!(group.timeout, Some(2));
        assert_eq!(
            group.stderr.as_deref(),
            Some("Tests for slow tests did not complete within time limit (2s)\n")
        );
        assert_eq!(h.executor.launched()[0].timeout, Some(2));
    }

    #[tokio::test]
    async fn test_timeout_keeps_tester_diagnostics() {
        let settings = json!({
            "testers": [{
                "tester_type": "custom",
                "test_data": [{"script_files": ["slow.sh"], "category": ["student"], "timeout": 3}]
            }]
        });
        let mut executor = FakeExecutor::printing("");
        executor.timed_out = true;
        executor.stderr = "Segmentation fault in helper\n".to_string();
        let h = harness(settings, FakeArchives { failure: None }, executor);

        let result = h.runner.run(job(&["student"], &[])).await;

        assert_eq!(
            result.test_groups[0].stderr.as_deref(),
            Some("Segmentation fault in helper\nTests did not complete within time limit (3s)\n")
        );
    }

    #[tokio::test]
    async fn test_bare_killed_is_replaced_on_timeout() {
        let settings = json!({
            "testers": [{
                "tester_type": "custom",
                "test_data": [{"script_files": ["slow.sh"], "category": ["student"], "timeout": 3}]
            }]
        });
        let mut executor = FakeExecutor::printing("");
        executor.timed_out = true;
        executor.stderr = "Killed\n".to_string();
        let h = harness(settings, FakeArchives { failure: None }, executor);

        let result = h.runner.run(job(&["student"], &[])).await;

        assert_eq!(
            result.test_groups[0].stderr.as_deref(),
            Some("Tests did not complete within time limit (3s)\n")
        );
    }

    #[tokio::test]
    async fn test_group_that_cannot_start_does_not_fail_the_job() {
        let stdout = concat!(
            r#"{"name": "test_admin", "output": "", "marks_earned": 1, "marks_total": 1, "status": "pass", "time": null}"#,
            "\n"
        );
        let mut executor = FakeExecutor::printing(stdout);
        executor.broken_script = Some("student.sh".to_string());
        let h = harness(script_settings(), FakeArchives { failure: None }, executor);

        let result = h.runner.run(job(&["student", "admin"], &[])).await;

        assert!(result.error.is_none());
        assert_eq!(result.test_groups.len(), 2);
        assert!(result.test_groups[0].tests.is_empty());
        assert!(result.test_groups[0]
            .stderr
            .as_deref()
            .unwrap()
            .contains("sudo: unknown user"));
        assert_eq!(result.test_groups[0].extra_info["name"], "visible");
        assert_eq!(result.test_groups[1].tests[0]["name"], "test_admin");
        assert_eq!(h.executor.launched().len(), 2);
        assert_eq!(h.pool.available(), 1);
    }

    #[tokio::test]
    async fn test_rejected_job_is_published() {
        let h = harness(script_settings(), FakeArchives { failure: None }, FakeExecutor::printing(""));

        let result = h.runner.reject("t-9", "missing field `files_url`").await;

        assert_eq!(
            result.error.as_deref(),
            Some("Failed to run tests: Invalid job: missing field `files_url`")
        );
        assert!(result.error.as_deref().unwrap().starts_with(INVALID_JOB_ERROR));
        let published = h.store.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "t-9");
        assert!(h.executor.launched().is_empty());
    }
}

//! The tester contract shared by every judging toolchain.
//!
//! A tester runs inside its own child process, in the job's workspace and as
//! the job's identity. It reads its [`TesterSpecs`] from stdin and prints one
//! JSON object per test result to stdout through a [`Reporter`]. Whatever
//! happens inside, the process ends having printed something the worker can
//! attribute: faults become an `error`/`error_all` result at the run boundary.

pub mod env;
pub mod java;
pub mod junit;
pub mod notebook;
pub mod python;
pub mod script;

use crate::rlimit::{self, ResourceLimitPolicy};
use autotest_common::types::{TestResult, TestStatus, TesterSpecs};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use thiserror::Error;

/// Name of the single result reported when a whole tester fails.
pub const ALL_TESTS: &str = "All tests";

#[derive(Debug, Error)]
pub enum TesterError {
    /// Bad paths, classpaths or settings.
    #[error("{0}")]
    Config(String),
    /// The toolchain itself failed: compile errors, runner crashes.
    #[error("{0}")]
    Execution(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<io::Error> for TesterError {
    fn from(err: io::Error) -> Self {
        TesterError::Internal(err.into())
    }
}

/// Writes results as JSON lines, flushing after each so that results
/// printed before a crash or a kill still reach the worker.
pub struct Reporter<'a> {
    out: &'a mut dyn Write,
}

impl<'a> Reporter<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self { out }
    }

    pub fn report(&mut self, result: &TestResult) -> io::Result<()> {
        self.emit(&serde_json::to_value(result)?)
    }

    /// Pass through output that already follows the result format.
    pub fn forward(&mut self, raw: &[u8]) -> io::Result<()> {
        self.out.write_all(raw)?;
        if !raw.ends_with(b"\n") {
            self.out.write_all(b"\n")?;
        }
        self.out.flush()
    }

    fn emit(&mut self, value: &Value) -> io::Result<()> {
        serde_json::to_writer(&mut *self.out, value)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// A result covering every test of a tester that could not run.
///
/// `expected` failures (bad configuration, toolchain errors) get status
/// `error`; anything else is `error_all`.
pub fn error_all(message: impl Into<String>, expected: bool) -> TestResult {
    TestResult {
        name: ALL_TESTS.to_string(),
        output: message.into(),
        marks_earned: 0,
        marks_total: 0,
        status: if expected { TestStatus::Error } else { TestStatus::ErrorAll },
        time: None,
    }
}

/// One gradable unit of a tester.
#[derive(Debug, Clone)]
pub struct Test {
    name: String,
    points_total: u32,
}

impl Test {
    /// Points come from the tester's `points` map and default to 1.
    pub fn new(name: impl Into<String>, points: &BTreeMap<String, u32>) -> Result<Self, TesterError> {
        let name = name.into();
        let points_total = points.get(&name).copied().unwrap_or(1);
        if points_total == 0 {
            return Err(TesterError::Config(format!(
                "The test total points must be > 0 (test '{}')",
                name
            )));
        }
        Ok(Self { name, points_total })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points_total(&self) -> u32 {
        self.points_total
    }

    fn result(&self, status: TestStatus, output: impl Into<String>, marks_earned: u32) -> TestResult {
        TestResult {
            name: self.name.clone(),
            output: output.into(),
            marks_earned,
            marks_total: self.points_total,
            status,
            time: None,
        }
    }

    pub fn passed(&self, message: impl Into<String>) -> TestResult {
        self.result(TestStatus::Pass, message, self.points_total)
    }

    pub fn passed_with_bonus(&self, bonus: u32, message: impl Into<String>) -> TestResult {
        self.result(TestStatus::Pass, message, self.points_total + bonus)
    }

    /// Earned points must be strictly between zero and the total.
    pub fn partially_passed(&self, earned: u32, message: impl Into<String>) -> Result<TestResult, TesterError> {
        if earned == 0 {
            return Err(TesterError::Config("The test points earned must be > 0".to_string()));
        }
        if earned >= self.points_total {
            return Err(TesterError::Config(
                "The test points earned must be < the test total points".to_string(),
            ));
        }
        Ok(self.result(TestStatus::Partial, message, earned))
    }

    pub fn failed(&self, message: impl Into<String>) -> TestResult {
        self.result(TestStatus::Fail, message, 0)
    }

    /// Pass, partially pass or fail depending on `earned`.
    pub fn done(&self, earned: u32, message: impl Into<String>) -> TestResult {
        let message = message.into();
        if earned == 0 {
            self.failed(message)
        } else if earned >= self.points_total {
            self.passed_with_bonus(earned - self.points_total, message)
        } else {
            self.result(TestStatus::Partial, message, earned)
        }
    }

    pub fn error(&self, message: impl Into<String>) -> TestResult {
        self.result(TestStatus::Error, message, 0)
    }

    /// Run one test. Errors and panics inside `body` become an `error`
    /// result for this test only.
    pub fn run<F>(&self, body: F) -> TestResult
    where
        F: FnOnce(&Test) -> Result<TestResult, TesterError>,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| body(self))) {
            Ok(Ok(result)) => result,
            Ok(Err(TesterError::Config(message))) | Ok(Err(TesterError::Execution(message))) => {
                self.error(message)
            }
            Ok(Err(TesterError::Internal(err))) => self.error(format!("{:?}", err)),
            Err(payload) => self.error(panic_message(payload.as_ref())),
        }
    }
}

pub trait Tester {
    /// Setup that can fail, run inside the boundary.
    fn before_run(&mut self) -> Result<(), TesterError> {
        Ok(())
    }

    fn run(&mut self, reporter: &mut Reporter<'_>) -> Result<(), TesterError>;

    /// Always called, even when `before_run` or `run` failed.
    fn after_run(&mut self) {}
}

/// Run a tester, converting any failure into a reported result.
pub fn run_tester(tester: &mut dyn Tester, reporter: &mut Reporter<'_>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        tester.before_run()?;
        tester.run(reporter)
    }));

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(TesterError::Config(message))) | Ok(Err(TesterError::Execution(message))) => {
            Some(error_all(message, true))
        }
        Ok(Err(TesterError::Internal(err))) => Some(error_all(
            format!("Traceback (most recent call last):\n{:?}", err),
            false,
        )),
        Err(payload) => Some(error_all(
            format!("Tester panicked: {}", panic_message(payload.as_ref())),
            false,
        )),
    };
    if let Some(result) = failure {
        if let Err(e) = reporter.report(&result) {
            eprintln!("failed to report tester error: {}", e);
        }
    }

    tester.after_run();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Settings of the tester child that come from the worker, not the job.
#[derive(Debug, Clone, Default)]
pub struct TesterOptions {
    pub junit_jar: Option<PathBuf>,
    /// Installed by the tester itself, after any login session setup that
    /// could have reset what the worker set before exec.
    pub limits: ResourceLimitPolicy,
}

/// Tester types this worker can run.
pub const INSTALLED_TESTERS: &[&str] = &["custom", "java", "py", "jupyter"];

/// Construct the tester registered for `specs.tester_type`.
pub fn build(specs: TesterSpecs, options: &TesterOptions) -> Result<Box<dyn Tester>, TesterError> {
    let tester: Box<dyn Tester> = match specs.tester_type.as_str() {
        "custom" => Box::new(script::ScriptTester::new(specs)),
        "java" => Box::new(java::CompiledLanguageTester::new(specs, options)?),
        "py" => Box::new(python::EnvironmentTester::new(specs)),
        "jupyter" => Box::new(notebook::NotebookTester::new(specs)),
        other => {
            return Err(TesterError::Config(format!("tester {} is not installed", other)));
        }
    };
    Ok(tester)
}

/// Entry point of the tester child: read specs, run, report.
pub fn run_from_reader(input: impl io::Read, out: &mut dyn Write, options: &TesterOptions) {
    let mut reporter = Reporter::new(out);
    if let Err(message) = install_limits(&options.limits) {
        let _ = reporter.report(&error_all(message, false));
        return;
    }
    let specs: TesterSpecs = match serde_json::from_reader(input) {
        Ok(specs) => specs,
        Err(e) => {
            let _ = reporter.report(&error_all(format!("Invalid tester specs: {}", e), false));
            return;
        }
    };
    match build(specs, options) {
        Ok(mut tester) => run_tester(tester.as_mut(), &mut reporter),
        Err(e) => {
            let _ = reporter.report(&error_all(e.to_string(), true));
        }
    }
}

fn install_limits(policy: &ResourceLimitPolicy) -> Result<(), String> {
    if policy.is_empty() {
        return Ok(());
    }
    let limits = policy
        .resolve_current()
        .map_err(|e| format!("Invalid resource limits: {}", e))?;
    rlimit::install(&limits).map_err(|e| format!("Cannot set resource limits: {}", e))
}

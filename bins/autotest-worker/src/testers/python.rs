// Python tests run with pytest inside a provisioned environment
use super::junit::{self, CaseStatus, TestCase};
use super::{Reporter, Test, Tester, TesterError};
use autotest_common::types::TesterSpecs;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

const DEFAULT_VERBOSITY: &str = "short";

/// Interpreter of the tester's environment: `PYTHON` from the environment
/// the worker set up, else whatever `python3` is on the path.
pub fn interpreter(specs: &TesterSpecs) -> PathBuf {
    specs
        .env
        .get("PYTHON")
        .cloned()
        .or_else(|| std::env::var("PYTHON").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("python3"))
}

/// Run pytest with `args` and return the cases of its JUnit report.
pub fn run_pytest(python: &Path, workdir: &Path, args: &[OsString]) -> Result<Vec<TestCase>, TesterError> {
    let report_dir = tempfile::Builder::new().prefix(".pytest").tempdir_in(workdir)?;
    let report = report_dir.path().join("report.xml");

    let output = Command::new(python)
        .current_dir(workdir)
        .args(["-m", "pytest", "-q", "-p", "no:cacheprovider"])
        .arg(format!("--junit-xml={}", report.display()))
        .args(args)
        .output()
        .map_err(|e| TesterError::Execution(format!("Cannot run {}: {}", python.display(), e)))?;
    debug!(status = %output.status, "pytest finished");

    match junit::read_report(&report)? {
        Some(cases) => Ok(cases),
        None => {
            let mut message = String::from_utf8_lossy(&output.stderr).into_owned();
            if message.trim().is_empty() {
                message = String::from_utf8_lossy(&output.stdout).into_owned();
            }
            Err(TesterError::Execution(message))
        }
    }
}

/// Report one pytest case under `name`.
pub fn report_case(
    case: &TestCase,
    name: String,
    points: &BTreeMap<String, u32>,
    reporter: &mut Reporter<'_>,
) -> Result<(), TesterError> {
    let test = Test::new(name, points)?;
    let result = test.run(|test| {
        let (status, message) = case.outcome(|detail| {
            if detail.text.is_empty() {
                detail.message.clone()
            } else {
                detail.text.clone()
            }
        });
        Ok(match status {
            CaseStatus::Success => test.passed(message),
            CaseStatus::Failure => test.failed(message),
            CaseStatus::Error => test.error(message),
        })
    });
    reporter.report(&result)?;
    Ok(())
}

/// Runs each script file with pytest in the tester's interpreter
/// environment. unittest suites are collected by pytest as well.
pub struct EnvironmentTester {
    specs: TesterSpecs,
    workdir: PathBuf,
}

impl EnvironmentTester {
    pub fn new(specs: TesterSpecs) -> Self {
        Self::in_dir(specs, PathBuf::from("."))
    }

    pub fn in_dir(specs: TesterSpecs, workdir: PathBuf) -> Self {
        Self { specs, workdir }
    }

    fn verbosity(&self) -> String {
        match &self.specs.test_data.output_verbosity {
            Some(Value::String(v)) if !v.is_empty() => v.clone(),
            _ => DEFAULT_VERBOSITY.to_string(),
        }
    }
}

impl Tester for EnvironmentTester {
    fn run(&mut self, reporter: &mut Reporter<'_>) -> Result<(), TesterError> {
        let python = interpreter(&self.specs);
        let tb = format!("--tb={}", self.verbosity());
        for file in self.specs.script_paths() {
            let args = [OsString::from(&file), OsString::from(&tb)];
            let cases = run_pytest(&python, &self.workdir, &args)?;
            for case in cases.iter().filter(|c| !c.skipped) {
                report_case(case, case.full_name(), &self.specs.points, reporter)?;
            }
        }
        Ok(())
    }
}

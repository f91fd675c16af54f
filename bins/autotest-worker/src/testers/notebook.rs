// Jupyter notebooks: merge the test notebook into the submission, then run
// the merged notebook under pytest with the notebook collector.
use super::python::{interpreter, report_case, run_pytest};
use super::{Reporter, Test, Tester, TesterError};
use autotest_common::types::TesterSpecs;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

const COLLECTOR_PLUGIN: &str = "notebook_helper.pytest.notebook_collector_plugin";
const MERGE_SCRIPT: &str = "import sys, nbformat\n\
from notebook_helper import merger\n\
nbformat.write(merger.merge(sys.argv[1], sys.argv[2]), sys.argv[3])";
const CHECK_SCRIPT: &str = "import sys\n\
from notebook_helper import merger\n\
merger.check(sys.argv[1], sys.argv[2])";

#[derive(Debug, Clone, Deserialize)]
struct NotebookPair {
    test_file: String,
    student_file: String,
    #[serde(default)]
    test_merge: bool,
}

pub struct NotebookTester {
    specs: TesterSpecs,
    workdir: PathBuf,
}

impl NotebookTester {
    pub fn new(specs: TesterSpecs) -> Self {
        Self {
            specs,
            workdir: PathBuf::from("."),
        }
    }

    fn pairs(&self) -> Result<Vec<NotebookPair>, TesterError> {
        serde_json::from_value(self.specs.test_data.script_files.clone())
            .map_err(|e| TesterError::Config(format!("Invalid notebook script_files: {}", e)))
    }

    fn helper(&self, python: &Path, script: &str, args: &[&str]) -> Result<Option<String>, TesterError> {
        let output = Command::new(python)
            .current_dir(&self.workdir)
            .arg("-c")
            .arg(script)
            .args(args)
            .output()
            .map_err(|e| TesterError::Execution(format!("Cannot run {}: {}", python.display(), e)))?;
        if output.status.success() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&output.stderr).into_owned()))
        }
    }

    fn check_merge(&self, python: &Path, pair: &NotebookPair, reporter: &mut Reporter<'_>) -> Result<(), TesterError> {
        let problem = self.helper(python, CHECK_SCRIPT, &[&pair.test_file, &pair.student_file])?;
        if pair.test_merge {
            let test = Test::new("merge_check", &self.specs.points)?;
            let result = match problem {
                None => test.passed(""),
                Some(message) => test.failed(message),
            };
            reporter.report(&result)?;
        } else if let Some(message) = problem {
            eprint!("{}", message);
        }
        Ok(())
    }
}

impl Tester for NotebookTester {
    fn run(&mut self, reporter: &mut Reporter<'_>) -> Result<(), TesterError> {
        let python = interpreter(&self.specs);
        for pair in self.pairs()? {
            self.check_merge(&python, &pair, reporter)?;

            let merged = tempfile::Builder::new()
                .prefix(".merged")
                .suffix(".ipynb")
                .tempfile_in(&self.workdir)?;
            let merged_path = merged.path().to_string_lossy().into_owned();
            if let Some(message) = self.helper(
                &python,
                MERGE_SCRIPT,
                &[&pair.test_file, &pair.student_file, &merged_path],
            )? {
                return Err(TesterError::Execution(message));
            }

            let args = [
                OsString::from(&merged_path),
                OsString::from("-p"),
                OsString::from(COLLECTOR_PLUGIN),
            ];
            let prefix = format!("{}:{}", pair.test_file, pair.student_file);
            for case in run_pytest(&python, &self.workdir, &args)?.iter().filter(|c| !c.skipped) {
                let name = format!("{}::{}", prefix, case.name);
                report_case(case, name, &self.specs.points, reporter)?;
            }
        }
        Ok(())
    }
}

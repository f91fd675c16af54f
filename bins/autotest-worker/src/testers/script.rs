// Runs executable scripts supplied with the assignment
use super::{Reporter, Test, Tester, TesterError};
use crate::json_stream::{self, JsonKind};
use autotest_common::types::TesterSpecs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

/// Runs each `script_files` entry from the workspace.
///
/// Scripts may print results in the worker's JSON format themselves; those
/// are passed through untouched. A script that reports nothing is judged by
/// its exit status alone.
pub struct ScriptTester {
    specs: TesterSpecs,
    workdir: PathBuf,
}

impl ScriptTester {
    pub fn new(specs: TesterSpecs) -> Self {
        Self::in_dir(specs, PathBuf::from("."))
    }

    pub fn in_dir(specs: TesterSpecs, workdir: PathBuf) -> Self {
        Self { specs, workdir }
    }

    fn run_script(&self, script: &str, reporter: &mut Reporter<'_>) -> Result<(), TesterError> {
        let test = Test::new(script, &self.specs.points)?;
        let mut child = Command::new(self.workdir.join(script))
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TesterError::Config(format!("Cannot run {}: {}", script, e)))?;

        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut captured = Vec::new();
                let _ = pipe.read_to_end(&mut captured);
                captured
            })
        });

        // Each line goes out as soon as it is printed, so results survive a
        // kill of the whole tester.
        let mut stdout = String::new();
        if let Some(pipe) = child.stdout.take() {
            for line in BufReader::new(pipe).split(b'\n') {
                let line = line?;
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                reporter.forward(&line)?;
                stdout.push_str(&String::from_utf8_lossy(&line));
                stdout.push('\n');
            }
        }
        let status = child.wait()?;
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        debug!(script, status = %status, "Script finished");

        io::stderr().write_all(&stderr)?;
        let (reported, _) = json_stream::decode(&stdout, Some(JsonKind::Object));

        if !status.success() {
            let detail = String::from_utf8_lossy(&stderr);
            let message = if detail.trim().is_empty() {
                format!("{} exited with {}", script, status)
            } else {
                detail.into_owned()
            };
            reporter.report(&test.error(message))?;
        } else if reported.is_empty() {
            reporter.report(&test.passed(""))?;
        }
        Ok(())
    }
}

impl Tester for ScriptTester {
    fn run(&mut self, reporter: &mut Reporter<'_>) -> Result<(), TesterError> {
        let scripts = self.specs.script_paths();
        if scripts.is_empty() {
            return Err(TesterError::Config("No script files to run".to_string()));
        }
        for script in &scripts {
            self.run_script(script, reporter)?;
        }
        Ok(())
    }
}

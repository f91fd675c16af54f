// Compiles Java sources and runs them with the JUnit console launcher
use super::junit::{self, CaseStatus, Detail};
use super::{Reporter, Test, Tester, TesterError, TesterOptions};
use autotest_common::types::TesterSpecs;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use tracing::debug;

pub struct CompiledLanguageTester {
    specs: TesterSpecs,
    junit_jar: PathBuf,
    workdir: PathBuf,
    classpath: String,
    out_dir: Option<TempDir>,
    reports_dir: Option<TempDir>,
}

/// Resolve colon-separated glob patterns to real paths inside `base`.
///
/// Relative patterns are taken from `base`; matches outside of it, including
/// through symlinks, are dropped.
pub fn resolve_paths(patterns: &str, base: &Path) -> Vec<PathBuf> {
    let Ok(base) = base.canonicalize() else {
        return Vec::new();
    };
    let mut paths = Vec::new();
    for pattern in patterns.split(':').filter(|p| !p.is_empty()) {
        let absolute = base.join(pattern);
        let candidates: Vec<PathBuf> = if pattern.contains(['*', '?', '[']) {
            match glob::glob(&absolute.to_string_lossy()) {
                Ok(matches) => matches.flatten().collect(),
                Err(_) => continue,
            }
        } else {
            vec![absolute]
        };
        for path in candidates {
            if let Ok(real) = path.canonicalize() {
                if real.starts_with(&base) && !paths.contains(&real) {
                    paths.push(real);
                }
            }
        }
    }
    paths
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join(":")
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

impl CompiledLanguageTester {
    pub fn new(specs: TesterSpecs, options: &TesterOptions) -> Result<Self, TesterError> {
        let workdir = std::env::current_dir()?;
        Self::in_dir(specs, options, workdir)
    }

    pub fn in_dir(specs: TesterSpecs, options: &TesterOptions, workdir: PathBuf) -> Result<Self, TesterError> {
        let junit_jar = options
            .junit_jar
            .clone()
            .ok_or_else(|| TesterError::Config("No JUnit launcher configured for the java tester".to_string()))?;
        let patterns = specs
            .test_data
            .classpath
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let classpath = join_paths(&resolve_paths(&patterns, &workdir));
        Ok(Self {
            specs,
            junit_jar,
            workdir,
            classpath,
            out_dir: None,
            reports_dir: None,
        })
    }

    /// `.java` files among the script files and `sources_path`.
    fn sources(&self) -> BTreeSet<PathBuf> {
        let mut patterns = self.specs.script_paths();
        if let Some(sources) = &self.specs.test_data.sources_path {
            patterns.push(sources.clone());
        }
        resolve_paths(&patterns.join(":"), &self.workdir)
            .into_iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "java"))
            .collect()
    }

    fn dirs(&self) -> Result<(&Path, &Path), TesterError> {
        match (&self.out_dir, &self.reports_dir) {
            (Some(out), Some(reports)) => Ok((out.path(), reports.path())),
            _ => Err(TesterError::Internal(anyhow::anyhow!("java tester used before setup"))),
        }
    }

    fn compile(&self) -> Result<Output, TesterError> {
        let (out_dir, _) = self.dirs()?;
        let output = Command::new("javac")
            .current_dir(&self.workdir)
            .arg("-cp")
            .arg(format!("{}:{}", self.classpath, self.junit_jar.display()))
            .arg("-d")
            .arg(out_dir)
            .args(self.sources())
            .output()
            .map_err(|e| TesterError::Execution(format!("Cannot run javac: {}", e)))?;
        Ok(output)
    }

    fn run_junit(&self) -> Result<Output, TesterError> {
        let (out_dir, reports_dir) = self.dirs()?;
        let classes = self.specs.script_paths().into_iter().filter_map(|file| {
            Path::new(&file)
                .file_stem()
                .map(|stem| format!("-c={}", stem.to_string_lossy()))
        });
        let output = Command::new("java")
            .current_dir(&self.workdir)
            .arg("-jar")
            .arg(&self.junit_jar)
            .arg(format!("-cp={}:{}", self.classpath, out_dir.display()))
            .arg(format!("--reports-dir={}", reports_dir.display()))
            .args(classes)
            .output()
            .map_err(|e| TesterError::Execution(format!("Cannot run java: {}", e)))?;
        Ok(output)
    }
}

impl Tester for CompiledLanguageTester {
    fn before_run(&mut self) -> Result<(), TesterError> {
        self.out_dir = Some(tempfile::Builder::new().prefix(".classes").tempdir_in(&self.workdir)?);
        self.reports_dir = Some(tempfile::Builder::new().prefix(".reports").tempdir_in(&self.workdir)?);
        Ok(())
    }

    fn run(&mut self, reporter: &mut Reporter<'_>) -> Result<(), TesterError> {
        let compiled = self.compile()?;
        if !compiled.stderr.is_empty() {
            return Err(TesterError::Execution(stderr_of(&compiled)));
        }
        let junit = self.run_junit()?;
        if !junit.stderr.is_empty() {
            return Err(TesterError::Execution(stderr_of(&junit)));
        }

        let (_, reports_dir) = self.dirs()?;
        for report in [junit::JUPITER_REPORT, junit::VINTAGE_REPORT] {
            let Some(cases) = junit::read_report(&reports_dir.join(report))? else {
                debug!(report, "No report for this engine");
                continue;
            };
            for case in cases.iter().filter(|c| !c.skipped) {
                let test = Test::new(case.full_name(), &self.specs.points)?;
                let result = test.run(|test| {
                    let (status, message) = case.outcome(Detail::summary);
                    Ok(match status {
                        CaseStatus::Success => test.passed(message),
                        CaseStatus::Failure => test.failed(message),
                        CaseStatus::Error => test.error(message),
                    })
                });
                reporter.report(&result)?;
            }
        }
        Ok(())
    }

    fn after_run(&mut self) {
        self.out_dir = None;
        self.reports_dir = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_resolve_paths_stays_inside_base() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::create_dir(base.path().join("lib")).unwrap();
        fs::write(base.path().join("lib/a.jar"), "").unwrap();
        fs::write(base.path().join("lib/b.jar"), "").unwrap();
        fs::write(outside.path().join("c.jar"), "").unwrap();
        std::os::unix::fs::symlink(outside.path().join("c.jar"), base.path().join("lib/link.jar")).unwrap();

        let patterns = format!("lib/*.jar:{}/c.jar::", outside.path().display());
        let paths = resolve_paths(&patterns, base.path());

        let real_base = base.path().canonicalize().unwrap();
        assert_eq!(paths, vec![real_base.join("lib/a.jar"), real_base.join("lib/b.jar")]);
    }

    #[test]
    fn test_default_classpath_is_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let specs: TesterSpecs =
            serde_json::from_value(serde_json::json!({"tester_type": "java", "test_data": {}})).unwrap();
        let options = TesterOptions {
            junit_jar: Some(PathBuf::from("/opt/junit.jar")),
            ..TesterOptions::default()
        };

        let tester = CompiledLanguageTester::in_dir(specs, &options, dir.path().to_path_buf()).unwrap();

        assert_eq!(tester.classpath, dir.path().canonicalize().unwrap().to_string_lossy());
    }

    #[test]
    fn test_sources_are_java_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Test1.java"), "").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/Main.java"), "").unwrap();
        fs::write(dir.path().join("src/notes.txt"), "").unwrap();
        let specs: TesterSpecs = serde_json::from_value(serde_json::json!({
            "tester_type": "java",
            "test_data": {"script_files": ["Test1.java"], "sources_path": "src/*"}
        }))
        .unwrap();
        let options = TesterOptions {
            junit_jar: Some(PathBuf::from("/opt/junit.jar")),
            ..TesterOptions::default()
        };

        let tester = CompiledLanguageTester::in_dir(specs, &options, dir.path().to_path_buf()).unwrap();
        let sources = tester.sources();

        let real = dir.path().canonicalize().unwrap();
        assert_eq!(
            sources,
            BTreeSet::from([real.join("Test1.java"), real.join("src/Main.java")])
        );
    }

    #[test]
    fn test_missing_launcher_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let specs = TesterSpecs {
            tester_type: "java".to_string(),
            ..TesterSpecs::default()
        };

        let err = CompiledLanguageTester::in_dir(specs, &TesterOptions::default(), dir.path().to_path_buf());

        assert!(matches!(err, Err(TesterError::Config(_))));
    }
}

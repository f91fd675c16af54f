//! Reading JUnit-style XML reports.
//!
//! Both the JUnit platform console launcher and pytest write this format:
//! `testcase` elements with `classname`, `name` and `time` attributes and
//! optional `failure`, `error` or `skipped` children.

use super::TesterError;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Report files written by the JUnit console launcher, one per engine.
pub const JUPITER_REPORT: &str = "TEST-junit-jupiter.xml";
pub const VINTAGE_REPORT: &str = "TEST-junit-vintage.xml";

#[derive(Debug, Clone, PartialEq)]
pub struct Detail {
    pub kind: String,
    pub message: String,
    pub text: String,
}

impl Detail {
    /// `"<type>: <message>"`, the form shown for Java failures.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseStatus {
    Success,
    Failure,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub classname: String,
    pub name: String,
    pub time: f64,
    pub failure: Option<Detail>,
    pub error: Option<Detail>,
    pub skipped: bool,
}

impl TestCase {
    pub fn full_name(&self) -> String {
        if self.classname.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.classname, self.name)
        }
    }

    /// Classify the case and build its message with `render`.
    ///
    /// A case with both a failure and an error is an error; its message is
    /// the error's followed by the failure's, separated by a blank line.
    pub fn outcome(&self, render: impl Fn(&Detail) -> String) -> (CaseStatus, String) {
        match (&self.failure, &self.error) {
            (Some(failure), Some(error)) => (
                CaseStatus::Error,
                format!("{}\n\n{}", render(error), render(failure)),
            ),
            (Some(failure), None) => (CaseStatus::Failure, render(failure)),
            (None, Some(error)) => (CaseStatus::Error, render(error)),
            (None, None) => (CaseStatus::Success, String::new()),
        }
    }
}

fn detail(node: roxmltree::Node<'_, '_>) -> Detail {
    Detail {
        kind: node.attribute("type").unwrap_or_default().to_string(),
        message: node.attribute("message").unwrap_or_default().to_string(),
        text: node.text().unwrap_or_default().trim().to_string(),
    }
}

/// Every test case in a report, in document order.
pub fn parse_report(xml: &str) -> Result<Vec<TestCase>, roxmltree::Error> {
    let doc = roxmltree::Document::parse(xml)?;
    let cases = doc
        .descendants()
        .filter(|node| node.has_tag_name("testcase"))
        .map(|case| {
            let child = |tag: &str| case.children().find(|c| c.has_tag_name(tag));
            TestCase {
                classname: case.attribute("classname").unwrap_or_default().to_string(),
                name: case.attribute("name").unwrap_or_default().to_string(),
                time: case
                    .attribute("time")
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0.0),
                failure: child("failure").map(detail),
                error: child("error").map(detail),
                skipped: child("skipped").is_some(),
            }
        })
        .collect();
    Ok(cases)
}

/// Parse a report file. A missing file yields `None`.
pub fn read_report(path: &Path) -> Result<Option<Vec<TestCase>>, TesterError> {
    let xml = match fs::read_to_string(path) {
        Ok(xml) => xml,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_report(&xml)
        .map(Some)
        .map_err(|e| TesterError::Execution(format!("Unreadable test report {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="JUnit Jupiter" tests="4">
  <testcase name="testAdd()" classname="CalculatorTest" time="0.012"/>
  <testcase name="testSub()" classname="CalculatorTest" time="0.003">
    <failure message="expected: &lt;1&gt; but was: &lt;2&gt;" type="org.opentest4j.AssertionFailedError">stack</failure>
  </testcase>
  <testcase name="testDiv()" classname="CalculatorTest" time="0.001">
    <error message="/ by zero" type="java.lang.ArithmeticException"/>
  </testcase>
  <testcase name="testBoth()" classname="CalculatorTest" time="0.001">
    <failure message="bad value" type="AssertionError"/>
    <error message="oops" type="java.lang.IllegalStateException"/>
  </testcase>
</testsuite>"#;

    #[test]
    fn test_parse_statuses_and_messages() {
        let cases = parse_report(REPORT).unwrap();
        let outcomes: Vec<_> = cases.iter().map(|c| c.outcome(Detail::summary)).collect();

        assert_eq!(cases.len(), 4);
        assert_eq!(cases[0].full_name(), "CalculatorTest.testAdd()");
        assert!((cases[0].time - 0.012).abs() < f64::EPSILON);
        assert_eq!(outcomes[0], (CaseStatus::Success, String::new()));
        assert_eq!(
            outcomes[1],
            (
                CaseStatus::Failure,
                "org.opentest4j.AssertionFailedError: expected: <1> but was: <2>".to_string()
            )
        );
        assert_eq!(
            outcomes[2],
            (CaseStatus::Error, "java.lang.ArithmeticException: / by zero".to_string())
        );
    }

    #[test]
    fn test_failure_and_error_on_one_case() {
        let cases = parse_report(REPORT).unwrap();
        let (status, message) = cases[3].outcome(Detail::summary);

        assert_eq!(status, CaseStatus::Error);
        assert_eq!(
            message,
            "java.lang.IllegalStateException: oops\n\nAssertionError: bad value"
        );
    }

    #[test]
    fn test_nested_suites_and_skips() {
        let xml = r#"<testsuites><testsuite name="pytest">
            <testcase classname="test_a" name="test_one" time="0.1"/>
            <testcase classname="test_a" name="test_two" time="0.1"><skipped message="later"/></testcase>
            <testcase classname="test_a" name="test_three" time="0.1"><failure message="assert 1 == 2">def test_three():
    assert 1 == 2</failure></testcase>
        </testsuite></testsuites>"#;

        let cases = parse_report(xml).unwrap();

        assert_eq!(cases.len(), 3);
        assert!(cases[1].skipped);
        let failure = cases[2].failure.as_ref().unwrap();
        assert!(failure.text.contains("assert 1 == 2"));
    }

    #[test]
    fn test_missing_report_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_report(&dir.path().join(VINTAGE_REPORT)).unwrap(), None);
    }

    #[test]
    fn test_broken_report_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JUPITER_REPORT);
        fs::write(&path, "<testsuite><testcase").unwrap();

        assert!(matches!(read_report(&path), Err(TesterError::Execution(_))));
    }
}

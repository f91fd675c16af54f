use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

/// One grading request as it arrives on the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(deserialize_with = "string_or_number")]
    pub settings_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub test_id: String,
    pub files_url: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub user: String,
    #[serde(default)]
    pub test_env_vars: HashMap<String, String>,
}

impl Job {
    /// Decode a queued payload. When decoding fails the error still carries
    /// the `test_id`, if one could be read, so a failure can be published.
    pub fn from_payload(payload: &str) -> Result<Job, InvalidJob> {
        let value: Value = serde_json::from_str(payload).map_err(|error| InvalidJob { test_id: None, error })?;
        let test_id = match value.get("test_id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        serde_json::from_value(value).map_err(|error| InvalidJob { test_id, error })
    }
}

/// A queued payload that is not a valid [`Job`].
#[derive(Debug)]
pub struct InvalidJob {
    pub test_id: Option<String>,
    pub error: serde_json::Error,
}

impl fmt::Display for InvalidJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.test_id {
            Some(test_id) => write!(f, "invalid job {}: {}", test_id, self.error),
            None => write!(f, "invalid job: {}", self.error),
        }
    }
}

impl std::error::Error for InvalidJob {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Identifiers are integers in some front ends and strings in others.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number identifier, got {}",
            other
        ))),
    }
}

/// Status of a single test, as reported by a tester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Partial,
    Fail,
    Error,
    /// A whole tester failed before it could report individual tests.
    ErrorAll,
}

/// Uniform per-test result printed by every tester (one JSON object per line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub output: String,
    pub marks_earned: u32,
    pub marks_total: u32,
    pub status: TestStatus,
    pub time: Option<u64>,
}

/// Results of running one tester over one `test_data` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestGroupResult {
    /// Wall time in milliseconds.
    pub time: u64,
    /// Set to the configured timeout (seconds) when the group was killed.
    pub timeout: Option<u64>,
    /// Tests are kept as raw JSON: custom scripts may report extra fields.
    pub tests: Vec<Value>,
    pub stderr: Option<String>,
    /// Raw stdout when it could not be fully decoded.
    pub malformed: Option<String>,
    pub extra_info: Map<String, Value>,
    pub annotations: Option<Value>,
    pub tags: Option<Value>,
    pub overall_comment: Option<Value>,
}

/// The single document published for every job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub test_groups: Vec<TestGroupResult>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            test_groups: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Assignment-level settings resolved by `settings_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub testers: Vec<TesterSettings>,
    /// Directory holding the assignment's test files.
    #[serde(rename = "_files", default, skip_serializing_if = "Option::is_none")]
    pub files: Option<PathBuf>,
    #[serde(rename = "_error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "_env_status", default, skip_serializing_if = "Option::is_none")]
    pub env_status: Option<String>,
    #[serde(rename = "_last_access", default, skip_serializing_if = "Option::is_none")]
    pub last_access: Option<i64>,
    #[serde(rename = "_user", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    /// Returns `Some(detail)` when upstream settings resolution failed.
    /// The detail is `None` when only `_env_status` signals the failure.
    pub fn failure(&self) -> Option<Option<&str>> {
        if let Some(error) = self.error.as_deref() {
            return Some(Some(error));
        }
        if self.env_status.as_deref() == Some("error") {
            return Some(None);
        }
        None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip_requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip_requirements_file: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of `settings.testers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterSettings {
    pub tester_type: String,
    #[serde(default)]
    pub test_data: Vec<TestData>,
    #[serde(default)]
    pub env_data: EnvData,
    #[serde(default)]
    pub points: BTreeMap<String, u32>,
    /// Environment variables of a pre-provisioned tester environment.
    #[serde(rename = "_env", default)]
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TesterSettings {
    /// Payload handed to a tester process: these settings narrowed to one group.
    pub fn specs_for(&self, test_data: &TestData) -> TesterSpecs {
        TesterSpecs {
            tester_type: self.tester_type.clone(),
            test_data: test_data.clone(),
            env_data: self.env_data.clone(),
            points: self.points.clone(),
            env: self.env.clone(),
            extra: self.extra.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestData {
    /// A list of paths for most testers, a list of objects for notebooks.
    #[serde(default)]
    pub script_files: Value,
    #[serde(default)]
    pub category: Vec<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub extra_info: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tester: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_verbosity: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TestData {
    pub fn matches_any(&self, categories: &[String]) -> bool {
        self.category.iter().any(|c| categories.contains(c))
    }

    pub fn group_name(&self) -> Option<&str> {
        self.extra_info
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// What a tester process reads from stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesterSpecs {
    pub tester_type: String,
    #[serde(default)]
    pub test_data: TestData,
    #[serde(default)]
    pub env_data: EnvData,
    #[serde(default)]
    pub points: BTreeMap<String, u32>,
    #[serde(rename = "_env", default)]
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TesterSpecs {
    /// `script_files` as a list of paths.
    pub fn script_paths(&self) -> Vec<String> {
        match &self.test_data.script_files {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Value::String(single) => vec![single.clone()],
            _ => Vec::new(),
        }
    }
}

/// Credentials used to download a job's files on behalf of `user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub auth_type: String,
    pub credentials: String,
}

impl Credentials {
    pub fn header_value(&self) -> String {
        format!("{} {}", self.auth_type, self.credentials)
    }
}

// Assembly of one test group's result from a tester's captured output
use crate::json_stream::{self, JsonKind};
use autotest_common::types::TestGroupResult;
use serde_json::{Map, Value};

/// Build the result of a test group from what its tester process printed.
///
/// Every object the tester printed is a test, except objects carrying
/// `annotations`, `tags` or `overall_comment`, which fill the fields of the
/// same name. The last such object wins.
pub fn build_group_result(
    stdout: &str,
    stderr: &str,
    time_ms: u64,
    extra_info: &Map<String, Value>,
    timeout: Option<u64>,
) -> TestGroupResult {
    let (values, malformed) = json_stream::decode(stdout, Some(JsonKind::Object));

    let mut group = TestGroupResult {
        time: time_ms,
        timeout,
        stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
        malformed: malformed.then(|| stdout.to_string()),
        extra_info: extra_info.clone(),
        ..TestGroupResult::default()
    };

    for mut value in values {
        let Some(object) = value.as_object_mut() else {
            continue;
        };
        if let Some(annotations) = object.remove("annotations") {
            group.annotations = Some(annotations);
        } else if let Some(tags) = object.remove("tags") {
            group.tags = Some(tags);
        } else if let Some(comment) = object.remove("overall_comment") {
            group.overall_comment = Some(comment);
        } else {
            group.tests.push(value);
        }
    }

    group
}

/// Message recorded as stderr when a group is killed for running too long.
pub fn timeout_message(group_name: Option<&str>, timeout_secs: u64) -> String {
    match group_name {
        Some(name) => format!(
            "Tests for {} did not complete within time limit ({}s)\n",
            name, timeout_secs
        ),
        None => format!("Tests did not complete within time limit ({}s)\n", timeout_secs),
    }
}

mod evaluator;
mod submission;

pub use evaluator::{CompileOutcome, Evaluator};
pub use submission::{JudgePolicy, SubmissionJudge};

use serde::{Deserialize, Serialize};

use crate::create_timestamp;
use crate::status::Status;

/// Shown to submitters instead of internal diagnostics
pub const SYSTEM_ERROR_MESSAGE: &str = "Internal server error";

/// One hidden test of a problem.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    #[serde(alias = "expectedOutput")]
    pub expected_output: String,
    /// Display-only, the judge ignores it
    #[serde(default, alias = "isSample")]
    pub is_sample: bool,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            is_sample: false,
        }
    }
}

/// Outcome of one evaluated test case.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestVerdict {
    #[serde(rename = "test_case_index")]
    pub index: usize,
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
    pub time_ms: u64,
    pub memory_kb: u64,
}

impl TestVerdict {
    pub(crate) fn system_error(index: usize) -> Self {
        Self {
            index,
            status: Status::SystemError,
            stdout: String::new(),
            stderr: SYSTEM_ERROR_MESSAGE.to_string(),
            time_ms: 0,
            memory_kb: 0,
        }
    }
}

/// Final result of judging one submission.
///
/// Field names follow the persisted submission layout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmissionJudgment {
    pub status: Status,
    #[serde(rename = "result_details")]
    pub test_verdicts: Vec<TestVerdict>,
    pub compile_output: String,
    #[serde(rename = "execution_time_ms")]
    pub max_time_ms: u64,
    #[serde(rename = "memory_usage_kb")]
    pub max_memory_kb: u64,
    pub final_stdout: String,
    pub final_stderr: String,
    pub judged_at: String,
}

impl SubmissionJudgment {
    /// Judgment for a failure before any test case ran.
    pub fn system_error() -> Self {
        Self::without_verdicts(Status::SystemError, String::new(), SYSTEM_ERROR_MESSAGE)
    }

    pub fn compilation_error(compile_output: String) -> Self {
        let stderr = compile_output.clone();
        Self::without_verdicts(Status::CompilationError, compile_output, &stderr)
    }

    fn without_verdicts(status: Status, compile_output: String, final_stderr: &str) -> Self {
        Self {
            status,
            test_verdicts: Vec::new(),
            compile_output,
            max_time_ms: 0,
            max_memory_kb: 0,
            final_stdout: String::new(),
            final_stderr: final_stderr.to_string(),
            judged_at: create_timestamp(),
        }
    }

    /// Aggregates the verdicts of the evaluated prefix of `total_cases` test
    /// cases.
    pub fn from_verdicts(
        verdicts: Vec<TestVerdict>,
        total_cases: usize,
        compile_output: String,
    ) -> Self {
        let first_failure = verdicts.iter().find(|v| v.status != Status::Accepted);
        let status = match first_failure {
            Some(verdict) => verdict.status,
            None if verdicts.len() == total_cases => Status::Accepted,
            // Only reachable if the caller stopped early without a failure
            None => Status::SystemError,
        };
        let (final_stdout, final_stderr) = match first_failure.or(verdicts.last()) {
            Some(v) if v.status == Status::Accepted => (v.stdout.clone(), String::new()),
            Some(v) => (v.stdout.clone(), v.stderr.clone()),
            None => (String::new(), String::new()),
        };

        Self {
            status,
            max_time_ms: verdicts.iter().map(|v| v.time_ms).max().unwrap_or(0),
            max_memory_kb: verdicts.iter().map(|v| v.memory_kb).max().unwrap_or(0),
            test_verdicts: verdicts,
            compile_output,
            final_stdout,
            final_stderr,
            judged_at: create_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn verdict(index: usize, status: Status, time_ms: u64, memory_kb: u64) -> TestVerdict {
        TestVerdict {
            index,
            status,
            stdout: format!("out{index}"),
            stderr: format!("err{index}"),
            time_ms,
            memory_kb,
        }
    }

    #[test]
    fn all_accepted_aggregates_maxima() {
        let judgment = SubmissionJudgment::from_verdicts(
            vec![
                verdict(0, Status::Accepted, 10, 300),
                verdict(1, Status::Accepted, 25, 200),
            ],
            2,
            String::new(),
        );
        assert_eq!(judgment.status, Status::Accepted);
        assert_eq!(judgment.max_time_ms, 25);
        assert_eq!(judgment.max_memory_kb, 300);
        assert_eq!(judgment.final_stdout, "out1");
        assert_eq!(judgment.final_stderr, "");
    }

    #[test]
    fn first_failure_decides_status() {
        let judgment = SubmissionJudgment::from_verdicts(
            vec![
                verdict(0, Status::Accepted, 10, 0),
                verdict(1, Status::WrongAnswer, 12, 0),
            ],
            5,
            String::new(),
        );
        assert_eq!(judgment.status, Status::WrongAnswer);
        assert_eq!(judgment.final_stdout, "out1");
        assert_eq!(judgment.final_stderr, "err1");
    }

    #[test]
    fn serializes_to_persisted_layout() {
        let mut judgment = SubmissionJudgment::from_verdicts(
            vec![verdict(0, Status::TimeLimitExceeded, 1001, 512)],
            3,
            String::new(),
        );
        judgment.judged_at = "2025-01-01T00:00:00.000Z".to_string();

        assert_json_eq!(
            serde_json::to_value(&judgment).unwrap(),
            json!({
                "status": "Time Limit Exceeded",
                "result_details": [{
                    "test_case_index": 0,
                    "status": "Time Limit Exceeded",
                    "stdout": "out0",
                    "stderr": "err0",
                    "time_ms": 1001,
                    "memory_kb": 512
                }],
                "compile_output": "",
                "execution_time_ms": 1001,
                "memory_usage_kb": 512,
                "final_stdout": "out0",
                "final_stderr": "err0",
                "judged_at": "2025-01-01T00:00:00.000Z"
            })
        );
    }

    #[test]
    fn test_case_accepts_original_field_names() {
        let case: TestCase =
            serde_json::from_str(r#"{"expectedOutput":"5","isSample":true}"#).unwrap();
        assert_eq!(case.input, "");
        assert_eq!(case.expected_output, "5");
        assert!(case.is_sample);
    }

    #[test]
    fn system_error_hides_details() {
        let judgment = SubmissionJudgment::system_error();
        assert_eq!(judgment.status, Status::SystemError);
        assert!(judgment.test_verdicts.is_empty());
        assert_eq!(judgment.final_stderr, SYSTEM_ERROR_MESSAGE);
    }
}

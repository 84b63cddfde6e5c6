//! End-to-end scenarios against the docker backend.
//!
//! These need a docker daemon and the `judger-python:v1` / `judger-gcc:v1`
//! images, run them with `cargo test -- --ignored`.

use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use judger::config::DockerConfig;
use judger::judge::{JudgePolicy, SubmissionJudge, TestCase};
use judger::language::LanguageRegistry;
use judger::limits::ResourceLimits;
use judger::sandbox::DockerRunner;
use judger::status::Status;

struct Fixture {
    root: PathBuf,
    judge: SubmissionJudge,
}

impl Fixture {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("judger-docker-{}", uuid::Uuid::new_v4()));
        let runner = DockerRunner::build(&DockerConfig::default()).unwrap();
        let judge = SubmissionJudge::new(
            Arc::new(LanguageRegistry::builtin()),
            Arc::new(runner),
            root.clone(),
            JudgePolicy::default(),
        );
        Self { root, judge }
    }

    fn leftovers(&self) -> usize {
        std::fs::read_dir(&self.root)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn limits() -> ResourceLimits {
    ResourceLimits::new(1000, 256).unwrap()
}

#[test]
#[ignore]
fn python_echo_is_accepted() {
    let fixture = Fixture::new();
    let judgment = fixture.judge.judge(
        "python",
        "print(input())",
        &[TestCase::new("5\n", "5")],
        &limits(),
    );
    assert_eq!(judgment.status, Status::Accepted);
    assert_eq!(judgment.test_verdicts.len(), 1);
    assert_eq!(judgment.test_verdicts[0].status, Status::Accepted);
    assert_eq!(fixture.leftovers(), 0);
}

#[test]
#[ignore]
fn cpp_syntax_error_is_a_compilation_error() {
    let fixture = Fixture::new();
    let judgment = fixture.judge.judge(
        "c_cpp",
        "int main() { return 0 }",
        &[TestCase::new("", "")],
        &limits(),
    );
    assert_eq!(judgment.status, Status::CompilationError);
    assert!(judgment.test_verdicts.is_empty());
    assert!(!judgment.compile_output.is_empty());
}

#[test]
#[ignore]
fn python_infinite_loop_exceeds_time_limit() {
    let fixture = Fixture::new();
    let judgment = fixture.judge.judge(
        "python",
        "while True: pass",
        &[TestCase::new("", "1"), TestCase::new("", "1")],
        &limits(),
    );
    assert_eq!(judgment.status, Status::TimeLimitExceeded);
    assert_eq!(judgment.test_verdicts.len(), 1);
    assert_eq!(fixture.leftovers(), 0);
}

#[test]
#[ignore]
fn second_case_wrong_answer() {
    let fixture = Fixture::new();
    let judgment = fixture.judge.judge(
        "python",
        "print(1)",
        &[TestCase::new("", "1"), TestCase::new("", "2")],
        &limits(),
    );
    let statuses: Vec<Status> = judgment.test_verdicts.iter().map(|v| v.status).collect();
    assert_eq!(statuses, vec![Status::Accepted, Status::WrongAnswer]);
    assert_eq!(judgment.status, Status::WrongAnswer);
}

#[test]
#[ignore]
fn unsupported_language_creates_no_workspace() {
    let fixture = Fixture::new();
    let judgment = fixture
        .judge
        .judge("ruby", "puts gets", &[TestCase::new("", "")], &limits());
    assert_eq!(judgment.status, Status::SystemError);
    assert!(!fixture.root.exists());
}

#[test]
#[ignore]
fn large_allocation_exceeds_memory_limit() {
    let fixture = Fixture::new();
    let judgment = fixture.judge.judge(
        "python",
        "x = b'a' * (1024 * 1024 * 1024)\nprint(len(x))",
        &[TestCase::new("", "")],
        &ResourceLimits::new(5000, 64).unwrap(),
    );
    assert_eq!(judgment.status, Status::MemoryLimitExceeded);
    assert_eq!(fixture.leftovers(), 0);
}

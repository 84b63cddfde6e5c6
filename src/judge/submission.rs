use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::language::LanguageRegistry;
use crate::limits::ResourceLimits;
use crate::normalize::CompareMode;
use crate::sandbox::{IsolatedRunner, Workspace};
use crate::status::Status;

use super::{CompileOutcome, Evaluator, SubmissionJudgment, TestCase};

/// Judge-wide knobs that are not part of a problem's limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JudgePolicy {
    pub compile_time_floor_ms: u64,
    pub compile_memory_floor_mb: u64,
    pub compare: CompareMode,
}

impl Default for JudgePolicy {
    fn default() -> Self {
        Self {
            compile_time_floor_ms: 5000,
            compile_memory_floor_mb: 512,
            compare: CompareMode::Standard,
        }
    }
}

impl From<&Config> for JudgePolicy {
    fn from(config: &Config) -> Self {
        Self {
            compile_time_floor_ms: config.compile.time_floor_ms,
            compile_memory_floor_mb: config.compile.memory_floor_mb,
            compare: config.compare,
        }
    }
}

/// Judges whole submissions: one workspace, one compile, then the test cases
/// in order until the first failure.
///
/// Shared by all workers; every call works in its own workspace.
pub struct SubmissionJudge {
    languages: Arc<LanguageRegistry>,
    runner: Arc<dyn IsolatedRunner>,
    sandbox_root: PathBuf,
    policy: JudgePolicy,
}

impl SubmissionJudge {
    pub fn new(
        languages: Arc<LanguageRegistry>,
        runner: Arc<dyn IsolatedRunner>,
        sandbox_root: PathBuf,
        policy: JudgePolicy,
    ) -> Self {
        Self {
            languages,
            runner,
            sandbox_root,
            policy,
        }
    }

    /// Judges `source_code` against `test_cases`.
    ///
    /// Never fails: problems on the judge's side are reported as a
    /// `System Error` judgment. The workspace is gone when this returns.
    pub fn judge(
        &self,
        language: &str,
        source_code: &str,
        test_cases: &[TestCase],
        limits: &ResourceLimits,
    ) -> SubmissionJudgment {
        let profile = match self.languages.get(language) {
            Ok(profile) => profile,
            Err(e) => {
                log::error!("Rejecting submission: {e}");
                return SubmissionJudgment::system_error();
            }
        };

        let workspace = match Workspace::create(&self.sandbox_root) {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to prepare workspace: {e:#}");
                return SubmissionJudgment::system_error();
            }
        };
        log::info!(
            "Judging {} submission in workspace {} with {} runner ({} test cases, {} ms, {} MB)",
            profile.name(),
            workspace.id(),
            self.runner.name(),
            test_cases.len(),
            limits.time_limit_ms(),
            limits.memory_limit_mb()
        );

        if let Err(e) = workspace.write_source_file(profile.source_file(), source_code) {
            log::error!("Workspace {}: {e:#}", workspace.id());
            return SubmissionJudgment::system_error();
        }

        let evaluator = Evaluator::new(self.runner.as_ref(), profile, limits, &self.policy);
        let compile_output = match evaluator.compile(&workspace) {
            Ok(CompileOutcome::Ready { output }) => output,
            Ok(CompileOutcome::Failed { output }) => {
                log::info!("Workspace {}: {}", workspace.id(), Status::CompilationError);
                return SubmissionJudgment::compilation_error(output);
            }
            Err(e) => {
                log::error!("Workspace {}: {e:#}", workspace.id());
                return SubmissionJudgment::system_error();
            }
        };

        let mut verdicts = Vec::with_capacity(test_cases.len());
        for (index, case) in test_cases.iter().enumerate() {
            let verdict = evaluator.evaluate(&workspace, index, case);
            log::debug!(
                "Workspace {} test case {index}: {} ({} ms)",
                workspace.id(),
                verdict.status,
                verdict.time_ms
            );
            let failed = verdict.status != Status::Accepted;
            verdicts.push(verdict);
            if failed {
                break;
            }
        }

        let judgment = SubmissionJudgment::from_verdicts(verdicts, test_cases.len(), compile_output);
        log::info!(
            "Workspace {}: {} after {} of {} test cases",
            workspace.id(),
            judgment.status,
            judgment.test_verdicts.len(),
            test_cases.len()
        );
        workspace.destroy();
        judgment
    }
}

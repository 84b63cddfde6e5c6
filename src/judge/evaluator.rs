use anyhow::{Context, Result};

use crate::language::LanguageProfile;
use crate::limits::ResourceLimits;
use crate::sandbox::{
    COMPILE_ERROR_FILE, COMPILE_OUTPUT_FILE, ERROR_FILE, ExecutionResult, IsolatedRunner,
    OUTPUT_FILE, RunRequest, Workspace,
};
use crate::status::Status;

use super::{JudgePolicy, TestCase, TestVerdict};

/// Result of the compile step of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Nothing to compile, or the artifact was built. Carries compiler
    /// warnings, if any.
    Ready { output: String },
    Failed { output: String },
}

/// Drives the compile step and single test-case runs of one submission,
/// classifying raw execution results into verdicts.
pub struct Evaluator<'a> {
    runner: &'a dyn IsolatedRunner,
    profile: &'a LanguageProfile,
    limits: &'a ResourceLimits,
    policy: &'a JudgePolicy,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        runner: &'a dyn IsolatedRunner,
        profile: &'a LanguageProfile,
        limits: &'a ResourceLimits,
        policy: &'a JudgePolicy,
    ) -> Self {
        Self {
            runner,
            profile,
            limits,
            policy,
        }
    }

    /// Compiles the source already written to `workspace`.
    ///
    /// `Err` is an infrastructure failure, a broken program is
    /// `CompileOutcome::Failed`.
    pub fn compile(&self, workspace: &Workspace) -> Result<CompileOutcome> {
        let command = self
            .profile
            .artifact()
            .and_then(|artifact| self.profile.compile_command(self.profile.source_file(), artifact));
        let Some(command) = command else {
            return Ok(CompileOutcome::Ready {
                output: String::new(),
            });
        };

        let timeout = self.limits.compile_time_limit(self.policy.compile_time_floor_ms);
        let memory_limit_mb = self
            .limits
            .compile_memory_limit_mb(self.policy.compile_memory_floor_mb);
        let request = RunRequest {
            image: self.profile.image(),
            command: &command,
            workdir: workspace.path(),
            timeout,
            memory_limit_mb,
            stdout_file: COMPILE_OUTPUT_FILE,
            stderr_file: COMPILE_ERROR_FILE,
        };
        let result = self
            .runner
            .run(&request)
            .with_context(|| format!("Compile step failed to run: {command}"))?;

        let mut output = join_output(&result.stdout, &result.stderr);
        if result.timed_out {
            push_line(
                &mut output,
                &format!("Compilation timed out after {} ms", timeout.as_millis()),
            );
            return Ok(CompileOutcome::Failed { output });
        }
        if result.memory_exceeded {
            push_line(
                &mut output,
                &format!("Compilation exceeded the memory limit of {memory_limit_mb} MB"),
            );
            return Ok(CompileOutcome::Failed { output });
        }
        if !result.succeeded() {
            if output.is_empty() {
                output = format!("Compiler exited with code {}", result.exit_code);
            }
            return Ok(CompileOutcome::Failed { output });
        }

        Ok(CompileOutcome::Ready { output })
    }

    /// Runs test case `index` against the prepared workspace. Infrastructure
    /// failures become a `System Error` verdict.
    pub fn evaluate(&self, workspace: &Workspace, index: usize, case: &TestCase) -> TestVerdict {
        match self.try_evaluate(workspace, case) {
            Ok(result) => self.classify(index, result, case),
            Err(e) => {
                log::error!(
                    "System error on test case {index} in workspace {}: {e:#}",
                    workspace.id()
                );
                TestVerdict::system_error(index)
            }
        }
    }

    fn try_evaluate(&self, workspace: &Workspace, case: &TestCase) -> Result<ExecutionResult> {
        workspace.write_input_file(&case.input)?;
        workspace.clear_run_outputs()?;

        let command = self
            .profile
            .run_command(self.profile.program(), self.limits.memory_limit_mb());
        let request = RunRequest {
            image: self.profile.image(),
            command: &command,
            workdir: workspace.path(),
            timeout: self.limits.time_limit(),
            memory_limit_mb: self.limits.memory_limit_mb(),
            stdout_file: OUTPUT_FILE,
            stderr_file: ERROR_FILE,
        };
        self.runner
            .run(&request)
            .with_context(|| format!("Run step failed to run: {command}"))
    }

    fn classify(&self, index: usize, result: ExecutionResult, case: &TestCase) -> TestVerdict {
        let status = if result.timed_out {
            Status::TimeLimitExceeded
        } else if result.memory_exceeded {
            Status::MemoryLimitExceeded
        } else if result.exit_code != 0 {
            Status::RuntimeError
        } else if self.policy.compare.matches(&result.stdout, &case.expected_output) {
            Status::Accepted
        } else {
            Status::WrongAnswer
        };

        TestVerdict {
            index,
            status,
            stdout: result.stdout,
            stderr: result.stderr,
            time_ms: result.elapsed_ms,
            memory_kb: result.memory_kb,
        }
    }
}

fn join_output(stdout: &str, stderr: &str) -> String {
    let mut output = stdout.trim_end().to_string();
    push_line(&mut output, stderr.trim_end());
    output
}

fn push_line(output: &mut String, line: &str) {
    if line.is_empty() {
        return;
    }
    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(line);
}

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::judge::{SubmissionJudge, SubmissionJudgment};
use crate::problem::{ProblemRepository, SubmissionStore};
use crate::queue::JudgeQueue;

/// Judgment of one queued submission, as published by the workers.
#[derive(Serialize, Debug, Clone)]
pub struct JudgeReport {
    pub submission_id: String,
    #[serde(flatten)]
    pub judgment: SubmissionJudgment,
}

/// Everything a worker needs besides its queue; shared by the whole pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub judge: Arc<SubmissionJudge>,
    pub problems: Arc<dyn ProblemRepository>,
    pub submissions: Arc<dyn SubmissionStore>,
}

impl WorkerContext {
    /// Looks up and judges one submission. Blocking.
    pub fn judge_submission(&self, submission_id: &str) -> SubmissionJudgment {
        match self.try_judge_submission(submission_id) {
            Ok(judgment) => judgment,
            Err(e) => {
                log::error!("Submission {submission_id} cannot be judged: {e}");
                SubmissionJudgment::system_error()
            }
        }
    }

    fn try_judge_submission(&self, submission_id: &str) -> Result<SubmissionJudgment> {
        let (language, source_code) = self.submissions.source(submission_id)?;
        let problem_id = self.submissions.problem_id(submission_id)?;
        let limits = self.problems.limits(&problem_id)?;
        let test_cases = self.problems.test_cases(&problem_id)?;

        // An accepted verdict needs at least one passed test
        if test_cases.is_empty() {
            log::error!("Problem {problem_id} has no test cases, submission {submission_id} not judged");
            return Ok(SubmissionJudgment::system_error());
        }

        Ok(self
            .judge
            .judge(&language, &source_code, &test_cases, &limits))
    }
}

pub async fn worker(
    id: u8,
    context: WorkerContext,
    queue: Arc<JudgeQueue>,
    results: UnboundedSender<JudgeReport>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            submission_id = queue.pop() => {
                log::info!("Worker {id} got submission {submission_id} from queue");

                // The judge blocks on child processes, keep it off the runtime
                let context = context.clone();
                let blocking_id = submission_id.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    context.judge_submission(&blocking_id)
                });

                let judgment = match handle.await {
                    Ok(judgment) => judgment,
                    Err(e) => {
                        log::error!("Judging submission {submission_id} failed on worker {id}: {e:?}");
                        SubmissionJudgment::system_error()
                    }
                };
                log::info!("Submission {submission_id} finished on worker {id}: {}", judgment.status);

                let report = JudgeReport { submission_id, judgment };
                if results.send(report).is_err() {
                    log::warn!("Result receiver is gone, worker {id} stopping");
                    break;
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

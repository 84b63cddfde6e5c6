use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use judger::config::{CliArgs, Command, Config};
use judger::judge::{JudgePolicy, SubmissionJudge};
use judger::language::LanguageRegistry;
use judger::problem::{FsProblemRepository, JsonSubmissionStore, SubmissionRecord};
use judger::queue::JudgeQueue;
use judger::sandbox::create_runner;
use judger::worker::{JudgeReport, WorkerContext, worker};

const CLI_SUBMISSION_ID: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    if cli.threads == 0 {
        bail!("The number of worker threads must not be 0");
    }
    let config = cli.to_config().context("Failed to load configuration")?;
    let languages = Arc::new(
        LanguageRegistry::with_languages(config.languages.clone())
            .context("Invalid language configuration")?,
    );

    match cli.command {
        Command::Languages => {
            for profile in languages.profiles() {
                let kind = if profile.has_compile_step() {
                    "compiled"
                } else {
                    "interpreted"
                };
                println!(
                    "{}\t{}\t{}\t{kind}",
                    profile.name(),
                    profile.source_file(),
                    profile.image()
                );
            }
            Ok(())
        }
        Command::Judge {
            problems,
            problem,
            language,
            source,
        } => {
            let source_code = std::fs::read_to_string(&source)
                .with_context(|| format!("Failed to read {}", source.display()))?;
            let store = JsonSubmissionStore::from_records(vec![SubmissionRecord {
                id: CLI_SUBMISSION_ID.to_string(),
                problem_id: problem,
                language,
                source_code,
            }]);
            let context = build_context(&config, languages, &problems, Arc::new(store))?;

            let judgment =
                tokio::task::spawn_blocking(move || context.judge_submission(CLI_SUBMISSION_ID))
                    .await?;
            let report = JudgeReport {
                submission_id: CLI_SUBMISSION_ID.to_string(),
                judgment,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Batch {
            problems,
            submissions,
        } => {
            let store = Arc::new(JsonSubmissionStore::load(&submissions)?);
            let ids: Vec<String> = store.records().iter().map(|r| r.id.clone()).collect();
            let context = build_context(&config, languages, &problems, store)?;
            run_batch(cli.threads, context, ids).await
        }
    }
}

fn build_context(
    config: &Config,
    languages: Arc<LanguageRegistry>,
    problems: &Path,
    submissions: Arc<JsonSubmissionStore>,
) -> anyhow::Result<WorkerContext> {
    let runner = create_runner(config).context("Failed to create sandbox runner")?;
    let sandbox_root = config.sandbox_root();
    log::info!("Sandbox workspaces live under {}", sandbox_root.display());

    let judge = SubmissionJudge::new(languages, runner, sandbox_root, JudgePolicy::from(config));
    Ok(WorkerContext {
        judge: Arc::new(judge),
        problems: Arc::new(FsProblemRepository::new(problems)),
        submissions,
    })
}

async fn run_batch(n_threads: u8, context: WorkerContext, ids: Vec<String>) -> anyhow::Result<()> {
    let total = ids.len();
    if total == 0 {
        log::warn!("No submissions to judge");
        return Ok(());
    }

    let queue = Arc::new(JudgeQueue::new());
    for id in ids {
        queue.push(id).await;
    }
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let shutdown_token = CancellationToken::new();

    let mut workers = JoinSet::new();
    for i in 1..=n_threads {
        workers.spawn(worker(
            i,
            context.clone(),
            queue.clone(),
            results_tx.clone(),
            shutdown_token.clone(),
        ));
    }
    drop(results_tx);

    let mut judged = 0;
    while judged < total {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-c received, shutting down...");
                break;
            }
            Some(report) = results_rx.recv() => {
                println!("{}", serde_json::to_string(&report)?);
                judged += 1;
            }
            Some(res_worker) = workers.join_next() => {
                log::error!("A worker terminated unexpectedly: {:?}", res_worker);
                break;
            }
        }
    }

    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {:?}", e);
            } else {
                log::error!("Worker handle finished with error: {:?}", e);
            }
        }
    }

    log::info!("Judged {judged} of {total} submissions");
    Ok(())
}

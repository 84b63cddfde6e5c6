use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Datelike};
use uuid::Uuid;

use crate::config::DockerConfig;

use super::runner::{collect_output, drain_pipe};
use super::{ExecutionResult, IsolatedRunner, RunRequest};

const CONTAINER_WORKDIR: &str = "/usr/src/app";
const POLL_INTERVAL: Duration = Duration::from_millis(10);
// `docker run` exits with 125 when the daemon could not create or start the
// container. A program may exit with 125 too, so the container state decides.
const DOCKER_RUN_FAILURE: i32 = 125;

/// Runs commands in throwaway Docker containers.
///
/// Each command gets a fresh container with no network, no capabilities, an
/// unprivileged user, a process cap and a memory cap without swap. The
/// workspace is bind-mounted as the working directory.
pub struct DockerRunner {
    binary: String,
    user: String,
    pids_limit: u32,
    startup_grace: Duration,
    output_limit: u64,
}

/// The parts of `docker inspect` the classification needs
#[derive(Debug, PartialEq, Eq)]
struct ContainerState {
    /// False while `StartedAt` is docker's zero time
    started: bool,
    oom_killed: bool,
    exit_code: i32,
    elapsed_ms: Option<u64>,
}

/// Force-removes the container when dropped
struct ContainerGuard<'a> {
    binary: &'a str,
    name: &'a str,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        let out = Command::new(self.binary)
            .args(["rm", "--force", self.name])
            .stdin(Stdio::null())
            .output();

        if !out.is_ok_and(|o| o.status.success()) {
            log::error!("Failed to remove container {}", self.name);
        }
    }
}

impl DockerRunner {
    pub fn build(config: &DockerConfig) -> Result<Self> {
        let out = Command::new(&config.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| anyhow!("Failed to spawn {} --version: {}", config.binary, e))?;

        if !out.status.success() {
            bail!("{} --version exited with non-zero status", config.binary);
        }
        log::info!(
            "DockerRunner using {}",
            String::from_utf8_lossy(&out.stdout).trim()
        );

        Ok(Self {
            binary: config.binary.clone(),
            user: config.user.clone(),
            pids_limit: config.pids_limit,
            startup_grace: Duration::from_millis(config.startup_grace_ms),
            output_limit: config.output_limit_kb * 1024,
        })
    }

    fn run_args(&self, name: &str, request: &RunRequest<'_>) -> Vec<String> {
        let memory = format!("{}m", request.memory_limit_mb);
        vec![
            "run".to_string(),
            format!("--name={name}"),
            format!("--user={}", self.user),
            "--network=none".to_string(),
            "--cap-drop=ALL".to_string(),
            "--security-opt=no-new-privileges".to_string(),
            format!("--pids-limit={}", self.pids_limit),
            format!("--memory={memory}"),
            format!("--memory-swap={memory}"),
            format!("--ulimit=fsize={}", self.output_limit),
            format!("--volume={}:{CONTAINER_WORKDIR}", request.workdir.display()),
            format!("--workdir={CONTAINER_WORKDIR}"),
            request.image.to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            request.command.to_string(),
        ]
    }

    fn kill(&self, name: &str) {
        let out = Command::new(&self.binary)
            .args(["kill", "--signal=KILL", name])
            .stdin(Stdio::null())
            .output();
        if !out.is_ok_and(|o| o.status.success()) {
            log::warn!("docker kill {name} failed, container may have exited already");
        }
    }

    fn inspect(&self, name: &str) -> Result<ContainerState> {
        let out = Command::new(&self.binary)
            .args([
                "inspect",
                "--format",
                "{{.State.OOMKilled}} {{.State.ExitCode}} {{.State.StartedAt}} {{.State.FinishedAt}}",
                name,
            ])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to spawn docker inspect {name}"))?;

        if !out.status.success() {
            bail!(
                "docker inspect {name} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        parse_state(&String::from_utf8_lossy(&out.stdout))
    }
}

impl IsolatedRunner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<ExecutionResult> {
        let name = format!("judger-{}", Uuid::new_v4());
        let start_time = Instant::now();

        let mut child = Command::new(&self.binary)
            .args(self.run_args(&name, request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {} run", self.binary))?;
        let _guard = ContainerGuard {
            binary: &self.binary,
            name: &name,
        };

        let stdout_pipe = drain_pipe(child.stdout.take(), self.output_limit);
        let stderr_pipe = drain_pipe(child.stderr.take(), self.output_limit);

        // The grace period absorbs container start-up; the measured run time
        // is checked against the real limit below
        let deadline = start_time + request.timeout + self.startup_grace;
        let mut killed = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                self.kill(&name);
                let _ = child.kill();
                killed = true;
                break child.wait()?;
            }
            thread::sleep(POLL_INTERVAL);
        };
        let host_elapsed = start_time.elapsed();

        let (stdout, stderr) = collect_output(request, self.output_limit, stdout_pipe, stderr_pipe);

        let run_failed = !killed && status.code() == Some(DOCKER_RUN_FAILURE);
        let state = match self.inspect(&name) {
            Ok(state) => state,
            Err(e) if run_failed => bail!("docker run failed: {} ({e:#})", stderr.trim()),
            Err(e) => return Err(e.context("Container state unavailable")),
        };
        if !state.started {
            bail!("Container {name} never started: {}", stderr.trim());
        }

        let elapsed_ms = state
            .elapsed_ms
            .unwrap_or(host_elapsed.as_millis() as u64);
        let mut result = ExecutionResult {
            stdout,
            stderr,
            exit_code: state.exit_code,
            elapsed_ms,
            ..Default::default()
        };

        if killed {
            result.timed_out = true;
        } else if state.oom_killed {
            result.memory_exceeded = true;
            result.memory_kb = request.memory_limit_mb * 1024;
        } else if Duration::from_millis(elapsed_ms) > request.timeout {
            result.timed_out = true;
        }

        log::debug!(
            "Container {name} exited with {} after {elapsed_ms}ms (timed out: {}, oom: {})",
            result.exit_code,
            result.timed_out,
            result.memory_exceeded
        );
        Ok(result)
    }
}

/// Parses `<oom> <exit code> <started at> <finished at>`.
fn parse_state(line: &str) -> Result<ContainerState> {
    let mut fields = line.split_whitespace();
    let (Some(oom), Some(code), started, finished) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        bail!("Unexpected docker inspect output {line:?}");
    };

    let oom_killed = oom
        .parse::<bool>()
        .with_context(|| format!("Bad OOMKilled value {oom:?}"))?;
    let exit_code = code
        .parse::<i32>()
        .with_context(|| format!("Bad ExitCode value {code:?}"))?;

    let started_at = started.map(DateTime::parse_from_rfc3339);
    let was_started = match &started_at {
        None => false,
        Some(Ok(at)) => at.year() > 1,
        Some(Err(_)) => true,
    };

    let elapsed_ms = match (started, finished) {
        _ if !was_started => None,
        (Some(started), Some(finished)) => {
            match (
                DateTime::parse_from_rfc3339(started),
                DateTime::parse_from_rfc3339(finished),
            ) {
                (Ok(s), Ok(f)) if f >= s => Some((f - s).num_milliseconds() as u64),
                _ => None,
            }
        }
        _ => None,
    };

    Ok(ContainerState {
        started: was_started,
        oom_killed,
        exit_code,
        elapsed_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn parses_inspect_output() {
        let state = parse_state(
            "false 0 2024-05-01T10:00:00.100000000Z 2024-05-01T10:00:01.350000000Z\n",
        )
        .unwrap();
        assert_eq!(
            state,
            ContainerState {
                started: true,
                oom_killed: false,
                exit_code: 0,
                elapsed_ms: Some(1250),
            }
        );
    }

    #[test]
    fn oom_flag_is_read_independently_of_exit_code() {
        let state = parse_state(
            "true 137 2024-05-01T10:00:00Z 2024-05-01T10:00:00.5Z",
        )
        .unwrap();
        assert!(state.oom_killed);
        assert_eq!(state.exit_code, 137);

        let state = parse_state("false 137 2024-05-01T10:00:00Z 2024-05-01T10:00:00.5Z").unwrap();
        assert!(!state.oom_killed);
    }

    #[test]
    fn unparsable_timestamps_leave_elapsed_unknown() {
        let state = parse_state("false 1 2024-05-01T10:00:00Z garbage").unwrap();
        assert!(state.started);
        assert_eq!(state.elapsed_ms, None);
        assert!(parse_state("").is_err());
        assert!(parse_state("maybe 0").is_err());
    }

    #[test]
    fn zero_start_time_means_never_started() {
        let state =
            parse_state("false 125 0001-01-01T00:00:00Z 0001-01-01T00:00:00Z").unwrap();
        assert!(!state.started);
        assert_eq!(state.elapsed_ms, None);
    }

    #[test]
    fn run_arguments_enforce_isolation() {
        let runner = DockerRunner {
            binary: "docker".to_string(),
            user: "appuser".to_string(),
            pids_limit: 64,
            startup_grace: Duration::from_secs(2),
            output_limit: 1024,
        };
        let request = RunRequest {
            image: "judger-python:v1",
            command: "python3 main.py < input.txt > output.txt 2> error.txt",
            workdir: Path::new("/sandboxes/abc"),
            timeout: Duration::from_secs(1),
            memory_limit_mb: 256,
            stdout_file: "output.txt",
            stderr_file: "error.txt",
        };
        let args = runner.run_args("judger-x", &request);

        for expected in [
            "--network=none",
            "--cap-drop=ALL",
            "--user=appuser",
            "--pids-limit=64",
            "--memory=256m",
            "--memory-swap=256m",
            "--volume=/sandboxes/abc:/usr/src/app",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        assert_eq!(args.last().unwrap(), request.command);
        assert!(!args.iter().any(|a| a == "--rm"));
    }

    /// A stand-in docker binary: `run` and `inspect` execute the given shell
    /// snippets, `kill` and `rm` leave marker files next to the script.
    struct FakeDocker {
        dir: std::path::PathBuf,
        runner: DockerRunner,
    }

    impl FakeDocker {
        fn new(run: &str, inspect: &str) -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = std::env::temp_dir().join(format!("judger-fake-docker-{}", Uuid::new_v4()));
            std::fs::create_dir_all(dir.join("work")).unwrap();
            let script = dir.join("docker");
            std::fs::write(
                &script,
                format!(
                    "#!/bin/sh\n\
                     marker=\"$(dirname \"$0\")\"\n\
                     case \"$1\" in\n\
                     --version) echo 'Docker version fake' ;;\n\
                     run) {run} ;;\n\
                     inspect) {inspect} ;;\n\
                     kill) touch \"$marker/killed\" ;;\n\
                     rm) touch \"$marker/removed\" ;;\n\
                     esac\n"
                ),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

            let config = DockerConfig {
                binary: script.display().to_string(),
                startup_grace_ms: 0,
                ..Default::default()
            };
            // Another test thread may still hold the freshly written script
            // open across a fork (ETXTBSY)
            let runner = (0..50)
                .find_map(|_| match DockerRunner::build(&config) {
                    Ok(runner) => Some(runner),
                    Err(_) => {
                        thread::sleep(Duration::from_millis(20));
                        None
                    }
                })
                .unwrap();
            Self { dir, runner }
        }

        fn run(&self, timeout_ms: u64) -> Result<ExecutionResult> {
            let workdir = self.dir.join("work");
            let request = RunRequest {
                image: "judger-python:v1",
                command: "python3 main.py",
                workdir: &workdir,
                timeout: Duration::from_millis(timeout_ms),
                memory_limit_mb: 64,
                stdout_file: "output.txt",
                stderr_file: "error.txt",
            };
            self.runner.run(&request)
        }

        fn marked(&self, marker: &str) -> bool {
            self.dir.join(marker).exists()
        }
    }

    impl Drop for FakeDocker {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    const SHORT_RUN: &str = "2024-05-01T10:00:00Z 2024-05-01T10:00:00.050Z";

    #[test]
    fn program_exit_125_is_not_a_backend_failure() {
        let docker = FakeDocker::new("exit 125", &format!("echo false 125 {SHORT_RUN}"));
        let result = docker.run(1000).unwrap();
        assert_eq!(result.exit_code, 125);
        assert!(!result.timed_out);
        assert!(!result.memory_exceeded);
        assert!(!result.succeeded());
        assert!(docker.marked("removed"));
    }

    #[test]
    fn container_that_never_started_is_a_backend_failure() {
        let docker = FakeDocker::new(
            "echo 'Unable to find image' >&2; exit 125",
            "echo false 0 0001-01-01T00:00:00Z 0001-01-01T00:00:00Z",
        );
        let err = docker.run(1000).unwrap_err();
        assert!(format!("{err:#}").contains("never started"), "{err:#}");
        assert!(docker.marked("removed"));
    }

    #[test]
    fn missing_container_after_exit_125_is_a_backend_failure() {
        let docker = FakeDocker::new(
            "echo 'daemon unreachable' >&2; exit 125",
            "echo 'No such object' >&2; exit 1",
        );
        let err = docker.run(1000).unwrap_err();
        assert!(format!("{err:#}").contains("docker run failed"), "{err:#}");
    }

    #[test]
    fn inspect_failure_is_a_backend_failure() {
        let docker = FakeDocker::new("exit 0", "exit 1");
        assert!(docker.run(1000).is_err());
        assert!(docker.marked("removed"));
    }

    #[test]
    fn deadline_kills_the_container() {
        let docker = FakeDocker::new("exec sleep 5", &format!("echo false 137 {SHORT_RUN}"));
        let started = Instant::now();
        let result = docker.run(100).unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(result.timed_out);
        assert!(!result.memory_exceeded);
        assert!(docker.marked("killed"));
        assert!(docker.marked("removed"));
    }

    #[test]
    fn oom_killed_container_exceeds_memory() {
        let docker = FakeDocker::new("exit 137", &format!("echo true 137 {SHORT_RUN}"));
        let result = docker.run(1000).unwrap();
        assert!(result.memory_exceeded);
        assert!(!result.timed_out);
        assert_eq!(result.memory_kb, 64 * 1024);
        assert_eq!(result.exit_code, 137);
    }

    #[test]
    fn exit_137_without_oom_flag_is_a_plain_exit() {
        let docker = FakeDocker::new("exit 137", &format!("echo false 137 {SHORT_RUN}"));
        let result = docker.run(1000).unwrap();
        assert!(!result.memory_exceeded);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, 137);
        assert_eq!(result.elapsed_ms, 50);
    }

    #[test]
    fn container_run_time_over_the_limit_is_a_timeout() {
        let docker = FakeDocker::new(
            "exit 0",
            "echo false 0 2024-05-01T10:00:00Z 2024-05-01T10:00:02Z",
        );
        let result = docker.run(1000).unwrap();
        assert!(result.timed_out);
        assert_eq!(result.elapsed_ms, 2000);
        assert!(!docker.marked("killed"));
    }

    #[test]
    fn output_comes_from_the_workspace_files() {
        let docker = FakeDocker::new(
            "echo piped; echo 42 > \"$marker/work/output.txt\"",
            &format!("echo false 0 {SHORT_RUN}"),
        );
        let result = docker.run(1000).unwrap();
        assert_eq!(result.stdout, "42\n");
        assert!(result.succeeded());
    }
}

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use crate::config::LocalConfig;

use super::cgroup::{CgroupParent, MemoryCgroup};
use super::runner::{collect_output, drain_pipe};
use super::{ExecutionResult, IsolatedRunner, RunRequest};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// What common runtimes print to stderr when an allocation fails, lowercased
const ALLOCATION_FAILURE_MARKERS: &[&str] = &[
    "out of memory",
    "cannot allocate memory",
    "memoryerror",
    "bad_alloc",
    "outofmemoryerror",
    "memory allocation of",
];

/// A runner that executes commands directly on the host
///
/// LocalRunner puts each command in its own process group and kills the whole
/// group on timeout. Memory is capped by a per-run cgroup v2 group when one
/// can be set up, by `RLIMIT_AS` otherwise. Only when the judge runs as root
/// does it also detach the network and drop to an unprivileged identity.
/// It is intended for development and testing where Docker is not available.
pub struct LocalRunner {
    uid: u32,
    gid: u32,
    nproc: u64,
    output_limit: u64,
    drop_privileges: bool,
    cgroups: Option<CgroupParent>,
}

/// What `wait4` reported for the reaped process
struct Reaped {
    exit_code: i32,
    peak_rss_kb: u64,
}

impl LocalRunner {
    pub fn build(config: &LocalConfig) -> Result<Self> {
        let is_root = unsafe { libc::geteuid() } == 0;
        if is_root && !config.drop_privileges && !config.allow_root_without_isolation {
            bail!(
                "Refusing to run programs as root without isolation, enable drop_privileges \
                 or set allow_root_without_isolation"
            );
        }
        let drop_privileges = config.drop_privileges && is_root;
        if drop_privileges {
            log::warn!(
                "LocalRunner isolates with rlimits and a network namespace only - prefer the docker backend"
            );
        } else {
            log::warn!(
                "LocalRunner provides NO network isolation or privilege drop - use only in trusted environments"
            );
        }

        let cgroups = config
            .cgroup_root
            .as_deref()
            .and_then(|path| match CgroupParent::prepare(path) {
                Ok(parent) => {
                    log::info!("LocalRunner caps memory with cgroups under {}", path.display());
                    Some(parent)
                }
                Err(e) => {
                    log::warn!("Memory cgroups unavailable ({e:#}), capping memory with RLIMIT_AS");
                    None
                }
            });

        Ok(Self {
            uid: config.uid,
            gid: config.gid,
            nproc: config.nproc,
            output_limit: config.output_limit_kb * 1024,
            drop_privileges,
            cgroups,
        })
    }

    fn command(&self, request: &RunRequest<'_>, cgroup: Option<&MemoryCgroup>) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(request.command)
            .current_dir(request.workdir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // A cgroup charges only touched pages, `RLIMIT_AS` every mapping
        let address_space = match cgroup {
            Some(_) => libc::RLIM_INFINITY,
            None => (request.memory_limit_mb * 1024 * 1024) as libc::rlim_t,
        };
        let cgroup_procs = cgroup.and_then(MemoryCgroup::procs_fd);
        let fsize = self.output_limit;
        let drop_privileges = self.drop_privileges;
        let (uid, gid, nproc) = (self.uid, self.gid, self.nproc);

        // Only async-signal-safe calls between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                // Must happen before the identity switch
                if let Some(fd) = cgroup_procs {
                    if libc::write(fd, b"0".as_ptr().cast(), 1) != 1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                for (resource, value) in [
                    (libc::RLIMIT_AS, address_space),
                    (libc::RLIMIT_FSIZE, fsize as libc::rlim_t),
                    (libc::RLIMIT_CORE, 0),
                ] {
                    let limit = libc::rlimit {
                        rlim_cur: value,
                        rlim_max: value,
                    };
                    if libc::setrlimit(resource, &limit) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if drop_privileges {
                    if libc::unshare(libc::CLONE_NEWNET) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    let limit = libc::rlimit {
                        rlim_cur: nproc as libc::rlim_t,
                        rlim_max: nproc as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_NPROC, &limit) != 0
                        || libc::setgroups(0, std::ptr::null()) != 0
                        || libc::setgid(gid) != 0
                        || libc::setuid(uid) != 0
                    {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        cmd
    }
}

impl IsolatedRunner for LocalRunner {
    fn name(&self) -> &'static str {
        "local"
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<ExecutionResult> {
        let cgroup = match &self.cgroups {
            Some(parent) => Some(
                parent
                    .create(request.memory_limit_mb * 1024 * 1024)
                    .context("Failed to set up memory cgroup")?,
            ),
            None => None,
        };

        let start_time = Instant::now();
        let mut child = self
            .command(request, cgroup.as_ref())
            .spawn()
            .context("Failed to spawn /bin/sh")?;
        let pid = child.id() as libc::pid_t;

        let stdout_pipe = drain_pipe(child.stdout.take(), self.output_limit);
        let stderr_pipe = drain_pipe(child.stderr.take(), self.output_limit);

        let deadline = start_time + request.timeout;
        let mut killed = false;
        let reaped = loop {
            if let Some(reaped) = wait(pid, false)? {
                break reaped;
            }
            if Instant::now() >= deadline {
                kill_group(pid);
                killed = true;
                match wait(pid, true)? {
                    Some(reaped) => break reaped,
                    None => bail!("Process {pid} vanished after SIGKILL"),
                }
            }
            thread::sleep(POLL_INTERVAL);
        };
        let elapsed = start_time.elapsed();
        // Background processes would keep the pipes open forever
        kill_group(pid);

        let (stdout, stderr) = collect_output(request, self.output_limit, stdout_pipe, stderr_pipe);

        let mut result = ExecutionResult {
            stdout,
            stderr,
            exit_code: reaped.exit_code,
            elapsed_ms: elapsed.as_millis() as u64,
            memory_kb: cgroup
                .as_ref()
                .and_then(MemoryCgroup::peak_kb)
                .unwrap_or(reaped.peak_rss_kb),
            ..Default::default()
        };

        let limit_kb = request.memory_limit_mb * 1024;
        let oom_killed = match &cgroup {
            Some(group) => group.oom_kills()? > 0,
            None => false,
        };
        // Address-space limits make allocations fail slightly before the
        // resident set reaches the ceiling, and huge ones fail with almost
        // nothing resident
        let allocation_failed = reaped.exit_code != 0
            && (reports_allocation_failure(&result.stderr)
                || (cgroup.is_none() && reaped.peak_rss_kb * 10 >= limit_kb * 9));

        if killed || elapsed > request.timeout {
            result.timed_out = true;
        } else if oom_killed || allocation_failed {
            result.memory_exceeded = true;
            result.memory_kb = result.memory_kb.max(limit_kb);
        }

        Ok(result)
    }
}

fn reports_allocation_failure(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ALLOCATION_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Reaps `pid` with `wait4`, returning `None` if it is still running and
/// `blocking` is false.
fn wait(pid: libc::pid_t, blocking: bool) -> Result<Option<Reaped>> {
    let mut status: libc::c_int = 0;
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    let flags = if blocking { 0 } else { libc::WNOHANG };

    let ret = loop {
        let ret = unsafe { libc::wait4(pid, &mut status, flags, rusage.as_mut_ptr()) };
        if ret == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        break ret;
    };
    match ret {
        -1 => Err(io::Error::last_os_error()).context("wait4 failed"),
        0 => Ok(None),
        _ => {
            let rusage = unsafe { rusage.assume_init() };
            let exit_code = if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else if libc::WIFSIGNALED(status) {
                128 + libc::WTERMSIG(status)
            } else {
                -1
            };
            Ok(Some(Reaped {
                exit_code,
                peak_rss_kb: rusage.ru_maxrss.max(0) as u64,
            }))
        }
    }
}

fn kill_group(pgid: libc::pid_t) {
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

const CONTROLLERS: &str = "cgroup.controllers";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";
const PROCS: &str = "cgroup.procs";
const REMOVE_ATTEMPTS: u32 = 10;

/// A cgroup v2 directory the judge owns, holding one child group per run.
#[derive(Debug)]
pub struct CgroupParent {
    path: PathBuf,
}

impl CgroupParent {
    /// Creates `path` inside a cgroup v2 hierarchy and enables the memory
    /// controller for its children.
    ///
    /// Nothing is created when the parent directory is not a cgroup v2 group.
    pub fn prepare(path: &Path) -> Result<Self> {
        if !path.exists() {
            let parent = path
                .parent()
                .with_context(|| format!("{} has no parent", path.display()))?;
            if !parent.join(CONTROLLERS).exists() {
                bail!("{} is not a cgroup v2 group", parent.display());
            }
            fs::create_dir(path)
                .with_context(|| format!("Failed to create cgroup {}", path.display()))?;
        }

        let controllers = fs::read_to_string(path.join(CONTROLLERS))
            .with_context(|| format!("{} is not a cgroup v2 group", path.display()))?;
        if !controllers.split_whitespace().any(|c| c == "memory") {
            bail!("Memory controller is not available in {}", path.display());
        }
        fs::write(path.join(SUBTREE_CONTROL), "+memory").with_context(|| {
            format!("Failed to enable the memory controller below {}", path.display())
        })?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Creates a fresh child group capped at `limit_bytes` with no swap.
    pub fn create(&self, limit_bytes: u64) -> Result<MemoryCgroup> {
        let path = self.path.join(Uuid::new_v4().to_string());
        fs::create_dir(&path)
            .with_context(|| format!("Failed to create cgroup {}", path.display()))?;
        // Removes the directory again if any step below fails
        let mut group = MemoryCgroup { path, procs: None };

        fs::write(group.path.join("memory.max"), limit_bytes.to_string())
            .context("Failed to set memory.max")?;
        for (file, value) in [("memory.swap.max", "0"), ("memory.oom.group", "1")] {
            let control = group.path.join(file);
            if control.exists() {
                fs::write(&control, value).with_context(|| format!("Failed to set {file}"))?;
            }
        }
        let procs = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(group.path.join(PROCS))
            .context("Failed to open cgroup.procs")?;
        group.procs = Some(procs);

        Ok(group)
    }
}

/// One run's memory cgroup, removed when dropped.
#[derive(Debug)]
pub struct MemoryCgroup {
    path: PathBuf,
    procs: Option<File>,
}

impl MemoryCgroup {
    /// Descriptor of `cgroup.procs`. Writing `0` to it moves the writer into
    /// the group, which is how a child joins between fork and exec.
    pub fn procs_fd(&self) -> Option<RawFd> {
        self.procs.as_ref().map(|f| f.as_raw_fd())
    }

    /// Number of processes the kernel OOM killer killed in this group.
    pub fn oom_kills(&self) -> Result<u64> {
        let events = self.path.join("memory.events");
        match fs::read_to_string(&events) {
            Ok(content) => Ok(parse_oom_kills(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", events.display())),
        }
    }

    /// Peak memory charged to the group, `memory.current` on kernels without
    /// `memory.peak`.
    pub fn peak_kb(&self) -> Option<u64> {
        ["memory.peak", "memory.current"].iter().find_map(|file| {
            fs::read_to_string(self.path.join(file))
                .ok()?
                .trim()
                .parse::<u64>()
                .ok()
                .map(|bytes| bytes / 1024)
        })
    }
}

impl Drop for MemoryCgroup {
    fn drop(&mut self) {
        self.procs.take();
        let kill = self.path.join("cgroup.kill");
        if kill.exists() {
            if let Err(e) = fs::write(&kill, "1") {
                log::warn!("Failed to kill leftovers in {}: {e}", self.path.display());
            }
        }
        // Killed processes leave the group asynchronously
        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!("Failed to remove cgroup {}: {e}", self.path.display());
                    return;
                }
                Ok(()) => return,
            }
        }
        log::error!("Cgroup {} still busy, leaving it behind", self.path.display());
    }
}

/// Reads the `oom_kill` counter out of a `memory.events` file.
fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("judger-cgroup-{}", Uuid::new_v4()));
            fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn reads_oom_kill_counter() {
        let events = "low 0\nhigh 0\nmax 12\noom 3\noom_kill 2\noom_group_kill 0\n";
        assert_eq!(parse_oom_kills(events), 2);
        assert_eq!(parse_oom_kills("low 0\noom 1\n"), 0);
        assert_eq!(parse_oom_kills(""), 0);
    }

    #[test]
    fn refuses_directories_outside_cgroup_v2() {
        let root = TempDir::new();
        let path = root.0.join("judger");
        assert!(CgroupParent::prepare(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn requires_the_memory_controller() {
        let root = TempDir::new();
        fs::write(root.0.join(CONTROLLERS), "cpu io pids\n").unwrap();
        let err = CgroupParent::prepare(&root.0).unwrap_err();
        assert!(err.to_string().contains("Memory controller"));
    }

    #[test]
    fn child_groups_carry_the_limit() {
        let root = TempDir::new();
        fs::write(root.0.join(CONTROLLERS), "cpu memory pids\n").unwrap();
        let parent = CgroupParent::prepare(&root.0).unwrap();
        assert_eq!(
            fs::read_to_string(root.0.join(SUBTREE_CONTROL)).unwrap(),
            "+memory"
        );

        let group = parent.create(64 * 1024 * 1024).unwrap();
        assert!(group.path.starts_with(&parent.path));
        assert_eq!(
            fs::read_to_string(group.path.join("memory.max")).unwrap(),
            "67108864"
        );
        assert!(group.procs_fd().is_some());
        assert_eq!(group.oom_kills().unwrap(), 0);

        fs::write(group.path.join("memory.events"), "oom 1\noom_kill 1\n").unwrap();
        fs::write(group.path.join("memory.peak"), "1048576\n").unwrap();
        assert_eq!(group.oom_kills().unwrap(), 1);
        assert_eq!(group.peak_kb(), Some(1024));
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::{JudgeError, Result};
use crate::normalize::CompareMode;

const SANDBOX_DIR_NAME: &str = "sandboxes";

#[derive(Parser)]
#[command(name = "judger", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Number of submissions judged concurrently
    #[arg(long = "threads", short = 't', default_value_t = 2)]
    pub threads: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Judge one source file against a problem and print the judgment
    Judge {
        /// Directory holding `<problem>.json` files
        #[arg(long)]
        problems: PathBuf,
        /// Problem identifier
        #[arg(long)]
        problem: String,
        /// Language identifier, e.g. `python`, `c_cpp`, `java`
        #[arg(long, short = 'l')]
        language: String,
        /// Path to the source file
        source: PathBuf,
    },
    /// Judge every submission in a JSON file, one JSON line per judgment
    Batch {
        /// Directory holding `<problem>.json` files
        #[arg(long)]
        problems: PathBuf,
        /// JSON array of submissions
        submissions: PathBuf,
    },
    /// List the configured languages
    Languages,
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults when
    /// no file was given
    pub fn to_config(&self) -> Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default());
        };
        let file = std::fs::File::open(path).map_err(|source| JudgeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|source| JudgeError::Json {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub sandbox_root: Option<PathBuf>,
    pub backend: Backend,
    pub docker: DockerConfig,
    pub local: LocalConfig,
    pub compile: CompileConfig,
    pub compare: CompareMode,
    pub languages: Vec<LanguageConfig>,
}

impl Config {
    /// Configured sandbox root, or a `sandboxes` directory in the user's
    /// cache directory
    pub fn sandbox_root(&self) -> PathBuf {
        use directories::ProjectDirs;

        if let Some(root) = &self.sandbox_root {
            return root.clone();
        }
        match ProjectDirs::from("", "", "judger") {
            Some(dirs) => dirs.cache_dir().join(SANDBOX_DIR_NAME),
            None => std::env::temp_dir().join("judger").join(SANDBOX_DIR_NAME),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Docker,
    Local,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DockerConfig {
    pub binary: String,
    /// Unprivileged user the images define
    pub user: String,
    pub pids_limit: u32,
    /// Extra wall time granted on top of the limit for container start-up
    pub startup_grace_ms: u64,
    pub output_limit_kb: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            user: "appuser".to_string(),
            pids_limit: 64,
            startup_grace_ms: 2000,
            output_limit_kb: 65536,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LocalConfig {
    /// Detach the network and switch identity when the judge runs as root
    pub drop_privileges: bool,
    /// Start as root with `drop_privileges` off. Programs then run as root
    /// on the host network.
    pub allow_root_without_isolation: bool,
    /// Identity the program runs as after dropping privileges
    pub uid: u32,
    pub gid: u32,
    pub nproc: u64,
    pub output_limit_kb: u64,
    /// cgroup v2 directory for per-run memory groups. Without a usable one
    /// memory is capped with `RLIMIT_AS` instead.
    pub cgroup_root: Option<PathBuf>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            drop_privileges: true,
            allow_root_without_isolation: false,
            uid: 65534,
            gid: 65534,
            nproc: 64,
            output_limit_kb: 65536,
            cgroup_root: Some(PathBuf::from("/sys/fs/cgroup/judger")),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct CompileConfig {
    pub time_floor_ms: u64,
    pub memory_floor_mb: u64,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            time_floor_ms: 5000,
            memory_floor_mb: 512,
        }
    }
}

/// A language entry from the configuration file.
///
/// `compile` may use `%INPUT%` and `%OUTPUT%`, `run` may use `%PROGRAM%` and
/// `%MEMORY_MB%`.
#[derive(Deserialize, Debug, Clone)]
pub struct LanguageConfig {
    pub name: String,
    pub source_file: String,
    pub artifact: Option<String>,
    pub image: String,
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

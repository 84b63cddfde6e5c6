mod cgroup;
mod docker_runner;
mod local_runner;
mod runner;
mod workspace;

pub use docker_runner::DockerRunner;
pub use local_runner::LocalRunner;
pub use runner::{ExecutionResult, IsolatedRunner, RunRequest};
pub use workspace::Workspace;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{Backend, Config};

// Fixed file names inside every workspace
pub const INPUT_FILE: &str = "input.txt";
pub const OUTPUT_FILE: &str = "output.txt";
pub const ERROR_FILE: &str = "error.txt";
pub const COMPILE_OUTPUT_FILE: &str = "compile_output.txt";
pub const COMPILE_ERROR_FILE: &str = "compile_error.txt";

/// Creates the isolation backend selected by the configuration
///
/// The docker backend gives full isolation and is the default. The local
/// backend only applies a memory cgroup or rlimits (plus a network namespace
/// and identity switch when running as root) and is meant for development.
pub fn create_runner(config: &Config) -> Result<Arc<dyn IsolatedRunner>> {
    match config.backend {
        Backend::Docker => {
            log::info!("Creating DockerRunner (full isolation mode)");
            let runner = DockerRunner::build(&config.docker)?;
            Ok(Arc::new(runner))
        }
        Backend::Local => {
            log::info!("Creating LocalRunner (host process mode)");
            let runner = LocalRunner::build(&config.local)?;
            Ok(Arc::new(runner))
        }
    }
}

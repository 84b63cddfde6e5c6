use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use super::{ERROR_FILE, INPUT_FILE, OUTPUT_FILE};

// The sandboxed identity differs from the judge's, it must be able to create
// output files in the workspace.
const WORKSPACE_DIR_PERMISSIONS: u32 = 0o777;

/// A disposable directory holding one submission's source, input and output
/// files.
///
/// The directory is removed when the workspace is dropped, so every exit path
/// of a judgment cleans up. Removal failures are logged and swallowed.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    dir: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Creates a uniquely named directory under `root`.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create sandbox root {}", root.display()))?;

        let id = Uuid::new_v4();
        let dir = root.join(id.to_string());
        // `create_dir` rather than `create_dir_all`: an existing directory is a
        // collision, not something to reuse
        fs::create_dir(&dir)
            .with_context(|| format!("Failed to create workspace {}", dir.display()))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(WORKSPACE_DIR_PERMISSIONS))
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;

        log::debug!("Workspace {id} created at {}", dir.display());
        Ok(Self {
            id,
            dir,
            removed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Writes the submitted source. A trailing newline is appended, some
    /// compilers warn without one.
    pub fn write_source_file(&self, filename: &str, content: &str) -> Result<()> {
        let path = self.file_path(filename)?;
        fs::write(&path, format!("{content}\n"))
            .with_context(|| format!("Failed to write source file {}", path.display()))
    }

    /// Replaces the fixed input file. Empty input still produces an (empty)
    /// file since the run command redirects stdin from it.
    pub fn write_input_file(&self, content: &str) -> Result<()> {
        let path = self.dir.join(INPUT_FILE);
        fs::write(&path, content)
            .with_context(|| format!("Failed to write input file {}", path.display()))
    }

    /// Removes output files left by the previous command.
    pub fn clear_outputs(&self, files: &[&str]) -> Result<()> {
        for file in files {
            let path = self.file_path(file)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }

    /// Clears the run outputs of the previous test case.
    pub fn clear_run_outputs(&self) -> Result<()> {
        self.clear_outputs(&[OUTPUT_FILE, ERROR_FILE])
    }

    /// Removes the directory now instead of at drop time.
    pub fn destroy(mut self) {
        self.remove();
    }

    fn file_path(&self, filename: &str) -> Result<PathBuf> {
        let name = Path::new(filename);
        if name.components().count() != 1 || name.file_name().is_none() {
            bail!("Refusing workspace file name {filename:?}");
        }
        Ok(self.dir.join(name))
    }

    fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => log::debug!("Workspace {} removed", self.id),
            Err(e) => log::error!(
                "Failed to remove workspace {} at {}: {e}",
                self.id,
                self.dir.display()
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}

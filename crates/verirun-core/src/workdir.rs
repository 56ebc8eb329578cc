//! Working directory lifecycle
//!
//! The pipeline runs inside a directory owned by exactly one run. It is
//! either preserved (`<prefix>/verirun_files`, kept for inspection) or an
//! anonymous temporary directory that is removed on teardown.

use std::fmt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::SupervisorError;

/// Name of the preserved working directory
pub const PRESERVED_DIR_NAME: &str = "verirun_files";

/// Prefix of anonymous working directories
pub const TEMP_DIR_PREFIX: &str = "verirun-";

/// A teardown step that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub action: &'static str,
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} {}: {}", self.action, self.path.display(), self.message)
    }
}

enum Storage {
    Preserved(PathBuf),
    Temporary(TempDir),
}

/// Directory the pipeline runs in
pub struct WorkingDirectory {
    storage: Option<Storage>,
    previous_cwd: Option<PathBuf>,
}

impl WorkingDirectory {
    /// Create the directory under `prefix` and make it the current directory
    pub fn create(prefix: &Path, preserve: bool) -> Result<Self, SupervisorError> {
        let previous_cwd = std::env::current_dir().ok();

        let storage = if preserve {
            let path = prefix.join(PRESERVED_DIR_NAME);
            if path.exists() {
                debug!("removing stale {}", path.display());
                std::fs::remove_dir_all(&path).map_err(|source| {
                    SupervisorError::WorkingDirectory {
                        path: path.clone(),
                        source,
                    }
                })?;
            }
            std::fs::create_dir_all(&path).map_err(|source| SupervisorError::WorkingDirectory {
                path: path.clone(),
                source,
            })?;
            Storage::Preserved(path)
        } else {
            let dir = tempfile::Builder::new()
                .prefix(TEMP_DIR_PREFIX)
                .tempdir_in(prefix)
                .map_err(|source| SupervisorError::WorkingDirectory {
                    path: prefix.to_path_buf(),
                    source,
                })?;
            Storage::Temporary(dir)
        };

        let workdir = Self {
            storage: Some(storage),
            previous_cwd,
        };
        std::env::set_current_dir(workdir.path()).map_err(|source| {
            SupervisorError::WorkingDirectory {
                path: workdir.path().to_path_buf(),
                source,
            }
        })?;
        debug!("working directory {}", workdir.path().display());
        Ok(workdir)
    }

    pub fn path(&self) -> &Path {
        match &self.storage {
            Some(Storage::Preserved(path)) => path,
            Some(Storage::Temporary(dir)) => dir.path(),
            None => Path::new(""),
        }
    }

    pub fn is_preserved(&self) -> bool {
        matches!(self.storage, Some(Storage::Preserved(_)))
    }

    /// Restore the previous current directory and remove the directory
    /// unless it is preserved. Problems are returned, never raised.
    pub fn teardown(mut self) -> Vec<CleanupWarning> {
        self.release()
    }

    fn release(&mut self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();

        if let Some(previous) = self.previous_cwd.take() {
            if let Err(e) = std::env::set_current_dir(&previous) {
                warnings.push(CleanupWarning {
                    action: "restore current directory",
                    path: previous,
                    message: e.to_string(),
                });
            }
        }

        match self.storage.take() {
            Some(Storage::Preserved(path)) => {
                debug!("keeping {}", path.display());
            }
            Some(Storage::Temporary(dir)) => {
                let path = dir.path().to_path_buf();
                if let Err(e) = dir.close() {
                    warnings.push(CleanupWarning {
                        action: "remove",
                        path,
                        message: e.to_string(),
                    });
                }
            }
            None => {}
        }

        warnings
    }
}

impl Drop for WorkingDirectory {
    fn drop(&mut self) {
        for warning in self.release() {
            warn!("{}", warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn temporary_directory_is_removed() {
        let prefix = tempfile::tempdir().unwrap();
        let before = std::env::current_dir().unwrap();

        let workdir = WorkingDirectory::create(prefix.path(), false).unwrap();
        let path = workdir.path().to_path_buf();
        assert!(path.is_dir());
        assert!(!workdir.is_preserved());
        assert_eq!(
            std::env::current_dir().unwrap().canonicalize().unwrap(),
            path.canonicalize().unwrap()
        );

        assert!(workdir.teardown().is_empty());
        assert!(!path.exists());
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    #[serial]
    fn preserved_directory_is_kept_and_replaced() {
        let prefix = tempfile::tempdir().unwrap();
        let stale = prefix.path().join(PRESERVED_DIR_NAME).join("old.bc");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "").unwrap();

        let workdir = WorkingDirectory::create(prefix.path(), true).unwrap();
        assert!(workdir.is_preserved());
        assert!(!stale.exists());
        std::fs::write(workdir.path().join("code.bc"), "").unwrap();

        assert!(workdir.teardown().is_empty());
        assert!(prefix.path().join(PRESERVED_DIR_NAME).join("code.bc").exists());
    }

    #[test]
    #[serial]
    fn drop_cleans_up_too() {
        let prefix = tempfile::tempdir().unwrap();
        let before = std::env::current_dir().unwrap();
        let path = {
            let workdir = WorkingDirectory::create(prefix.path(), false).unwrap();
            workdir.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    #[serial]
    fn missing_prefix_is_an_error() {
        let prefix = tempfile::tempdir().unwrap();
        let missing = prefix.path().join("does/not/exist");
        assert!(matches!(
            WorkingDirectory::create(&missing, false),
            Err(SupervisorError::WorkingDirectory { .. })
        ));
    }

    #[test]
    fn warning_display() {
        let warning = CleanupWarning {
            action: "remove",
            path: PathBuf::from("/tmp/verirun-x"),
            message: "busy".to_string(),
        };
        assert_eq!(warning.to_string(), "cannot remove /tmp/verirun-x: busy");
    }
}

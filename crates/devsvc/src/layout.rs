//! On-disk state layout for a service

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Creates the per-service directory tree under the state root
pub struct StateDirectoryManager;

impl StateDirectoryManager {
    /// Create `state_root` and every `required_dirs` entry beneath it
    ///
    /// Idempotent: existing directories and their contents are left alone.
    /// Nothing is ever deleted or truncated.
    pub fn ensure_layout<I, S>(state_root: &Path, required_dirs: I) -> Result<(), FilesystemError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        ensure_dir(state_root)?;
        for dir in required_dirs {
            let path = state_root.join(dir);
            ensure_dir(&path)?;
            log::debug!("Ensured directory {}", path.display());
        }
        Ok(())
    }
}

/// Create `path` and its parents, rejecting anything in the way that is not a directory
fn ensure_dir(path: &Path) -> Result<(), FilesystemError> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        match std::fs::metadata(&current) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {
                return Err(FilesystemError::NotADirectory { path: current });
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(FilesystemError::Io { path: current, source: e }),
        }

        match std::fs::create_dir(&current) {
            Ok(()) => {}
            // Lost a race with another creator; fine as long as it is a directory
            Err(e) if e.kind() == ErrorKind::AlreadyExists && current.is_dir() => {}
            Err(e) => return Err(FilesystemError::Io { path: current, source: e }),
        }
    }
    Ok(())
}

/// Errors that can occur while preparing the state layout
#[derive(Debug, thiserror::Error)]
pub enum FilesystemError {
    #[error("'{}' exists and is not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("Failed to create '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FilesystemError {
    pub fn path(&self) -> &Path {
        match self {
            FilesystemError::NotADirectory { path } | FilesystemError::Io { path, .. } => path,
        }
    }
}

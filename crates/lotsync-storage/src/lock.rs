//! Single-instance guard per run kind, backed by an advisory file lock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another {name} run is in progress (lock held on {})", path.display())]
    Held { name: String, path: PathBuf },
    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for the lifetime of one run; the lock is released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    name: String,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: impl AsRef<Path>, name: &str) -> Result<Self, LockError> {
        let dir = dir.as_ref();
        let path = dir.join(format!("{name}.lock"));
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::Held {
                name: name.to_string(),
                path: path.clone(),
            });
        }

        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        debug!(lock = name, path = %path.display(), "run lock acquired");
        Ok(Self {
            file,
            name: name.to_string(),
            path,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        match self.file.unlock() {
            Ok(()) => debug!(lock = %self.name, "run lock released"),
            Err(err) => warn!(lock = %self.name, error = %err, "failed to release run lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempdir().expect("tempdir");
        let first = RunLock::acquire(dir.path(), "ingest").expect("first lock");
        let pid = std::fs::read_to_string(first.path()).expect("read pid");
        assert_eq!(pid.trim(), std::process::id().to_string());

        let err = RunLock::acquire(dir.path(), "ingest").unwrap_err();
        assert!(matches!(err, LockError::Held { ref name, .. } if name == "ingest"));

        drop(first);
        RunLock::acquire(dir.path(), "ingest").expect("lock after release");
    }

    #[test]
    fn run_kinds_lock_independently() {
        let dir = tempdir().expect("tempdir");
        let _ingest = RunLock::acquire(dir.path(), "ingest").expect("ingest");
        let normalize = RunLock::acquire(dir.path(), "normalize").expect("normalize");
        assert_eq!(normalize.name(), "normalize");
    }
}

//! Single-instance guard based on a PID lock file.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process,
};

use sysinfo::{Pid, System};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Holds the lock file for as long as it lives; dropping it removes the file.
#[derive(Debug)]
pub struct ProcessGuard {
    path: PathBuf,
    pid: u32,
}

impl ProcessGuard {
    /// Takes the lock at `path`.
    ///
    /// Returns `Ok(None)` when the file names another live process; nothing
    /// is touched in that case. A file naming a dead process, this process,
    /// or holding garbage is stale: it is removed and replaced with our pid.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Option<Self>, GuardError> {
        let path = path.into();
        let pid = process::id();
        let io_err = |source: io::Error| GuardError::Io {
            path: path.clone(),
            source,
        };

        match fs::read_to_string(&path) {
            Ok(content) => {
                match content.trim().parse::<u32>() {
                    Ok(other) if other != pid && is_alive(other) => {
                        info!("Another instance is running (pid {}), not starting", other);
                        return Ok(None);
                    }
                    Ok(other) => warn!("Removing stale lock file {} (pid {})", path.display(), other),
                    Err(_) => warn!("Removing unreadable lock file {}", path.display()),
                }
                fs::remove_file(&path).map_err(io_err)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        fs::write(&path, format!("{}\n", pid)).map_err(io_err)?;
        debug!("Wrote pid {} to {}", pid, path.display());

        Ok(Some(Self { path, pid }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        // Leave the file alone if another instance has taken it over.
        let ours = fs::read_to_string(&self.path)
            .map(|content| content.trim() == self.pid.to_string())
            .unwrap_or(false);
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to remove lock file {}: {}", self.path.display(), e);
            }
        }
    }
}

fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

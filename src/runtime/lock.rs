//! Per-role single-instance guard.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exclusive `flock` on `<dir>/<name>.lock`, held until dropped.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    // Closing the file releases the lock
    _file: File,
}

impl InstanceLock {
    pub fn acquire(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock dir {}", dir.display()))?;
        let path = dir.join(format!("{}.lock", name.replace([':', '/'], "_")));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        Self::try_lock(&file)
            .with_context(|| format!("Another {} worker holds {}", name, path.display()))?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { path, _file: file })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            bail!("lock busy: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> Result<()> {
        tracing::warn!("⚠️ [LOCK] flock unavailable on this platform, single-instance guard disabled");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

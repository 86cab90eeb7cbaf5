use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

/// Exclusive flock held for the daemon's lifetime so a second instance can
/// never race the socket or the registry file.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl InstanceLock {
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.exists()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create lock dir {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lockfile {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                bail!("another daemon holds lock: {}", path.display())
            }
            Err(e) => Err(e).with_context(|| format!("flock {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("backer.lock");
        let g1 = InstanceLock::try_acquire(&path).expect("first acquire ok");
        drop(g1);
        let _g2 = InstanceLock::try_acquire(&path).expect("re-acquire ok after drop");
    }

    #[test]
    fn conflict_same_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("backer.lock");
        let _g1 = InstanceLock::try_acquire(&path).expect("first acquire ok");
        let err = InstanceLock::try_acquire(&path).unwrap_err().to_string();
        assert!(err.contains("another daemon holds lock"), "err was: {err}");
    }

    #[test]
    fn creates_missing_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/backer.lock");
        let _g = InstanceLock::try_acquire(&path).expect("acquire with missing dirs");
        assert!(path.exists());
    }
}

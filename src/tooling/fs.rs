use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};

use crate::utils::process::{CmdSpec, Runner};

pub const REQ_BINS: &[&str] = &["truncate", "mkfs.ext4", "mount", "umount", "mountpoint", "mkdir", "rm"];

type DynRunner = dyn Runner + Send + Sync;

/// Loopback image provisioning and mount state.
pub trait FsPort: Send + Sync {
    fn create_image(&self, path: &Path, size: &str) -> Result<()>;
    fn format(&self, path: &Path) -> Result<()>;
    fn mount(&self, image: &Path, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
    fn is_mounted(&self, path: &Path) -> Result<bool>;
    fn ensure_dir(&self, dir: &Path) -> Result<()>;
    fn remove_tree(&self, path: &Path) -> Result<()>;
}

pub struct FsCli {
    runner: Arc<DynRunner>,
}

impl FsCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl FsPort for FsCli {
    fn create_image(&self, path: &Path, size: &str) -> Result<()> {
        let cmd = CmdSpec::new("truncate")
            .arg("-s")
            .arg(size)
            .arg(path.display().to_string());
        self.runner
            .run(&cmd)
            .with_context(|| format!("truncate -s {size} {}", path.display()))
    }

    fn format(&self, path: &Path) -> Result<()> {
        let cmd = CmdSpec::new("mkfs.ext4").arg(path.display().to_string());
        self.runner
            .run(&cmd)
            .with_context(|| format!("mkfs.ext4 {}", path.display()))
    }

    fn mount(&self, image: &Path, target: &Path) -> Result<()> {
        let cmd = CmdSpec::new("mount")
            .arg(image.display().to_string())
            .arg(target.display().to_string());
        self.runner
            .run(&cmd)
            .with_context(|| format!("mount {} {}", image.display(), target.display()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let cmd = CmdSpec::new("umount").arg(target.display().to_string());
        self.runner
            .run(&cmd)
            .with_context(|| format!("umount {}", target.display()))
    }

    fn is_mounted(&self, path: &Path) -> Result<bool> {
        // mountpoint -q exits non-zero for "not a mountpoint"
        let cmd = CmdSpec::new("mountpoint")
            .arg("-q")
            .arg(path.display().to_string());
        let code = self
            .runner
            .run_status(&cmd)
            .with_context(|| format!("mountpoint -q {}", path.display()))?;
        Ok(code == 0)
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        let cmd = CmdSpec::new("mkdir").arg("-p").arg(dir.display().to_string());
        self.runner
            .run(&cmd)
            .with_context(|| format!("mkdir -p {}", dir.display()))
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        let cmd = CmdSpec::new("rm")
            .arg("-rf")
            .arg(path.display().to_string());
        self.runner
            .run(&cmd)
            .with_context(|| format!("rm -rf {}", path.display()))
    }
}

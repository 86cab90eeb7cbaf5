use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use tracing as log;

use crate::utils::process::{CmdSpec, Runner};

pub const REQ_BINS: &[&str] = &["sync", "rsync", "fsfreeze"];

/// rsync's "some files vanished before they could be transferred"
const RSYNC_VANISHED: i32 = 24;

type DynRunner = dyn Runner + Send + Sync;

/// Mirroring a live data directory into the local snapshot mirror.
pub trait SyncPort: Send + Sync {
    /// Best-effort incremental pass while the volume stays writable.
    /// Vanished-file races are expected and ignored.
    fn pre_sync(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Second pass under `fsfreeze`, producing a crash-consistent mirror.
    /// The filesystem is unfrozen on every exit path.
    fn frozen_sync(&self, src: &Path, dst: &Path) -> Result<()>;
}

pub struct RsyncCli {
    runner: Arc<DynRunner>,
}

impl RsyncCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }

    fn rsync(&self, src: &Path, dst: &Path) -> CmdSpec {
        CmdSpec::new("rsync")
            .arg("-aAX")
            .arg("--delete")
            .arg(src.display().to_string())
            .arg(dst.display().to_string())
    }
}

impl SyncPort for RsyncCli {
    fn pre_sync(&self, src: &Path, dst: &Path) -> Result<()> {
        self.runner
            .run(&CmdSpec::new("sync"))
            .context("flush page cache")?;

        let cmd = self.rsync(src, dst);
        let code = self
            .runner
            .run_status(&cmd)
            .with_context(|| format!("pre-sync {} -> {}", src.display(), dst.display()))?;
        match code {
            0 => Ok(()),
            RSYNC_VANISHED => {
                log::debug!("pre-sync of {} saw vanished files", src.display());
                Ok(())
            }
            other => bail!(
                "pre-sync {} -> {} failed with rsync exit code {other}",
                src.display(),
                dst.display()
            ),
        }
    }

    fn frozen_sync(&self, src: &Path, dst: &Path) -> Result<()> {
        self.runner
            .run(
                &CmdSpec::new("fsfreeze")
                    .arg("-f")
                    .arg(src.display().to_string()),
            )
            .with_context(|| format!("fsfreeze -f {}", src.display()))?;
        let mut guard = FreezeGuard {
            runner: self.runner.clone(),
            path: src.to_path_buf(),
            armed: true,
        };

        let synced = self
            .runner
            .run(&self.rsync(src, dst))
            .with_context(|| format!("frozen sync {} -> {}", src.display(), dst.display()));

        let thawed = guard.release();
        synced.and(thawed)
    }
}

/// Pairs every freeze with an unfreeze, even through panics.
struct FreezeGuard {
    runner: Arc<DynRunner>,
    path: PathBuf,
    armed: bool,
}

impl FreezeGuard {
    fn release(&mut self) -> Result<()> {
        self.armed = false;
        self.runner
            .run(
                &CmdSpec::new("fsfreeze")
                    .arg("-u")
                    .arg(self.path.display().to_string()),
            )
            .with_context(|| format!("fsfreeze -u {}", self.path.display()))
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::tooling::test_support::ScriptedRunner;

    #[test]
    fn pre_sync_tolerates_vanished_files() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_status(RSYNC_VANISHED);
        let sync = RsyncCli::new(runner.clone());
        sync.pre_sync(Path::new("/v/db/_data"), Path::new("/s/db"))
            .unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0], "sync");
        assert_eq!(calls[1], "rsync -aAX --delete /v/db/_data /s/db");
    }

    #[test]
    fn pre_sync_fails_on_other_codes() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_status(23);
        let sync = RsyncCli::new(runner);
        let err = sync
            .pre_sync(Path::new("/v/db/_data"), Path::new("/s/db"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 23"), "err was: {err}");
    }

    #[test]
    fn frozen_sync_unfreezes_on_success() {
        let runner = Arc::new(ScriptedRunner::new());
        let sync = RsyncCli::new(runner.clone());
        sync.frozen_sync(Path::new("/v/db/_data"), Path::new("/s/db"))
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "fsfreeze -f /v/db/_data",
                "rsync -aAX --delete /v/db/_data /s/db",
                "fsfreeze -u /v/db/_data",
            ]
        );
    }

    #[test]
    fn frozen_sync_unfreezes_on_rsync_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_program("rsync", "disk exploded");
        let sync = RsyncCli::new(runner.clone());
        let res = sync.frozen_sync(Path::new("/v/db/_data"), Path::new("/s/db"));
        assert!(res.is_err());
        let calls = runner.calls();
        assert_eq!(calls.last().map(String::as_str), Some("fsfreeze -u /v/db/_data"));
    }
}

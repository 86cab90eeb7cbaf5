use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;

use crate::utils::{bins::ensure_bins, process::Runner};

pub mod fs;
pub mod restic;
pub mod rsync;

#[cfg(test)]
pub mod test_support;

pub use fs::{FsCli, FsPort};
pub use restic::{PRODUCT_TAG, ResticCli, ResticPort, Snapshot};
pub use rsync::{RsyncCli, SyncPort};

/// All external collaborators the engine drives.
pub struct Toolbox {
    fs: Arc<dyn FsPort>,
    sync: Arc<dyn SyncPort>,
    restic: Arc<dyn ResticPort>,
}

impl Toolbox {
    pub fn new(runner: Arc<dyn Runner + Send + Sync>) -> Result<Self> {
        ensure_required_bins()?;
        Ok(Self {
            fs: Arc::new(FsCli::new(runner.clone())),
            sync: Arc::new(RsyncCli::new(runner.clone())),
            restic: Arc::new(ResticCli::new(runner)),
        })
    }

    /// Assemble from explicit ports; used by tests with fakes.
    pub fn from_ports(
        fs: Arc<dyn FsPort>,
        sync: Arc<dyn SyncPort>,
        restic: Arc<dyn ResticPort>,
    ) -> Self {
        Self { fs, sync, restic }
    }

    #[inline]
    pub fn fs(&self) -> &dyn FsPort {
        self.fs.as_ref()
    }

    #[inline]
    pub fn sync(&self) -> &dyn SyncPort {
        self.sync.as_ref()
    }

    #[inline]
    pub fn restic(&self) -> &dyn ResticPort {
        self.restic.as_ref()
    }
}

fn ensure_required_bins() -> Result<()> {
    let mut all: BTreeSet<&'static str> = BTreeSet::new();
    for b in fs::REQ_BINS {
        all.insert(b);
    }
    for b in rsync::REQ_BINS {
        all.insert(b);
    }
    for b in restic::REQ_BINS {
        all.insert(b);
    }
    ensure_bins(all)
}

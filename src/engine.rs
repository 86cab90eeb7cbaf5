use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Result, bail};
use tracing as log;

use crate::{
    config::Config,
    registry::Registry,
    schedule::{Job, Scheduler, cron::CronExpr},
    tooling::Toolbox,
    utils::{keyed::KeyedLocks, time::current_epoch},
    volume::{Volume, keep_args},
};

/// Read-only view handed to `VolumeDriver.Get`/`List`.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: PathBuf,
    pub mounted: bool,
}

/// Volume lifecycle and backup orchestration.
///
/// Every entry point takes the volume's key in the exclusion manager before
/// touching shared state, so protocol calls and scheduled triggers on the
/// same volume serialize in arrival order while different volumes proceed
/// independently. Registry writes additionally serialize on a key derived
/// from the registry file path.
pub struct Engine {
    cfg: Config,
    locks: KeyedLocks,
    scheduler: Scheduler,
    registry: Mutex<Registry>,
    tools: Toolbox,
    registry_key: String,
}

impl Engine {
    pub fn new(cfg: Config, tools: Toolbox) -> Arc<Self> {
        let registry_file = cfg.paths.registry_file();
        let registry = Registry::load(&registry_file);
        Arc::new(Self {
            cfg,
            locks: KeyedLocks::new(),
            scheduler: Scheduler::new(),
            registry: Mutex::new(registry),
            tools,
            registry_key: registry_file.display().to_string(),
        })
    }

    /// Prepare directories and re-arm triggers for every persisted volume.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.tools.fs().ensure_dir(&self.cfg.paths.state_dir)?;
        let volumes: Vec<Volume> = self.with_registry(|r| r.volumes().cloned().collect());
        for v in &volumes {
            self.schedule_volume(v);
        }
        log::info!("loaded {} volume(s)", volumes.len());
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    // --- lifecycle ------------------------------------------------------

    pub fn create(self: &Arc<Self>, name: &str, opts: &BTreeMap<String, String>) -> Result<()> {
        let _g = self.locks.lock(name);
        if self.with_registry(|r| r.contains(name)) {
            bail!("Volume {name} already exists");
        }

        let volume = Volume::from_opts(name, opts, &self.cfg.defaults)?;
        let image = volume.image(&self.cfg.paths.state_dir);
        let mountpoint = volume.mountpoint(&self.cfg.paths.volumes_root);
        let data = volume.data(&self.cfg.paths.volumes_root);

        // Bootstrap the directory structure without leaving the volume
        // mounted. A failure here leaves no registry entry, so a retried
        // create never sees a duplicate name.
        let fs = self.tools.fs();
        fs.create_image(&image, &volume.size)?;
        fs.format(&image)?;
        fs.ensure_dir(&mountpoint)?;
        fs.mount(&image, &mountpoint)?;
        fs.ensure_dir(&data)?;
        fs.unmount(&mountpoint)?;

        self.with_registry(|r| r.insert(volume.clone()));
        self.schedule_volume(&volume);
        self.save()?;
        log::info!("created volume {name} ({})", volume.size);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let _g = self.locks.lock(name);
        let volume = self.volume_snapshot(name)?;
        let mountpoint = volume.mountpoint(&self.cfg.paths.volumes_root);

        let fs = self.tools.fs();
        if fs.is_mounted(&mountpoint)? {
            fs.unmount(&mountpoint)?;
        }
        fs.remove_tree(&mountpoint)?;
        fs.remove_tree(&volume.mirror(&self.cfg.paths.state_dir))?;
        fs.remove_tree(&volume.image(&self.cfg.paths.state_dir))?;

        // remote snapshot history is intentionally kept
        self.scheduler.unschedule(name);
        self.with_registry(|r| {
            r.remove(name);
        });
        self.save()?;
        log::info!("removed volume {name}");
        Ok(())
    }

    pub fn mount(&self, name: &str, id: &str) -> Result<PathBuf> {
        let _g = self.locks.lock(name);
        let volume = self.volume_snapshot(name)?;
        let mountpoint = volume.mountpoint(&self.cfg.paths.volumes_root);

        let fs = self.tools.fs();
        if !fs.is_mounted(&mountpoint)? {
            fs.ensure_dir(&mountpoint)?;
            fs.mount(&volume.image(&self.cfg.paths.state_dir), &mountpoint)?;
            if volume.restore {
                self.restore_locked(&volume)?;
            }
        }

        self.with_registry(|r| {
            if let Some(v) = r.get_mut(name) {
                v.mounts.insert(id.to_string());
            }
        });
        Ok(volume.data(&self.cfg.paths.volumes_root))
    }

    pub fn unmount(&self, name: &str, id: &str) -> Result<()> {
        let _g = self.locks.lock(name);
        let now_empty = self
            .with_registry(|r| {
                r.get_mut(name).map(|v| {
                    v.mounts.remove(id);
                    v.mounts.is_empty()
                })
            })
            .ok_or_else(|| anyhow::anyhow!("Volume {name} doesn't exist"))?;

        if now_empty {
            let volume = self.volume_snapshot(name)?;
            let mountpoint = volume.mountpoint(&self.cfg.paths.volumes_root);
            let fs = self.tools.fs();
            if fs.is_mounted(&mountpoint)? {
                fs.unmount(&mountpoint)?;
            }
        }
        Ok(())
    }

    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let _g = self.locks.lock(name);
        let volume = self.volume_snapshot(name)?;
        Ok(volume.data(&self.cfg.paths.volumes_root))
    }

    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        let _g = self.locks.lock(name);
        let volume = self.volume_snapshot(name)?;
        let mounted = self
            .tools
            .fs()
            .is_mounted(&volume.mountpoint(&self.cfg.paths.volumes_root))?;
        Ok(VolumeInfo {
            name: volume.name.clone(),
            mountpoint: volume.data(&self.cfg.paths.volumes_root),
            mounted,
        })
    }

    /// Point-in-time-consistent enumeration: holds every volume's key at
    /// once (sorted, same global order as single-key users).
    pub fn list(&self) -> Vec<(String, PathBuf)> {
        let names = self.with_registry(|r| r.names());
        let _guards = self.locks.lock_all(&names);
        self.with_registry(|r| {
            names
                .iter()
                .filter_map(|n| r.get(n))
                .map(|v| (v.name.clone(), v.data(&self.cfg.paths.volumes_root)))
                .collect()
        })
    }

    // --- workflows ------------------------------------------------------

    /// Scheduled-trigger entry: errors are logged, never surfaced, and the
    /// cycle is retried only on the next trigger.
    pub fn run_backup(&self, name: &str) {
        if let Err(e) = self.backup(name) {
            log::error!("error while backing up volume {name}: {e:#}");
        }
    }

    pub fn run_forget(&self, name: &str) {
        if let Err(e) = self.forget(name) {
            log::error!("error while forgetting snapshots of volume {name}: {e:#}");
        }
    }

    pub fn backup(&self, name: &str) -> Result<()> {
        let _g = self.locks.lock(name);
        let Some(volume) = self.with_registry(|r| r.get(name).cloned()) else {
            // removed between trigger fire and lock acquisition
            return Ok(());
        };

        let mountpoint = volume.mountpoint(&self.cfg.paths.volumes_root);
        if volume.mounts.is_empty() || !self.tools.fs().is_mounted(&mountpoint)? {
            log::debug!("volume {name} not in use, skipping backup");
            return Ok(());
        }

        // The watermark is recorded and persisted before the capture, so a
        // later restore never re-applies a snapshot this cycle produced.
        // Trade-off, kept from the original design: a failed backup also
        // advances the watermark.
        let timestamp = current_epoch();
        self.with_registry(|r| {
            if let Some(v) = r.get_mut(name) {
                v.timestamp = timestamp;
            }
        });
        self.save()?;

        log::info!("backing up volume {name}...");
        let data = volume.data(&self.cfg.paths.volumes_root);
        let mirror = volume.mirror(&self.cfg.paths.state_dir);

        self.tools.sync().pre_sync(&data, &mirror)?;
        log::info!("pre-sync of volume {name} finished");

        self.tools.sync().frozen_sync(&data, &mirror)?;
        log::info!("consistent sync of volume {name} finished");

        self.tools
            .restic()
            .backup(&mirror, name, timestamp, &volume.env)?;
        log::info!("backup of volume {name} uploaded");
        Ok(())
    }

    pub fn forget(&self, name: &str) -> Result<()> {
        let _g = self.locks.lock(name);
        let Some(volume) = self.with_registry(|r| r.get(name).cloned()) else {
            return Ok(());
        };

        log::info!("forgetting snapshots of volume {name}...");
        let keeps = keep_args(&volume.forget_policy)?;
        self.tools.restic().forget(name, &keeps, &volume.env)?;
        log::info!("finished forgetting snapshots of {name}");
        Ok(())
    }

    /// Restore attempt during mount. The caller already holds the key.
    fn restore_locked(&self, volume: &Volume) -> Result<()> {
        let name = &volume.name;
        log::info!("restoring volume {name}...");

        let Some(snap) = self.tools.restic().latest_snapshot(name, &volume.env)? else {
            log::info!("no snapshot found for {name}");
            return Ok(());
        };
        if snap.timestamp <= volume.timestamp {
            log::info!("no snapshot newer than local state of {name}, skipping restore");
            return Ok(());
        }

        log::info!("found snapshot {} of {name}", snap.short_id);
        let mountpoint = volume.mountpoint(&self.cfg.paths.volumes_root);
        self.tools
            .restic()
            .restore(&snap.id, &mountpoint, &volume.env)?;

        self.with_registry(|r| {
            if let Some(v) = r.get_mut(name) {
                v.timestamp = snap.timestamp;
            }
        });
        self.save()?;
        log::info!("finished restoring snapshot {}", snap.short_id);
        Ok(())
    }

    // --- scheduling -----------------------------------------------------

    fn schedule_volume(self: &Arc<Self>, volume: &Volume) {
        let mut triggers: Vec<(&'static str, CronExpr, Job)> = Vec::new();

        match CronExpr::parse(&volume.backup_schedule) {
            Ok(expr) => {
                let weak = Arc::downgrade(self);
                let name = volume.name.clone();
                triggers.push((
                    "backup",
                    expr,
                    Box::new(move || {
                        if let Some(engine) = weak.upgrade() {
                            engine.run_backup(&name);
                        }
                    }),
                ));
            }
            Err(e) => log::error!(
                "volume {}: bad backup schedule '{}': {e:#}",
                volume.name,
                volume.backup_schedule
            ),
        }

        match CronExpr::parse(&volume.forget_schedule) {
            Ok(expr) => {
                let weak = Arc::downgrade(self);
                let name = volume.name.clone();
                triggers.push((
                    "forget",
                    expr,
                    Box::new(move || {
                        if let Some(engine) = weak.upgrade() {
                            engine.run_forget(&name);
                        }
                    }),
                ));
            }
            Err(e) => log::error!(
                "volume {}: bad forget schedule '{}': {e:#}",
                volume.name,
                volume.forget_schedule
            ),
        }

        self.scheduler.schedule(&volume.name, triggers);
    }

    // --- shared state helpers -------------------------------------------

    fn volume_snapshot(&self, name: &str) -> Result<Volume> {
        self.with_registry(|r| r.get(name).cloned())
            .ok_or_else(|| anyhow::anyhow!("Volume {name} doesn't exist"))
    }

    fn with_registry<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut guard: MutexGuard<'_, Registry> = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn save(&self) -> Result<()> {
        let _g = self.locks.lock(&self.registry_key);
        self.with_registry(|r| r.save())
    }
}

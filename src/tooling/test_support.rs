use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Result, bail};

use crate::{
    tooling::{FsPort, ResticPort, Snapshot, SyncPort},
    utils::process::{CmdSpec, Runner},
};

/// Records every command and replays scripted outcomes. One-shot failures
/// let tests model "first call fails, retry succeeds" flows.
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    statuses: Mutex<VecDeque<i32>>,
    captures: Mutex<VecDeque<Result<String, String>>>,
    fails: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            statuses: Mutex::new(VecDeque::new()),
            captures: Mutex::new(VecDeque::new()),
            fails: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Queue an exit code for the next `run_status` call (default 0).
    pub fn push_status(&self, code: i32) {
        self.statuses.lock().unwrap().push_back(code);
    }

    /// Queue stdout for the next `run_capture` call (default empty).
    pub fn push_capture(&self, stdout: &str) {
        self.captures.lock().unwrap().push_back(Ok(stdout.to_string()));
    }

    pub fn push_capture_err(&self, stderr: &str) {
        self.captures.lock().unwrap().push_back(Err(stderr.to_string()));
    }

    /// Fail the next `run` of `program` once, with `stderr` in the message.
    pub fn fail_program(&self, program: &str, stderr: &str) {
        self.fails
            .lock()
            .unwrap()
            .push((program.to_string(), stderr.to_string()));
    }

    fn record(&self, spec: &CmdSpec) {
        self.calls.lock().unwrap().push(spec.render());
    }

    fn take_failure(&self, spec: &CmdSpec) -> Option<String> {
        let mut fails = self.fails.lock().unwrap();
        let idx = fails.iter().position(|(p, _)| p == spec.program())?;
        Some(fails.remove(idx).1)
    }
}

impl Runner for ScriptedRunner {
    fn run(&self, spec: &CmdSpec) -> Result<()> {
        self.record(spec);
        if let Some(stderr) = self.take_failure(spec) {
            bail!("command failed: {} (exit status: 1): {stderr}", spec.render());
        }
        Ok(())
    }

    fn run_capture(&self, spec: &CmdSpec) -> Result<String> {
        self.record(spec);
        if let Some(stderr) = self.take_failure(spec) {
            bail!("command failed: {} (exit status: 1): {stderr}", spec.render());
        }
        match self.captures.lock().unwrap().pop_front() {
            Some(Ok(out)) => Ok(out),
            Some(Err(stderr)) => {
                bail!("command failed: {} (exit status: 1): {stderr}", spec.render())
            }
            None => Ok(String::new()),
        }
    }

    fn run_status(&self, spec: &CmdSpec) -> Result<i32> {
        self.record(spec);
        Ok(self.statuses.lock().unwrap().pop_front().unwrap_or(0))
    }
}

/// In-memory filesystem port tracking mount state and every call made.
#[derive(Default)]
pub struct FakeFs {
    pub mounted: Mutex<BTreeSet<PathBuf>>,
    log: Mutex<Vec<String>>,
}

impl FakeFs {
    fn log_entry(&self, s: String) {
        self.log.lock().unwrap().push(s);
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

impl FsPort for FakeFs {
    fn create_image(&self, path: &Path, size: &str) -> Result<()> {
        self.log_entry(format!("image {} {size}", path.display()));
        Ok(())
    }
    fn format(&self, path: &Path) -> Result<()> {
        self.log_entry(format!("format {}", path.display()));
        Ok(())
    }
    fn mount(&self, image: &Path, target: &Path) -> Result<()> {
        self.log_entry(format!("mount {} {}", image.display(), target.display()));
        self.mounted.lock().unwrap().insert(target.to_path_buf());
        Ok(())
    }
    fn unmount(&self, target: &Path) -> Result<()> {
        self.log_entry(format!("umount {}", target.display()));
        self.mounted.lock().unwrap().remove(target);
        Ok(())
    }
    fn is_mounted(&self, path: &Path) -> Result<bool> {
        Ok(self.mounted.lock().unwrap().contains(path))
    }
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        self.log_entry(format!("mkdir {}", dir.display()));
        Ok(())
    }
    fn remove_tree(&self, path: &Path) -> Result<()> {
        self.log_entry(format!("rm {}", path.display()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSync {
    pub log: Mutex<Vec<String>>,
}

impl SyncPort for FakeSync {
    fn pre_sync(&self, src: &Path, dst: &Path) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("pre {} {}", src.display(), dst.display()));
        Ok(())
    }
    fn frozen_sync(&self, src: &Path, dst: &Path) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("frozen {} {}", src.display(), dst.display()));
        Ok(())
    }
}

/// Scriptable snapshot repository.
#[derive(Default)]
pub struct FakeRestic {
    pub latest: Mutex<Option<Snapshot>>,
    pub backups: Mutex<Vec<(PathBuf, String, u64)>>,
    pub restores: Mutex<Vec<String>>,
    pub forgets: Mutex<Vec<(String, Vec<String>)>>,
    pub fail_backup: AtomicBool,
}

impl ResticPort for FakeRestic {
    fn init(&self, _env: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }
    fn backup(
        &self,
        dir: &Path,
        name: &str,
        timestamp: u64,
        _env: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.fail_backup.load(Ordering::SeqCst) {
            bail!("repository unreachable");
        }
        self.backups
            .lock()
            .unwrap()
            .push((dir.to_path_buf(), name.to_string(), timestamp));
        Ok(())
    }
    fn latest_snapshot(
        &self,
        _name: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<Option<Snapshot>> {
        Ok(self.latest.lock().unwrap().clone())
    }
    fn restore(
        &self,
        id: &str,
        _mountpoint: &Path,
        _env: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.restores.lock().unwrap().push(id.to_string());
        Ok(())
    }
    fn forget(
        &self,
        name: &str,
        keep_args: &[String],
        _env: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.forgets
            .lock()
            .unwrap()
            .push((name.to_string(), keep_args.to_vec()));
        Ok(())
    }
}

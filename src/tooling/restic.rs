use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing as log;

use crate::utils::{
    process::{CmdSpec, EnvValue, Runner},
    time::{fmt_restic_time, parse_rfc3339_to_unix},
};

pub const REQ_BINS: &[&str] = &["restic"];

/// Tag every snapshot so unrelated backups in the same repository are
/// never selected or pruned by this plugin.
pub const PRODUCT_TAG: &str = "backer";

/// restic prints this when the repository backend was never initialized.
const UNINIT_MARKER: &str = "unable to open config";

type DynRunner = dyn Runner + Send + Sync;
type Env = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub short_id: String,
    pub timestamp: u64,
}

/// The external snapshot repository.
pub trait ResticPort: Send + Sync {
    fn init(&self, env: &Env) -> Result<()>;

    /// Capture `dir`, tagged with the volume name, stamped `timestamp`.
    /// Lazily initializes the backend and retries exactly once.
    fn backup(&self, dir: &Path, name: &str, timestamp: u64, env: &Env) -> Result<()>;

    /// Most recent snapshot tagged for `name`; `None` when the backend is
    /// uninitialized or holds no matching snapshot.
    fn latest_snapshot(&self, name: &str, env: &Env) -> Result<Option<Snapshot>>;

    /// Clear `<mountpoint>/_data` and restore the snapshot into it.
    fn restore(&self, id: &str, mountpoint: &Path, env: &Env) -> Result<()>;

    /// Prune snapshots for `name` outside the keep window. Uninitialized
    /// backend means nothing to prune.
    fn forget(&self, name: &str, keep_args: &[String], env: &Env) -> Result<()>;
}

pub struct ResticCli {
    runner: Arc<DynRunner>,
}

impl ResticCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }

    fn restic(&self, env: &Env) -> CmdSpec {
        let mut cmd = CmdSpec::new("restic");
        for (k, v) in env {
            cmd = cmd.env(k.clone(), EnvValue::Secret(v.clone()));
        }
        cmd
    }

    fn backup_cmd(&self, dir: &Path, name: &str, timestamp: u64, env: &Env) -> Result<CmdSpec> {
        let when = fmt_restic_time(timestamp)?;
        Ok(self
            .restic(env)
            .args(["backup", ".", "--time"])
            .arg(when)
            .args(["--tag", PRODUCT_TAG, "--tag"])
            .arg(name)
            .cwd(dir))
    }
}

fn is_uninitialized(err: &anyhow::Error) -> bool {
    format!("{err:#}").contains(UNINIT_MARKER)
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    id: String,
    short_id: String,
    time: String,
}

impl ResticPort for ResticCli {
    fn init(&self, env: &Env) -> Result<()> {
        self.runner
            .run(&self.restic(env).arg("init"))
            .context("restic init")
    }

    fn backup(&self, dir: &Path, name: &str, timestamp: u64, env: &Env) -> Result<()> {
        let cmd = self.backup_cmd(dir, name, timestamp, env)?;
        match self.runner.run(&cmd) {
            Ok(()) => Ok(()),
            Err(e) if is_uninitialized(&e) => {
                log::info!("repository for {name} not initialized yet, running restic init");
                self.init(env)?;
                self.runner
                    .run(&cmd)
                    .with_context(|| format!("restic backup of {name} after init"))
            }
            Err(e) => Err(e).with_context(|| format!("restic backup of {name}")),
        }
    }

    fn latest_snapshot(&self, name: &str, env: &Env) -> Result<Option<Snapshot>> {
        let cmd = self
            .restic(env)
            .args(["snapshots", "--json", "--last", "--tag"])
            .arg(format!("{PRODUCT_TAG},{name}"));

        let out = match self.runner.run_capture(&cmd) {
            Ok(out) => out,
            Err(e) if is_uninitialized(&e) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("restic snapshots for {name}")),
        };

        // restic prints "null" for an empty result set
        let raw: Option<Vec<RawSnapshot>> =
            serde_json::from_str(out.trim()).context("parse restic snapshots json")?;
        let mut snaps: Vec<Snapshot> = raw
            .unwrap_or_default()
            .into_iter()
            .map(|s| {
                let timestamp = parse_rfc3339_to_unix(&s.time)
                    .with_context(|| format!("snapshot {} time", s.short_id))?;
                Ok(Snapshot {
                    id: s.id,
                    short_id: s.short_id,
                    timestamp,
                })
            })
            .collect::<Result<_>>()?;

        snaps.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(snaps.into_iter().next())
    }

    fn restore(&self, id: &str, mountpoint: &Path, env: &Env) -> Result<()> {
        let data = mountpoint.join("_data");
        self.runner
            .run(&CmdSpec::new("rm").arg("-rf").arg(data.display().to_string()))
            .with_context(|| format!("clear {}", data.display()))?;

        let cmd = self
            .restic(env)
            .args(["restore"])
            .arg(id)
            .args(["--target", "."])
            .cwd(mountpoint);
        self.runner
            .run(&cmd)
            .with_context(|| format!("restic restore {id}"))
    }

    fn forget(&self, name: &str, keep_args: &[String], env: &Env) -> Result<()> {
        let cmd = self
            .restic(env)
            .arg("forget")
            .args(keep_args.iter().cloned())
            .arg("--tag")
            .arg(format!("{PRODUCT_TAG},{name}"))
            .args(["--prune", "--json"]);

        match self.runner.run(&cmd) {
            Ok(()) => Ok(()),
            Err(e) if is_uninitialized(&e) => {
                log::debug!("repository for {name} not initialized, nothing to forget");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("restic forget for {name}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tooling::test_support::ScriptedRunner;

    fn env() -> Env {
        let mut env = Env::new();
        env.insert("RESTIC_REPOSITORY".into(), "/srv/repo".into());
        env.insert("RESTIC_PASSWORD".into(), "pw".into());
        env
    }

    fn prefix() -> &'static str {
        "RESTIC_PASSWORD=<redacted> RESTIC_REPOSITORY=<redacted> restic"
    }

    #[test]
    fn backup_builds_tagged_stamped_command() {
        let runner = Arc::new(ScriptedRunner::new());
        let restic = ResticCli::new(runner.clone());
        restic
            .backup(Path::new("/s/db"), "db", 1_700_000_000, &env())
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![format!(
                "{} backup . --time '2023-11-14 22:13:20' --tag backer --tag db",
                prefix()
            )]
        );
    }

    #[test]
    fn backup_inits_and_retries_once_on_uninitialized_backend() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_program("restic", "Fatal: unable to open config file");
        let restic = ResticCli::new(runner.clone());
        restic
            .backup(Path::new("/s/db"), "db", 1_700_000_000, &env())
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].contains("backup ."));
        assert!(calls[1].ends_with("restic init"));
        assert!(calls[2].contains("backup ."));
    }

    #[test]
    fn backup_other_failures_do_not_retry() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_program("restic", "Fatal: wrong password");
        let restic = ResticCli::new(runner.clone());
        let err = restic
            .backup(Path::new("/s/db"), "db", 1_700_000_000, &env())
            .unwrap_err();
        assert!(format!("{err:#}").contains("wrong password"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn latest_snapshot_picks_newest() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_capture(
            r#"[
                {"id":"aaa","short_id":"aa","time":"2023-11-14T22:13:20Z"},
                {"id":"bbb","short_id":"bb","time":"2024-01-01T00:00:00Z"}
            ]"#,
        );
        let restic = ResticCli::new(runner.clone());
        let snap = restic.latest_snapshot("db", &env()).unwrap().unwrap();
        assert_eq!(snap.id, "bbb");
        assert_eq!(snap.timestamp, 1_704_067_200);
        assert!(
            runner.calls()[0]
                .ends_with("restic snapshots --json --last --tag backer,db")
        );
    }

    #[test]
    fn latest_snapshot_handles_null_and_uninitialized() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_capture("null");
        let restic = ResticCli::new(runner.clone());
        assert_eq!(restic.latest_snapshot("db", &env()).unwrap(), None);

        runner.push_capture_err("Fatal: unable to open config file");
        assert_eq!(restic.latest_snapshot("db", &env()).unwrap(), None);
    }

    #[test]
    fn restore_clears_data_then_restores_into_mountpoint() {
        let runner = Arc::new(ScriptedRunner::new());
        let restic = ResticCli::new(runner.clone());
        restic
            .restore("abc123", Path::new("/v/db"), &env())
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "rm -rf /v/db/_data".to_string(),
                format!("{} restore abc123 --target .", prefix()),
            ]
        );
    }

    #[test]
    fn forget_passes_keep_args_and_tolerates_uninitialized() {
        let runner = Arc::new(ScriptedRunner::new());
        let restic = ResticCli::new(runner.clone());
        let keeps = vec!["--keep-last=10".to_string(), "--keep-daily=7".to_string()];
        restic.forget("db", &keeps, &env()).unwrap();
        assert_eq!(
            runner.calls(),
            vec![format!(
                "{} forget --keep-last=10 --keep-daily=7 --tag backer,db --prune --json",
                prefix()
            )]
        );

        runner.fail_program("restic", "Fatal: unable to open config file");
        restic.forget("db", &keeps, &env()).unwrap();
    }
}

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{config::Defaults, schedule::cron::CronExpr};

/// One managed volume. Serialized field names must stay byte-compatible
/// with the `volumes.json` layout consumed by earlier deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub size: String,
    #[serde(rename = "backupSchedule")]
    pub backup_schedule: String,
    pub restore: bool,
    #[serde(rename = "forgetPolicy")]
    pub forget_policy: String,
    #[serde(rename = "forgetSchedule")]
    pub forget_schedule: String,
    /// Last backup watermark, epoch seconds. 0 = never backed up.
    #[serde(default)]
    pub timestamp: u64,
    /// Opaque restic credential/destination variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Active mount-session ids. Runtime-only: after a daemon restart the
    /// set starts empty and physical mount state is re-probed.
    #[serde(skip)]
    pub mounts: BTreeSet<String>,
}

impl Volume {
    /// Build a volume from `VolumeDriver.Create` opts, applying configured
    /// defaults and validating everything that would otherwise only blow up
    /// at schedule or forget time.
    pub fn from_opts(
        name: &str,
        opts: &BTreeMap<String, String>,
        defaults: &Defaults,
    ) -> Result<Self> {
        if !valid_name(name) {
            bail!("bad volume name '{name}': use [A-Za-z0-9._-], length 1..128");
        }

        let size = opt(opts, "size").unwrap_or_else(|| defaults.size.clone());
        let size_re = Regex::new(r"(?i)^[0-9]+[kmgtpe]?$").context("size pattern")?;
        if !size_re.is_match(&size) {
            bail!("bad size '{size}': expected bytes with optional K/M/G/T suffix");
        }

        let backup_schedule =
            opt(opts, "backup_schedule").unwrap_or_else(|| defaults.backup_schedule.clone());
        CronExpr::parse(&backup_schedule)
            .with_context(|| format!("bad backup_schedule '{backup_schedule}'"))?;

        let forget_schedule =
            opt(opts, "forget_schedule").unwrap_or_else(|| defaults.forget_schedule.clone());
        CronExpr::parse(&forget_schedule)
            .with_context(|| format!("bad forget_schedule '{forget_schedule}'"))?;

        let forget_policy =
            opt(opts, "forget_policy").unwrap_or_else(|| defaults.forget_policy.clone());
        keep_args(&forget_policy).with_context(|| format!("bad forget_policy '{forget_policy}'"))?;

        let restore_re = Regex::new(r"(?i)^[1y]$").context("restore flag pattern")?;
        let restore = opt(opts, "restore")
            .map(|v| restore_re.is_match(&v))
            .unwrap_or(false);

        let env = opts
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("env_")
                    .map(|suffix| (suffix.to_uppercase(), v.clone()))
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            size,
            backup_schedule,
            restore,
            forget_policy,
            forget_schedule,
            timestamp: 0,
            env,
            mounts: BTreeSet::new(),
        })
    }

    pub fn mountpoint(&self, volumes_root: &std::path::Path) -> PathBuf {
        volumes_root.join(&self.name)
    }

    pub fn data(&self, volumes_root: &std::path::Path) -> PathBuf {
        volumes_root.join(&self.name).join("_data")
    }

    /// Local incremental mirror that gets handed to restic.
    pub fn mirror(&self, state_dir: &std::path::Path) -> PathBuf {
        state_dir.join(&self.name)
    }

    pub fn image(&self, state_dir: &std::path::Path) -> PathBuf {
        state_dir.join(format!("{}.img", self.name))
    }
}

fn opt(opts: &BTreeMap<String, String>, key: &str) -> Option<String> {
    opts.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn valid_name(name: &str) -> bool {
    (1..=128).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
}

/// Translate the compact retention encoding (`l10 h24 d7 w52 m120 y100`)
/// into restic `--keep-*` arguments.
pub fn keep_args(policy: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for token in policy.split_whitespace() {
        // first char, not first byte: the letter may be arbitrary input
        let mut chars = token.chars();
        let Some(letter) = chars.next() else {
            continue;
        };
        let count = chars.as_str();
        if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
            bail!("bad retention token '{token}': expected <letter><count>");
        }
        let flag = match letter {
            'l' => "--keep-last",
            'h' => "--keep-hourly",
            'd' => "--keep-daily",
            'w' => "--keep-weekly",
            'm' => "--keep-monthly",
            'y' => "--keep-yearly",
            other => bail!("unknown retention granularity '{other}' in '{token}'"),
        };
        out.push(format!("{flag}={count}"));
    }
    if out.is_empty() {
        bail!("empty retention policy");
    }
    Ok(out)
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use config as cfg;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{schedule::cron::CronExpr, volume::keep_args};

/// Daemon configuration. Every value has a default matching the paths and
/// policies this plugin has always used, so running without a config file
/// is fully supported.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub paths: Paths,
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Serialize)]
pub struct Paths {
    /// Where volume mountpoints live (`<root>/<name>/_data` is handed out).
    pub volumes_root: PathBuf,
    /// Backing images, local snapshot mirrors and the registry file.
    pub state_dir: PathBuf,
    /// Unix socket the container runtime connects to.
    pub socket: PathBuf,
}

/// Per-volume settings applied when a create request omits them.
#[derive(Debug, Clone, Serialize)]
pub struct Defaults {
    pub size: String,
    pub backup_schedule: String,
    pub forget_policy: String,
    pub forget_schedule: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            volumes_root: PathBuf::from("/mnt/volumes"),
            state_dir: PathBuf::from("/mnt/shared/backer"),
            socket: PathBuf::from("/run/docker/plugins/backer.sock"),
        }
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            size: "1G".into(),
            backup_schedule: "0 1 * * *".into(),
            forget_policy: "l10 h24 d7 w52 m120 y100".into(),
            forget_schedule: "0 1 * * 7".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: Paths::default(),
            defaults: Defaults::default(),
        }
    }
}

impl Paths {
    pub fn registry_file(&self) -> PathBuf {
        self.state_dir.join("volumes.json")
    }

    pub fn lockfile(&self) -> PathBuf {
        self.state_dir.join("backer.lock")
    }
}

impl Config {
    /// Load from `path`; a missing file yields the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("no config at {}, using defaults", path.display());
            let out = Self::default();
            out.validate()?;
            return Ok(out);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        let base = Self::default();
        let raw_paths = raw.paths.unwrap_or_default();
        let raw_defaults = raw.defaults.unwrap_or_default();

        let out = Self {
            paths: Paths {
                volumes_root: trim_path(raw_paths.volumes_root)
                    .unwrap_or(base.paths.volumes_root),
                state_dir: trim_path(raw_paths.state_dir).unwrap_or(base.paths.state_dir),
                socket: trim_path(raw_paths.socket).unwrap_or(base.paths.socket),
            },
            defaults: Defaults {
                size: trim_opt(raw_defaults.size).unwrap_or(base.defaults.size),
                backup_schedule: trim_opt(raw_defaults.backup_schedule)
                    .unwrap_or(base.defaults.backup_schedule),
                forget_policy: trim_opt(raw_defaults.forget_policy)
                    .unwrap_or(base.defaults.forget_policy),
                forget_schedule: trim_opt(raw_defaults.forget_schedule)
                    .unwrap_or(base.defaults.forget_schedule),
            },
        };
        out.validate()?;
        Ok(out)
    }

    fn validate(&self) -> Result<()> {
        for (label, p) in [
            ("paths.volumes_root", &self.paths.volumes_root),
            ("paths.state_dir", &self.paths.state_dir),
            ("paths.socket", &self.paths.socket),
        ] {
            if p.as_os_str().is_empty() {
                bail!("{label} must not be empty");
            }
        }

        let size_re = Regex::new(r"(?i)^[0-9]+[kmgtpe]?$").context("size pattern")?;
        if !size_re.is_match(&self.defaults.size) {
            bail!("bad defaults.size '{}'", self.defaults.size);
        }
        CronExpr::parse(&self.defaults.backup_schedule).with_context(|| {
            format!("bad defaults.backup_schedule '{}'", self.defaults.backup_schedule)
        })?;
        CronExpr::parse(&self.defaults.forget_schedule).with_context(|| {
            format!("bad defaults.forget_schedule '{}'", self.defaults.forget_schedule)
        })?;
        keep_args(&self.defaults.forget_policy).with_context(|| {
            format!("bad defaults.forget_policy '{}'", self.defaults.forget_policy)
        })?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn trim_opt(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn trim_path(s: Option<String>) -> Option<PathBuf> {
    trim_opt(s).map(PathBuf::from)
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    paths: Option<RawPaths>,
    #[serde(default)]
    defaults: Option<RawDefaults>,
}

#[derive(Debug, Deserialize, Default)]
struct RawPaths {
    volumes_root: Option<String>,
    state_dir: Option<String>,
    socket: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawDefaults {
    size: Option<String>,
    backup_schedule: Option<String>,
    forget_policy: Option<String>,
    forget_schedule: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::load_or_default(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.paths.volumes_root, PathBuf::from("/mnt/volumes"));
        assert_eq!(cfg.paths.socket, PathBuf::from("/run/docker/plugins/backer.sock"));
        assert_eq!(cfg.defaults.size, "1G");
        assert_eq!(cfg.defaults.forget_policy, "l10 h24 d7 w52 m120 y100");
        assert_eq!(
            cfg.paths.registry_file(),
            PathBuf::from("/mnt/shared/backer/volumes.json")
        );
    }

    #[test]
    fn partial_file_overrides_some_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[paths]
state_dir = "/srv/backer"

[defaults]
backup_schedule = "30 2 * * *"
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.paths.state_dir, PathBuf::from("/srv/backer"));
        assert_eq!(cfg.paths.volumes_root, PathBuf::from("/mnt/volumes"));
        assert_eq!(cfg.defaults.backup_schedule, "30 2 * * *");
        assert_eq!(cfg.defaults.forget_schedule, "0 1 * * 7");
    }

    #[test]
    fn rejects_invalid_schedule_and_policy() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        fs::write(&path, "[defaults]\nbackup_schedule = \"often\"\n").unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(&path, "[defaults]\nforget_policy = \"z9\"\n").unwrap();
        assert!(Config::load(&path).is_err());

        fs::write(&path, "[defaults]\nsize = \"huge\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn print_config_is_valid_toml() {
        let printed = Config::default().to_toml().unwrap();
        assert!(printed.contains("[paths]"));
        assert!(printed.contains("volumes_root"));
        assert!(printed.contains("[defaults]"));
        assert!(printed.contains("backup_schedule"));
    }
}

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing as log;

use crate::volume::Volume;

/// The in-memory registry plus its durable `volumes.json` form.
///
/// Saves rewrite the whole file through a temp-file-and-rename, so a load
/// never observes a partial write. Callers serialize saves through the
/// exclusion manager keyed by the registry path.
pub struct Registry {
    path: PathBuf,
    volumes: BTreeMap<String, Volume>,
}

impl Registry {
    /// Load the registry, starting empty when the file is absent or
    /// unreadable (same recovery the plugin has always had).
    pub fn load(path: &Path) -> Self {
        let volumes = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<Volume>>(&bytes) {
                Ok(list) => list.into_iter().map(|v| (v.name.clone(), v)).collect(),
                Err(e) => {
                    log::warn!("unable to parse {}: {e}", path.display());
                    BTreeMap::new()
                }
            },
            Err(e) => {
                log::info!("unable to load volumes from {}: {e}", path.display());
                BTreeMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            volumes,
        }
    }

    pub fn save(&self) -> Result<()> {
        let list: Vec<&Volume> = self.volumes.values().collect();
        let json = serde_json::to_vec_pretty(&list).context("serialize registry")?;

        if let Some(dir) = self.path.parent()
            && !dir.exists()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("create state dir {}", dir.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.volumes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Volume> {
        self.volumes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Volume> {
        self.volumes.get_mut(name)
    }

    pub fn insert(&mut self, volume: Volume) {
        self.volumes.insert(volume.name.clone(), volume);
    }

    pub fn remove(&mut self, name: &str) -> Option<Volume> {
        self.volumes.remove(name)
    }

    /// Sorted: this doubles as the global lock-acquisition order.
    pub fn names(&self) -> Vec<String> {
        self.volumes.keys().cloned().collect()
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

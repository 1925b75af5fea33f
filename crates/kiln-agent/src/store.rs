use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use kiln_process::InstanceConfig;
use serde::{Deserialize, Serialize};

/// Source of instance configuration. The supervisor only reads and appends;
/// it never edits an existing entry.
pub trait InstanceStore: Send + Sync {
    /// All instances, in creation order.
    fn list(&self) -> anyhow::Result<Vec<InstanceConfig>>;
    fn get(&self, name: &str) -> anyhow::Result<Option<InstanceConfig>>;
    fn create(&self, config: InstanceConfig) -> anyhow::Result<()>;
    /// Returns false when there was nothing to delete.
    fn delete(&self, name: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    instances: Vec<InstanceConfig>,
}

/// `instances.json` under the data root, rewritten atomically on every change.
pub struct JsonInstanceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonInstanceStore {
    pub const FILE_NAME: &'static str = "instances.json";

    pub fn open(data_root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_root)
            .with_context(|| format!("create {}", data_root.display()))?;
        Ok(Self {
            path: data_root.join(Self::FILE_NAME),
            lock: Mutex::new(()),
        })
    }

    fn read(&self) -> anyhow::Result<StoreFile> {
        let raw = match std::fs::read(&self.path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        serde_json::from_slice(&raw).with_context(|| format!("parse {}", self.path.display()))
    }

    fn write(&self, file: &StoreFile) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(file).context("serialize instance store")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {}", self.path.display()))?;
        Ok(())
    }
}

impl InstanceStore for JsonInstanceStore {
    fn list(&self) -> anyhow::Result<Vec<InstanceConfig>> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.read()?.instances)
    }

    fn get(&self, name: &str) -> anyhow::Result<Option<InstanceConfig>> {
        Ok(self.list()?.into_iter().find(|c| c.name == name))
    }

    fn create(&self, config: InstanceConfig) -> anyhow::Result<()> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = self.read()?;
        if file.instances.iter().any(|c| c.name == config.name) {
            anyhow::bail!("instance {} already exists", config.name);
        }
        file.instances.push(config);
        self.write(&file)
    }

    fn delete(&self, name: &str) -> anyhow::Result<bool> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = self.read()?;
        let before = file.instances.len();
        file.instances.retain(|c| c.name != name);
        if file.instances.len() == before {
            return Ok(false);
        }
        self.write(&file)?;
        Ok(true)
    }
}

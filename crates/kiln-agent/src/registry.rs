use std::{
    collections::{btree_map::Entry, BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use kiln_process::{
    ActivityRecord, InstanceConfig, InstanceStats, InstanceStatus, PlayerInfo, SubscriberId,
};
use tokio::sync::Mutex;

use crate::{
    bans::{BanKind, BanRecord},
    error::{format_error_chain, SupervisorError},
    fanout::Subscription,
    port_alloc,
    process::ManagedProcess,
    settings::Settings,
    store::InstanceStore,
};

const MAX_NAME_LEN: usize = 64;
const MIN_RAM_MB: u32 = 256;

/// Parameters for a new instance. `port == 0` lets the allocator pick one;
/// `working_dir == None` places the instance under `<data_root>/instances/<name>`.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub ram_mb: u32,
    pub executable: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub port: u16,
}

/// All managed instances of this supervisor, keyed by name.
///
/// Constructed once by the binary and passed around explicitly; tests build
/// as many as they need.
pub struct SupervisorRegistry {
    store: Arc<dyn InstanceStore>,
    settings: Settings,
    data_root: PathBuf,
    instances: Mutex<BTreeMap<String, ManagedProcess>>,
    // Names (and their ports) of creates still in flight.
    pending: std::sync::Mutex<HashMap<String, u16>>,
}

fn validate_name(name: &str) -> Result<(), SupervisorError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(SupervisorError::InvalidConfig(format!(
            "name must be 1..={MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SupervisorError::InvalidConfig(format!(
            "name {name:?} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

fn absolute(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

impl SupervisorRegistry {
    pub fn new(store: Arc<dyn InstanceStore>, settings: Settings, data_root: PathBuf) -> Self {
        Self {
            store,
            settings,
            data_root,
            instances: Mutex::new(BTreeMap::new()),
            pending: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, u16>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Builds the registry from the store and re-attaches to any instance
    /// that is still running. A failure on one instance is logged and never
    /// stops the others from loading.
    pub async fn load(
        store: Arc<dyn InstanceStore>,
        settings: Settings,
        data_root: PathBuf,
    ) -> anyhow::Result<Self> {
        let configs = store.list()?;
        let reg = Self::new(store, settings, data_root);

        let mut recovered = 0usize;
        for cfg in configs {
            let name = cfg.name.clone();
            if !cfg.working_dir.is_dir() {
                tracing::warn!(instance = %name, dir = %cfg.working_dir.display(), "working directory is missing");
            }
            let p = ManagedProcess::new(cfg, reg.settings.clone());
            p.load_activity().await;
            if p.recover().await {
                recovered += 1;
            }
            reg.instances.lock().await.insert(name, p);
        }

        let total = reg.instances.lock().await.len();
        tracing::info!(instances = total, recovered, "supervisor registry loaded");
        Ok(reg)
    }

    pub async fn create(&self, req: NewInstance) -> Result<InstanceConfig, SupervisorError> {
        let name = req.name.trim().to_string();
        validate_name(&name)?;
        if req.ram_mb < MIN_RAM_MB {
            return Err(SupervisorError::InvalidConfig(format!(
                "ram_mb must be at least {MIN_RAM_MB}"
            )));
        }

        let working_dir = match &req.working_dir {
            Some(d) => absolute(&self.data_root, d),
            None => self.data_root.join("instances").join(&name),
        };
        let executable = absolute(&working_dir, &req.executable);

        // Reserve name and port, then do the slow part without the map locked.
        let port = {
            let instances = self.instances.lock().await;
            let mut pending = self.pending();
            if instances.contains_key(&name)
                || pending.contains_key(&name)
                || self.store.get(&name)?.is_some()
            {
                return Err(SupervisorError::AlreadyExists(name));
            }
            let taken: HashSet<u16> = instances
                .values()
                .map(|p| p.config().port)
                .chain(pending.values().copied())
                .collect();
            let port = port_alloc::allocate_tcp_port(req.port, &taken)?;
            pending.insert(name.clone(), port);
            port
        };

        let res = self.finish_create(name.clone(), req.ram_mb, executable, working_dir, port).await;
        self.pending().remove(&name);
        res
    }

    async fn finish_create(
        &self,
        name: String,
        ram_mb: u32,
        executable: PathBuf,
        working_dir: PathBuf,
        port: u16,
    ) -> Result<InstanceConfig, SupervisorError> {
        tokio::fs::create_dir_all(&working_dir).await?;

        let cfg = InstanceConfig {
            name: name.clone(),
            ram_mb,
            executable,
            working_dir,
            port,
        };
        self.store.create(cfg.clone())?;

        let p = ManagedProcess::new(cfg.clone(), self.settings.clone());
        p.load_activity().await;
        match self.instances.lock().await.entry(name.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(p);
            }
            Entry::Occupied(_) => return Err(SupervisorError::AlreadyExists(name)),
        }
        tracing::info!(instance = %name, port, dir = %cfg.working_dir.display(), "instance created");
        Ok(cfg)
    }

    /// Kills the instance if it is running, removes it from the store and
    /// unregisters it. A store failure leaves it registered. `purge` also
    /// deletes the working directory, but only when it lives under the data root.
    pub async fn delete(&self, name: &str, purge: bool) -> Result<(), SupervisorError> {
        let p = self.get(name).await?;

        if !p.status().await.is_offline() {
            p.kill().await?;
        }
        if let Err(err) = self.store.delete(name) {
            tracing::warn!(instance = %name, err = %format_error_chain(&err), "failed to remove instance from store");
            return Err(err.into());
        }
        self.instances.lock().await.remove(name);

        if purge {
            let dir = &p.config().working_dir;
            if dir.starts_with(&self.data_root) && dir != &self.data_root {
                if let Err(err) = tokio::fs::remove_dir_all(dir).await {
                    tracing::warn!(instance = %name, dir = %dir.display(), %err, "failed to purge working directory");
                }
            } else {
                tracing::warn!(instance = %name, dir = %dir.display(), "not purging a directory outside the data root");
            }
        }

        tracing::info!(instance = %name, purge, "instance deleted");
        Ok(())
    }

    pub async fn list(&self) -> Vec<InstanceConfig> {
        self.instances
            .lock()
            .await
            .values()
            .map(|p| p.config().clone())
            .collect()
    }

    pub async fn get(&self, name: &str) -> Result<ManagedProcess, SupervisorError> {
        self.instances
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownInstance(name.to_string()))
    }

    pub async fn statuses(&self) -> Vec<(String, InstanceStatus)> {
        let all: Vec<ManagedProcess> = self.instances.lock().await.values().cloned().collect();
        let mut out = Vec::with_capacity(all.len());
        for p in all {
            out.push((p.name().to_string(), p.status().await));
        }
        out
    }

    pub async fn status(&self, name: &str) -> Result<InstanceStatus, SupervisorError> {
        Ok(self.get(name).await?.status().await)
    }

    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.get(name).await?.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.get(name).await?.stop().await
    }

    pub async fn kill(&self, name: &str) -> Result<(), SupervisorError> {
        self.get(name).await?.kill().await
    }

    pub async fn write(&self, name: &str, command: &str) -> Result<(), SupervisorError> {
        self.get(name).await?.write(command).await
    }

    pub async fn subscribe(&self, name: &str) -> Result<Subscription, SupervisorError> {
        Ok(self.get(name).await?.subscribe())
    }

    pub async fn unsubscribe(&self, name: &str, id: &SubscriberId) -> Result<bool, SupervisorError> {
        Ok(self.get(name).await?.unsubscribe(id))
    }

    pub async fn online_players(&self, name: &str) -> Result<Vec<PlayerInfo>, SupervisorError> {
        Ok(self.get(name).await?.online_players())
    }

    pub async fn recent_activity(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, SupervisorError> {
        Ok(self.get(name).await?.recent_activity(limit))
    }

    pub async fn get_stats(&self, name: &str) -> Result<InstanceStats, SupervisorError> {
        Ok(self.get(name).await?.get_stats().await)
    }

    pub async fn get_bans(&self, name: &str, kind: BanKind) -> Result<Vec<BanRecord>, SupervisorError> {
        self.get(name).await?.get_bans(kind).await
    }

    pub async fn add_ban(
        &self,
        name: &str,
        kind: BanKind,
        subject: &str,
        reason: &str,
        expires: Option<&str>,
    ) -> Result<(), SupervisorError> {
        self.get(name).await?.add_ban(kind, subject, reason, expires).await
    }

    pub async fn update_ban(
        &self,
        name: &str,
        kind: BanKind,
        subject: &str,
        reason: &str,
        expires: Option<&str>,
    ) -> Result<bool, SupervisorError> {
        self.get(name).await?.update_ban(kind, subject, reason, expires).await
    }

    pub async fn remove_ban(
        &self,
        name: &str,
        kind: BanKind,
        subject: &str,
    ) -> Result<bool, SupervisorError> {
        self.get(name).await?.remove_ban(kind, subject).await
    }

    pub async fn kick(&self, name: &str, player: &str, reason: Option<&str>) -> Result<(), SupervisorError> {
        self.get(name).await?.kick(player, reason).await
    }

    pub async fn op(&self, name: &str, player: &str) -> Result<(), SupervisorError> {
        self.get(name).await?.op(player).await
    }

    pub async fn deop(&self, name: &str, player: &str) -> Result<(), SupervisorError> {
        self.get(name).await?.deop(player).await
    }
}

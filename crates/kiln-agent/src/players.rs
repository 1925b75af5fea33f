use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use kiln_process::PlayerInfo;

use crate::log_parser::LogEvent;

#[derive(Default)]
struct Inner {
    online: HashMap<String, PlayerInfo>,
    // Survives a leave: bans issued after the player left still want the uuid.
    uuids: HashMap<String, String>,
}

/// Players currently connected to one instance.
///
/// Only the tail loop mutates this (through [`PlayerRegistry::apply`]); every
/// other caller reads snapshots.
#[derive(Default)]
pub struct PlayerRegistry {
    inner: Mutex<Inner>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Applies one parsed event. Returns true when the online set changed.
    pub fn apply(&self, event: &LogEvent, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        match event {
            LogEvent::UuidLearned { name, uuid } => {
                inner.uuids.insert(name.clone(), uuid.clone());
                if let Some(p) = inner.online.get_mut(name) {
                    p.uuid = Some(uuid.clone());
                }
                false
            }
            LogEvent::Login { name, ip } => {
                let uuid = inner.uuids.get(name).cloned();
                match inner.online.get_mut(name) {
                    Some(p) => {
                        p.ip = Some(ip.clone());
                        if p.uuid.is_none() {
                            p.uuid = uuid;
                        }
                        false
                    }
                    None => {
                        inner.online.insert(
                            name.clone(),
                            PlayerInfo {
                                name: name.clone(),
                                ip: Some(ip.clone()),
                                uuid,
                                joined_at: now,
                            },
                        );
                        true
                    }
                }
            }
            LogEvent::Joined { name } => {
                if inner.online.contains_key(name) {
                    return false;
                }
                let uuid = inner.uuids.get(name).cloned();
                inner.online.insert(
                    name.clone(),
                    PlayerInfo {
                        name: name.clone(),
                        ip: None,
                        uuid,
                        joined_at: now,
                    },
                );
                true
            }
            LogEvent::Disconnected { name, .. }
            | LogEvent::Left { name }
            | LogEvent::Kicked { name, .. }
            | LogEvent::Banned { name, .. } => inner.online.remove(name).is_some(),
            LogEvent::BannedIp { .. } | LogEvent::Unbanned { .. } | LogEvent::UnbannedIp { .. } => {
                false
            }
        }
    }

    /// Snapshot ordered by join time, then name.
    pub fn online(&self) -> Vec<PlayerInfo> {
        let mut out: Vec<PlayerInfo> = self.lock().online.values().cloned().collect();
        out.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.name.cmp(&b.name)));
        out
    }

    pub fn count(&self) -> usize {
        self.lock().online.len()
    }

    pub fn get(&self, name: &str) -> Option<PlayerInfo> {
        self.lock().online.get(name).cloned()
    }

    pub fn uuid_of(&self, name: &str) -> Option<String> {
        self.lock().uuids.get(name).cloned()
    }

    /// Current online state does not outlive the process.
    pub fn clear_online(&self) {
        self.lock().online.clear();
    }

    /// Replaces the online set with `other`'s, used after re-attach inference.
    pub fn replace_with(&self, other: &PlayerRegistry) {
        let theirs = other.lock();
        let online = theirs.online.clone();
        let uuids = theirs.uuids.clone();
        drop(theirs);

        let mut inner = self.lock();
        inner.online = online;
        inner.uuids.extend(uuids);
    }
}

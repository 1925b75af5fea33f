use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Identifier handed to a live console subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached lifecycle state of a managed instance.
///
/// NOTE: This is a belief, not a fact. Readers must pass it through
/// [`effective_status`] together with an OS liveness check before trusting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Offline,
    Starting,
    Online,
    Stopping,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Offline => "OFFLINE",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Online => "ONLINE",
            InstanceStatus::Stopping => "STOPPING",
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, InstanceStatus::Offline)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciles the cached status with what the OS reports.
///
/// A dead process is always OFFLINE regardless of what was cached. A live
/// process keeps its cached state; an OFFLINE cache is not promoted here since
/// only start/re-attach know which run the process belongs to.
pub fn effective_status(cached: InstanceStatus, alive: bool) -> InstanceStatus {
    if alive {
        cached
    } else {
        InstanceStatus::Offline
    }
}

/// Static configuration of one managed instance, owned by the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub ram_mb: u32,
    /// Absolute path to the server jar or executable.
    pub executable: PathBuf,
    /// Absolute working directory; `logs/`, the PID file and ban lists live here.
    pub working_dir: PathBuf,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityKind {
    Join,
    Leave,
    Kick,
    Ban,
    Unban,
    BanIp,
    UnbanIp,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 7] = [
        ActivityKind::Join,
        ActivityKind::Leave,
        ActivityKind::Kick,
        ActivityKind::Ban,
        ActivityKind::Unban,
        ActivityKind::BanIp,
        ActivityKind::UnbanIp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Join => "join",
            ActivityKind::Leave => "leave",
            ActivityKind::Kick => "kick",
            ActivityKind::Ban => "ban",
            ActivityKind::Unban => "unban",
            ActivityKind::BanIp => "ban-ip",
            ActivityKind::UnbanIp => "unban-ip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the recent-activity feed.
///
/// `timestamp` is always normalized to `YYYY-MM-DDTHH:MM:SS` (local time).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ActivityRecord {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub subject: String,
    pub reason: Option<String>,
    pub timestamp: String,
}

impl ActivityRecord {
    /// Records with the same (type, subject, timestamp) describe the same event.
    pub fn same_event(&self, other: &ActivityRecord) -> bool {
        self.kind == other.kind && self.subject == other.subject && self.timestamp == other.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlayerInfo {
    pub name: String,
    pub ip: Option<String>,
    pub uuid: Option<String>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceStats {
    pub status: InstanceStatus,
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub players_online: usize,
}

impl InstanceStats {
    pub fn offline() -> Self {
        Self {
            status: InstanceStatus::Offline,
            cpu_percent: 0.0,
            memory_mb: 0,
            players_online: 0,
        }
    }
}

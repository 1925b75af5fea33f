use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};

pub const PLAYER_BANS_FILE: &str = "banned-players.json";
pub const IP_BANS_FILE: &str = "banned-ips.json";
const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";
pub const FOREVER: &str = "forever";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanKind {
    Player,
    Ip,
}

impl BanKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            BanKind::Player => PLAYER_BANS_FILE,
            BanKind::Ip => IP_BANS_FILE,
        }
    }

    pub fn path_in(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(self.file_name())
    }
}

fn default_source() -> String {
    "Server".to_string()
}

fn forever() -> String {
    FOREVER.to_string()
}

/// Blank or missing expiry means the ban never lapses.
fn expiry(expires: Option<&str>) -> String {
    expires
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map_or_else(forever, str::to_string)
}

/// One entry of a ban list, in the server's own JSON layout.
///
/// Player bans carry `name` (and `uuid` when known); IP bans carry `ip` and
/// optionally the `name` of the player the address was linked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub created: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "forever")]
    pub expires: String,
    #[serde(default)]
    pub reason: String,
}

impl BanRecord {
    pub fn player(name: &str, uuid: Option<String>, reason: &str, expires: Option<&str>) -> Self {
        Self {
            uuid,
            name: Some(name.to_string()),
            ip: None,
            created: Local::now().format(CREATED_FORMAT).to_string(),
            source: default_source(),
            expires: expiry(expires),
            reason: reason.to_string(),
        }
    }

    pub fn ip(
        ip: &str,
        linked_name: Option<String>,
        reason: &str,
        expires: Option<&str>,
    ) -> Self {
        Self {
            uuid: None,
            name: linked_name,
            ip: Some(ip.to_string()),
            created: Local::now().format(CREATED_FORMAT).to_string(),
            source: default_source(),
            expires: expiry(expires),
            reason: reason.to_string(),
        }
    }

    /// The banned name or address.
    pub fn subject(&self, kind: BanKind) -> Option<&str> {
        match kind {
            BanKind::Player => self.name.as_deref(),
            BanKind::Ip => self.ip.as_deref(),
        }
    }

    fn matches(&self, kind: BanKind, subject: &str) -> bool {
        // Player names are case-insensitive on the server side; addresses are not.
        match (kind, self.subject(kind)) {
            (BanKind::Player, Some(s)) => s.eq_ignore_ascii_case(subject),
            (BanKind::Ip, Some(s)) => s == subject,
            (_, None) => false,
        }
    }
}

pub async fn read_bans(working_dir: &Path, kind: BanKind) -> anyhow::Result<Vec<BanRecord>> {
    let path = kind.path_in(working_dir);
    let raw = match tokio::fs::read(&path).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}

async fn write_bans(working_dir: &Path, kind: BanKind, bans: &[BanRecord]) -> anyhow::Result<()> {
    let path = kind.path_in(working_dir);
    let body = serde_json::to_vec_pretty(bans).context("serialize ban list")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("rename {}", path.display()));
    }
    Ok(())
}

/// Inserts `record`, replacing any existing entry for the same subject.
pub async fn upsert_ban(working_dir: &Path, kind: BanKind, record: BanRecord) -> anyhow::Result<()> {
    let subject = record
        .subject(kind)
        .map(str::to_string)
        .context("ban record has no subject")?;
    let mut bans = read_bans(working_dir, kind).await?;
    bans.retain(|b| !b.matches(kind, &subject));
    bans.push(record);
    write_bans(working_dir, kind, &bans).await
}

/// Changes the reason of an existing ban, and its expiry when one is given.
/// Returns false when there is no such ban.
pub async fn update_ban(
    working_dir: &Path,
    kind: BanKind,
    subject: &str,
    reason: &str,
    expires: Option<&str>,
) -> anyhow::Result<bool> {
    let mut bans = read_bans(working_dir, kind).await?;
    let Some(b) = bans.iter_mut().find(|b| b.matches(kind, subject)) else {
        return Ok(false);
    };
    b.reason = reason.to_string();
    if let Some(e) = expires {
        b.expires = expiry(Some(e));
    }
    write_bans(working_dir, kind, &bans).await?;
    Ok(true)
}

/// Returns false when `subject` was not banned.
pub async fn remove_ban(working_dir: &Path, kind: BanKind, subject: &str) -> anyhow::Result<bool> {
    let mut bans = read_bans(working_dir, kind).await?;
    let before = bans.len();
    bans.retain(|b| !b.matches(kind, subject));
    if bans.len() == before {
        return Ok(false);
    }
    write_bans(working_dir, kind, &bans).await?;
    Ok(true)
}

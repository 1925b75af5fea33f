//! Recent player activity: a small in-memory window backed by an append-only
//! flat file (`logs/user_connections.log`, one `timestamp | type | subject | reason`
//! record per line).

use std::{
    collections::{HashSet, VecDeque},
    fs,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};

use anyhow::Context;
use chrono::{DateTime, Local, NaiveDate};
use flate2::read::GzDecoder;
use kiln_process::{ActivityKind, ActivityRecord};
use tokio::io::AsyncWriteExt;

use crate::log_parser;

pub const MEMORY_CAP: usize = 50;
pub const ACTIVITY_FILE: &str = "user_connections.log";
const MAX_ARCHIVES: usize = 10;
const SEP: &str = " | ";

pub struct ActivityStore {
    path: PathBuf,
    recent: Mutex<VecDeque<ActivityRecord>>,
}

fn clean(s: &str) -> String {
    s.replace(['\r', '\n'], " ").trim().to_string()
}

pub fn format_record(r: &ActivityRecord) -> String {
    format!(
        "{}{SEP}{}{SEP}{}{SEP}{}",
        r.timestamp,
        r.kind.as_str(),
        clean(&r.subject),
        r.reason.as_deref().map(clean).unwrap_or_default()
    )
}

pub fn parse_record(line: &str) -> Option<ActivityRecord> {
    let mut parts = line.trim_end_matches(['\r', '\n']).splitn(4, SEP);
    let timestamp = parts.next()?.trim();
    let kind = ActivityKind::parse(parts.next()?)?;
    let subject = parts.next()?.trim();
    let reason = parts.next().map(str::trim).filter(|r| !r.is_empty());
    if timestamp.is_empty() || subject.is_empty() {
        return None;
    }
    Some(ActivityRecord {
        kind,
        subject: subject.to_string(),
        reason: reason.map(str::to_string),
        timestamp: timestamp.to_string(),
    })
}

fn mtime_date(path: &Path) -> Option<NaiveDate> {
    let modified: SystemTime = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Local>::from(modified).date_naive())
}

/// Archives are named `YYYY-MM-DD-N.log.gz`; fall back to the file's mtime.
fn archive_date(path: &Path) -> Option<NaiveDate> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.get(..10))
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        .or_else(|| mtime_date(path))
}

fn for_each_line(reader: impl Read, mut f: impl FnMut(&str)) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        f(&String::from_utf8_lossy(&buf));
    }
}

/// Replays the newest archives (oldest first) and then `latest.log` in
/// historical mode. Never touches online-player state.
pub fn rebuild_from_logs(logs_dir: &Path) -> Vec<ActivityRecord> {
    let mut archives: Vec<(SystemTime, PathBuf)> = fs::read_dir(logs_dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".log.gz"))
        })
        .map(|p| {
            let mtime = fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (mtime, p)
        })
        .collect();
    archives.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    archives.truncate(MAX_ARCHIVES);
    archives.reverse();

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |date: NaiveDate, line: &str| {
        if let Some(rec) = log_parser::parse_historical(line, date)
            && seen.insert((rec.kind, rec.subject.clone(), rec.timestamp.clone()))
        {
            out.push(rec);
        }
    };

    for (_, path) in &archives {
        let Some(date) = archive_date(path) else {
            continue;
        };
        let res = fs::File::open(path)
            .and_then(|f| for_each_line(GzDecoder::new(f), |line| push(date, line)));
        if let Err(err) = res {
            tracing::warn!(path = %path.display(), %err, "skipping unreadable log archive");
        }
    }

    let latest = logs_dir.join("latest.log");
    if let Some(date) = mtime_date(&latest) {
        let res = fs::File::open(&latest).and_then(|f| for_each_line(f, |line| push(date, line)));
        if let Err(err) = res {
            tracing::warn!(path = %latest.display(), %err, "skipping unreadable live log");
        }
    }

    out
}

impl ActivityStore {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            path: logs_dir.join(ACTIVITY_FILE),
            recent: Mutex::new(VecDeque::with_capacity(MEMORY_CAP)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ActivityRecord>> {
        self.recent.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the newest records from the activity file, rebuilding the file
    /// from log archives first when it does not exist yet.
    pub fn load(&self) -> anyhow::Result<()> {
        if !self.path.exists() {
            let logs_dir = self.path.parent().unwrap_or(Path::new("."));
            let rebuilt = rebuild_from_logs(logs_dir);
            fs::create_dir_all(logs_dir)
                .with_context(|| format!("create {}", logs_dir.display()))?;
            let mut body = String::new();
            for r in &rebuilt {
                body.push_str(&format_record(r));
                body.push('\n');
            }
            let tmp = self.path.with_extension("log.tmp");
            fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
            fs::rename(&tmp, &self.path)
                .with_context(|| format!("rename {}", self.path.display()))?;
            tracing::info!(path = %self.path.display(), records = rebuilt.len(), "rebuilt activity log");
        }

        let f = fs::File::open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let mut window = VecDeque::with_capacity(MEMORY_CAP + 1);
        for_each_line(f, |line| {
            if let Some(rec) = parse_record(line) {
                window.push_back(rec);
                if window.len() > MEMORY_CAP {
                    window.pop_front();
                }
            }
        })
        .with_context(|| format!("read {}", self.path.display()))?;

        *self.lock() = window;
        Ok(())
    }

    /// Records one event. Returns false when it duplicates a record already in
    /// memory. The in-memory window is updated even if the file append fails.
    pub async fn push(&self, record: ActivityRecord) -> bool {
        {
            let mut recent = self.lock();
            if recent.iter().any(|r| r.same_event(&record)) {
                return false;
            }
            recent.push_back(record.clone());
            while recent.len() > MEMORY_CAP {
                recent.pop_front();
            }
        }

        if let Err(err) = self.append(&record).await {
            tracing::warn!(path = %self.path.display(), %err, "failed to append activity record");
        }
        true
    }

    async fn append(&self, record: &ActivityRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = format!("{}\n", format_record(record));
        f.write_all(line.as_bytes()).await?;
        f.flush().await
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActivityRecord> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }
}

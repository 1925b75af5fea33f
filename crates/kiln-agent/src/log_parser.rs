//! Line-oriented recognition of server console output.
//!
//! [`parse_line`] is pure: it looks at one line and returns at most one
//! [`LogEvent`] plus an optional [`StatusHint`]. The rules in [`RULES`] are
//! tried in order and the first match wins, so order matters: IP variants of
//! ban/unban must precede the player variants, and `lost connection` must
//! precede `left the game`.
//!
//! Recognition is heuristic. Vendor phrasing varies between server builds and
//! a line that matches nothing is simply ignored.

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use kiln_process::{ActivityKind, ActivityRecord};
use regex::{Captures, Regex};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    /// The server finished booting.
    Ready,
    /// The server announced shutdown.
    Stopping,
    /// The server is past saving and about to exit.
    Terminated,
}

/// Best-effort classification of a disconnect reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    Kick,
    Timeout,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    UuidLearned { name: String, uuid: String },
    Login { name: String, ip: String },
    Joined { name: String },
    Disconnected {
        name: String,
        reason: String,
        kind: DisconnectKind,
    },
    Left { name: String },
    Kicked { name: String, reason: String },
    Banned { name: String, reason: String },
    BannedIp { ip: String, reason: String },
    Unbanned { name: String },
    UnbannedIp { ip: String },
}

impl LogEvent {
    /// The activity feed entry for this event, if it produces one:
    /// (type, subject, reason).
    pub fn activity(&self) -> Option<(ActivityKind, &str, String)> {
        let out = match self {
            LogEvent::UuidLearned { .. } => return None,
            LogEvent::Login { name, .. } | LogEvent::Joined { name } => {
                (ActivityKind::Join, name.as_str(), "Joined the game".to_string())
            }
            LogEvent::Disconnected { name, reason, kind } => {
                let k = match kind {
                    DisconnectKind::Kick => ActivityKind::Kick,
                    DisconnectKind::Timeout | DisconnectKind::Leave => ActivityKind::Leave,
                };
                (k, name.as_str(), reason.clone())
            }
            LogEvent::Left { name } => {
                (ActivityKind::Leave, name.as_str(), "Left the game".to_string())
            }
            LogEvent::Kicked { name, reason } => (ActivityKind::Kick, name.as_str(), reason.clone()),
            LogEvent::Banned { name, reason } => (ActivityKind::Ban, name.as_str(), reason.clone()),
            LogEvent::BannedIp { ip, reason } => (ActivityKind::BanIp, ip.as_str(), reason.clone()),
            LogEvent::Unbanned { name } => {
                (ActivityKind::Unban, name.as_str(), "Unbanned".to_string())
            }
            LogEvent::UnbannedIp { ip } => {
                (ActivityKind::UnbanIp, ip.as_str(), "Unbanned IP".to_string())
            }
        };
        Some(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLine {
    /// Wall-clock time printed at the start of the line (no date).
    pub time: Option<NaiveTime>,
    pub hint: Option<StatusHint>,
    pub event: Option<LogEvent>,
}

/// How an event timestamp gets its date.
#[derive(Debug, Clone, Copy)]
pub enum ParseMode {
    /// Tailing the live log: time-only stamps belong to `now`'s date.
    Live { now: NaiveDateTime },
    /// Rebuilding from archives: the caller knows which day the file covers.
    Historical { date: NaiveDate },
}

struct Rule {
    name: &'static str,
    re: Regex,
    build: fn(&Captures<'_>) -> LogEvent,
}

fn cap(c: &Captures<'_>, i: usize) -> String {
    c.get(i).map(|m| m.as_str().trim().to_string()).unwrap_or_default()
}

fn reason(c: &Captures<'_>, i: usize) -> String {
    // Op-issued commands echo as "[Op: Kicked X: reason]".
    cap(c, i).trim_end_matches(']').trim().to_string()
}

fn rule(name: &'static str, pattern: &str, build: fn(&Captures<'_>) -> LogEvent) -> Rule {
    Rule {
        name,
        // Patterns are compile-time constants covered by tests.
        re: Regex::new(pattern).unwrap_or_else(|e| panic!("bad log rule {name}: {e}")),
        build,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule("uuid", r"^UUID of player (\S+) is ([0-9a-fA-F-]+)", |c| {
            LogEvent::UuidLearned {
                name: cap(c, 1),
                uuid: cap(c, 2),
            }
        }),
        rule(
            "login",
            r"^([^\s\[]+)\[/([0-9A-Fa-f.:]+):\d+\] logged in",
            |c| LogEvent::Login {
                name: cap(c, 1),
                ip: cap(c, 2),
            },
        ),
        rule("join", r"^(\S+) joined the game", |c| LogEvent::Joined {
            name: cap(c, 1),
        }),
        rule("lost-connection", r"^(\S+) lost connection: (.*)$", |c| {
            let reason = cap(c, 2);
            LogEvent::Disconnected {
                name: cap(c, 1),
                kind: classify_disconnect(&reason),
                reason,
            }
        }),
        rule("left", r"^(\S+) left the game", |c| LogEvent::Left {
            name: cap(c, 1),
        }),
        rule("kick", r"Kicked ([A-Za-z0-9_]+): (.*)$", |c| LogEvent::Kicked {
            name: cap(c, 1),
            reason: reason(c, 2),
        }),
        rule("ban-ip", r"Banned IP ([0-9A-Fa-f.:]+?): (.*)$", |c| {
            LogEvent::BannedIp {
                ip: cap(c, 1),
                reason: reason(c, 2),
            }
        }),
        rule("ban", r"Banned ([A-Za-z0-9_]+): (.*)$", |c| LogEvent::Banned {
            name: cap(c, 1),
            reason: reason(c, 2),
        }),
        rule("unban-ip", r"Unbanned IP ([0-9A-Fa-f.:]*[0-9A-Fa-f])", |c| {
            LogEvent::UnbannedIp { ip: cap(c, 1) }
        }),
        rule("unban", r"Unbanned ([A-Za-z0-9_]+)", |c| LogEvent::Unbanned {
            name: cap(c, 1),
        }),
    ]
});

static TIME_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{2}:\d{2}:\d{2})(?:[.,]\d+)?(?:\s+[A-Za-z]+)?\]\s*")
        .unwrap_or_else(|e| panic!("bad time prefix: {e}"))
});

const HINTS: &[(&str, StatusHint)] = &[
    ("Awaiting termination", StatusHint::Terminated),
    ("All RegionFile I/O tasks to complete", StatusHint::Terminated),
    ("Stopping server", StatusHint::Stopping),
    ("Stopping the server", StatusHint::Stopping),
    ("Done (", StatusHint::Ready),
    ("Done preparing level", StatusHint::Ready),
    ("Dedicated server took", StatusHint::Ready),
    ("Server started", StatusHint::Ready),
];

/// Substring heuristics on the reason text. May misclassify; kept deliberately simple.
pub fn classify_disconnect(reason: &str) -> DisconnectKind {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("kicked") {
        DisconnectKind::Kick
    } else if lower.contains("timed out") {
        DisconnectKind::Timeout
    } else {
        DisconnectKind::Leave
    }
}

/// Splits off the leading `[HH:MM:SS]` stamp and any `[thread/LEVEL]:` prefix.
fn split_line(line: &str) -> (Option<NaiveTime>, &str) {
    let line = line.trim();
    let (time, rest) = match TIME_PREFIX.captures(line) {
        Some(c) => {
            let time = c
                .get(1)
                .and_then(|m| NaiveTime::parse_from_str(m.as_str(), "%H:%M:%S").ok());
            let end = c.get(0).map(|m| m.end()).unwrap_or(0);
            (time, &line[end..])
        }
        None => (None, line),
    };

    // "[10:00:00 INFO]: msg" leaves ": msg" behind.
    let rest = rest.strip_prefix(':').unwrap_or(rest).trim_start();
    let message = if rest.starts_with('[') {
        rest.split_once("]: ").map(|(_, m)| m).unwrap_or(rest)
    } else {
        rest
    };
    (time, message.trim())
}

pub fn parse_line(line: &str) -> ParsedLine {
    let (time, message) = split_line(line);

    // Player chat ("<Name> ...") can contain any phrase; never trust it.
    if message.starts_with('<') {
        return ParsedLine {
            time,
            ..ParsedLine::default()
        };
    }

    let hint = HINTS
        .iter()
        .find(|(needle, _)| message.contains(needle))
        .map(|(_, h)| *h);

    let event = RULES.iter().find_map(|r| {
        r.re.captures(message).map(|c| {
            tracing::trace!(rule = r.name, "log rule matched");
            (r.build)(&c)
        })
    });

    ParsedLine { time, hint, event }
}

pub fn normalize_timestamp(time: Option<NaiveTime>, mode: ParseMode) -> String {
    let at = match (mode, time) {
        (ParseMode::Live { now }, Some(t)) => now.date().and_time(t),
        (ParseMode::Live { now }, None) => now,
        (ParseMode::Historical { date }, Some(t)) => date.and_time(t),
        (ParseMode::Historical { date }, None) => date.and_time(NaiveTime::MIN),
    };
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Activity record for an already parsed line.
pub fn to_record(parsed: &ParsedLine, mode: ParseMode) -> Option<ActivityRecord> {
    let (kind, subject, reason) = parsed.event.as_ref()?.activity()?;
    Some(ActivityRecord {
        kind,
        subject: subject.to_string(),
        reason: Some(reason),
        timestamp: normalize_timestamp(parsed.time, mode),
    })
}

/// Historical mode: parse an archived line into an activity record without
/// touching any online-player state.
pub fn parse_historical(line: &str, date: NaiveDate) -> Option<ActivityRecord> {
    to_record(&parse_line(line), ParseMode::Historical { date })
}

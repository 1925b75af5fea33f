//! One supervised server process.
//!
//! A `ManagedProcess` owns the child it launched (or the orphan it re-attached
//! to), a tail task reading `logs/latest.log` and a monitor task waiting for
//! the process to die. Every start or re-attach begins a new *run*; tasks
//! carry their run number and go quiet once it is no longer current, so a
//! stale task can never touch the state of a later run.
//!
//! The cached status is only a belief. Reads go through
//! [`kiln_process::effective_status`] and heal the cache when the pid is gone.

use std::{
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{Local, Utc};
use kiln_process::{
    effective_status, ActivityRecord, InstanceConfig, InstanceStats, InstanceStatus, PlayerInfo,
    SubscriberId,
};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin},
    sync::Mutex,
};

use crate::{
    activity::ActivityStore,
    bans::{self, BanKind, BanRecord},
    error::{format_error_chain, SupervisorError},
    fanout::{LogFanout, Subscription},
    launch,
    log_parser::{self, ParseMode, StatusHint},
    os,
    players::PlayerRegistry,
    settings::Settings,
};

const REATTACH_SCAN_BYTES: u64 = 64 * 1024;

#[derive(Debug)]
struct RunState {
    status: InstanceStatus,
    pid: Option<u32>,
    /// Launched by this supervisor (as opposed to re-attached).
    owned: bool,
    run: u64,
}

struct Inner {
    config: InstanceConfig,
    settings: Settings,
    state: Mutex<RunState>,
    stdin: Mutex<Option<ChildStdin>>,
    // Serializes start/stop/kill/recover.
    control: Mutex<()>,
    bans_lock: Mutex<()>,
    players: PlayerRegistry,
    activity: ActivityStore,
    fanout: LogFanout,
    sampler: std::sync::Mutex<os::ResourceSampler>,
}

#[derive(Clone)]
pub struct ManagedProcess {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Copy)]
enum TailFrom {
    Start,
    End,
}

fn read_pid_file(working_dir: &Path) -> Option<u32> {
    std::fs::read_to_string(launch::pid_file(working_dir))
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|p| *p > 0)
}

async fn write_pid_file(working_dir: &Path, pid: u32) -> std::io::Result<()> {
    let path = launch::pid_file(working_dir);
    let tmp = path.with_extension("pid.tmp");
    tokio::fs::write(&tmp, pid.to_string()).await?;
    tokio::fs::rename(&tmp, &path).await
}

async fn clear_pid_file(working_dir: &Path) {
    match tokio::fs::remove_file(launch::pid_file(working_dir)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(dir = %working_dir.display(), %err, "failed to remove pid file"),
    }
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Replays the end of the live log into a scratch registry to guess where a
/// re-attached server is. With no hint in the window it is assumed ONLINE.
fn infer_from_log_tail(path: &Path) -> (InstanceStatus, PlayerRegistry) {
    let scratch = PlayerRegistry::new();
    let mut status = InstanceStatus::Online;

    let read = || -> std::io::Result<String> {
        let mut f = std::fs::File::open(path)?;
        let len = f.metadata()?.len();
        let start = len.saturating_sub(REATTACH_SCAN_BYTES);
        f.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf).to_string();
        if start > 0 {
            // Drop the partial first line.
            return Ok(text.split_once('\n').map(|(_, rest)| rest.to_string()).unwrap_or_default());
        }
        Ok(text)
    };

    let text = match read() {
        Ok(t) => t,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "no live log to infer state from");
            return (status, scratch);
        }
    };

    let now = Utc::now();
    for line in text.lines() {
        let parsed = log_parser::parse_line(line);
        match parsed.hint {
            Some(StatusHint::Ready) => status = InstanceStatus::Online,
            Some(StatusHint::Stopping | StatusHint::Terminated) => status = InstanceStatus::Stopping,
            None => {}
        }
        if let Some(ev) = &parsed.event {
            scratch.apply(ev, now);
        }
    }
    (status, scratch)
}

/// Resolves the command line, rotates the previous live log and builds the
/// child command. Walks the server directory, so it runs on a blocking thread.
fn prepare_launch(
    cfg: &InstanceConfig,
    java_bin: &str,
) -> Result<(launch::LaunchSpec, tokio::process::Command), SupervisorError> {
    let spec = launch::resolve_launch_spec(cfg, java_bin)?;

    if let Err(err) = launch::rotate_latest_log(&cfg.working_dir) {
        tracing::warn!(instance = %cfg.name, err = %format_error_chain(&err), "failed to rotate latest.log");
    }

    let cmd = launch::build_command(&spec, &cfg.working_dir)
        .map_err(|e| SupervisorError::launch(&cfg.name, format_error_chain(&e)))?;
    Ok((spec, cmd))
}

/// Consecutive read failures on the live log. Only the first of a streak is
/// logged; the tail gives up once the streak reaches `limit`.
#[derive(Debug)]
struct ReadErrors {
    streak: u32,
    limit: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum ReadErrorAction {
    Warn,
    Quiet,
    GiveUp,
}

impl ReadErrors {
    const LIMIT: u32 = 20;

    fn new(limit: u32) -> Self {
        Self { streak: 0, limit }
    }

    fn record(&mut self) -> ReadErrorAction {
        self.streak += 1;
        if self.streak >= self.limit {
            ReadErrorAction::GiveUp
        } else if self.streak == 1 {
            ReadErrorAction::Warn
        } else {
            ReadErrorAction::Quiet
        }
    }

    fn reset(&mut self) {
        self.streak = 0;
    }

    /// Poll delay grows with the streak, capped at 16x.
    fn backoff(&self, poll: Duration) -> Duration {
        poll * (1u32 << self.streak.min(4))
    }
}

impl ManagedProcess {
    pub fn new(config: InstanceConfig, settings: Settings) -> Self {
        let logs = launch::logs_dir(&config.working_dir);
        let capacity = settings.subscriber_capacity;
        Self {
            inner: Arc::new(Inner {
                activity: ActivityStore::new(&logs),
                fanout: LogFanout::new(capacity),
                players: PlayerRegistry::new(),
                sampler: std::sync::Mutex::new(os::ResourceSampler::default()),
                state: Mutex::new(RunState {
                    status: InstanceStatus::Offline,
                    pid: None,
                    owned: false,
                    run: 0,
                }),
                stdin: Mutex::new(None),
                control: Mutex::new(()),
                bans_lock: Mutex::new(()),
                config,
                settings,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.inner.config
    }

    fn working_dir(&self) -> &Path {
        &self.inner.config.working_dir
    }

    fn latest_log(&self) -> PathBuf {
        launch::latest_log(self.working_dir())
    }

    /// Loads the recent-activity window, rebuilding the activity file from
    /// log archives when it is missing.
    pub async fn load_activity(&self) {
        let this = self.clone();
        let res = tokio::task::spawn_blocking(move || this.inner.activity.load()).await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                instance = %self.name(),
                err = %format_error_chain(&err),
                "failed to load activity log"
            ),
            Err(err) => tracing::warn!(instance = %self.name(), %err, "activity load task failed"),
        }
    }

    /// Current status, re-validated against the OS. A dead pid is finalized
    /// on the spot.
    pub async fn status(&self) -> InstanceStatus {
        let (cached, pid, run) = {
            let st = self.inner.state.lock().await;
            (st.status, st.pid, st.run)
        };
        let alive = pid.is_some_and(os::pid_alive);
        let effective = effective_status(cached, alive);
        if effective != cached || (!alive && pid.is_some()) {
            self.finalize(run, "process is gone").await;
        }
        effective
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.state.lock().await.pid
    }

    /// True when writes can reach the child's stdin.
    pub async fn has_interactive_channel(&self) -> bool {
        self.inner.stdin.lock().await.is_some()
    }

    async fn is_current(&self, run: u64) -> bool {
        let st = self.inner.state.lock().await;
        st.run == run && !st.status.is_offline()
    }

    /// Moves `run` to OFFLINE and releases everything tied to it. Idempotent:
    /// only the first call for a run has an effect.
    async fn finalize(&self, run: u64, reason: &str) -> bool {
        let (pid, owned) = {
            let mut st = self.inner.state.lock().await;
            if st.run != run || (st.status.is_offline() && st.pid.is_none()) {
                return false;
            }
            st.status = InstanceStatus::Offline;
            (st.pid.take(), std::mem::take(&mut st.owned))
        };

        match self.inner.stdin.try_lock() {
            Ok(mut stdin) => *stdin = None,
            // A writer is stuck on the pipe; it clears the handle when its write fails.
            Err(_) => tracing::debug!(instance = %self.name(), "stdin busy at exit"),
        }
        clear_pid_file(self.working_dir()).await;
        self.inner.players.clear_online();
        self.inner.fanout.close_run();
        tracing::info!(instance = %self.name(), pid = ?pid, owned, reason, "instance is offline");
        true
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _ctl = self.inner.control.lock().await;

        let status = self.status().await;
        if !status.is_offline() {
            tracing::info!(instance = %self.name(), %status, "start ignored, already running");
            return Ok(());
        }

        // A live pid we are not attached to (e.g. the registry was rebuilt
        // without recovery) must not get a second server next to it.
        if let Some(pid) = read_pid_file(self.working_dir()).filter(|p| os::pid_alive(*p)) {
            tracing::warn!(instance = %self.name(), pid, "found a running server; attaching instead of launching");
            self.attach(pid).await;
            return Ok(());
        }

        let cfg = self.inner.config.clone();
        let java_bin = self.inner.settings.java_bin.clone();
        let (spec, mut cmd) = tokio::task::spawn_blocking(move || prepare_launch(&cfg, &java_bin))
            .await
            .map_err(|e| {
                SupervisorError::launch(self.name(), format!("launch preparation failed: {e}"))
            })??;
        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::launch(self.name(), format!("spawn {}: {e}", spec.exec)))?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::launch(self.name(), "process exited immediately"));
        };

        tracing::info!(
            instance = %self.name(),
            pid,
            kind = ?spec.kind,
            command = %spec.display(),
            "launched server"
        );

        if let Err(err) = write_pid_file(self.working_dir(), pid).await {
            tracing::warn!(instance = %self.name(), pid, %err, "failed to write pid file");
        }

        let stdin = child.stdin.take();
        let run = {
            let mut st = self.inner.state.lock().await;
            st.run += 1;
            st.status = InstanceStatus::Starting;
            st.pid = Some(pid);
            st.owned = true;
            st.run
        };
        *self.inner.stdin.lock().await = stdin;

        tokio::spawn(self.clone().tail_loop(run, TailFrom::Start));
        tokio::spawn(self.clone().monitor_child(run, child));
        Ok(())
    }

    /// Adopts an already running server: no stdin, tail from end of file.
    async fn attach(&self, pid: u32) {
        let path = self.latest_log();
        let (status, scratch) = match tokio::task::spawn_blocking(move || infer_from_log_tail(&path)).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(instance = %self.name(), %err, "log inference task failed");
                (InstanceStatus::Online, PlayerRegistry::new())
            }
        };
        self.inner.players.replace_with(&scratch);

        if let Err(err) = write_pid_file(self.working_dir(), pid).await {
            tracing::warn!(instance = %self.name(), pid, %err, "failed to write pid file");
        }

        let run = {
            let mut st = self.inner.state.lock().await;
            st.run += 1;
            st.status = status;
            st.pid = Some(pid);
            st.owned = false;
            st.run
        };
        *self.inner.stdin.lock().await = None;

        tracing::info!(
            instance = %self.name(),
            pid,
            %status,
            players = self.inner.players.count(),
            "re-attached to running server"
        );

        tokio::spawn(self.clone().tail_loop(run, TailFrom::End));
        tokio::spawn(self.clone().monitor_pid(run, pid));
    }

    /// Re-attaches to a server left running by a previous supervisor: first
    /// through the pid file, then by scanning processes in the working
    /// directory. Returns true when something was adopted.
    pub async fn recover(&self) -> bool {
        let _ctl = self.inner.control.lock().await;
        if !self.status().await.is_offline() {
            return true;
        }

        let dir = self.working_dir().to_path_buf();
        if let Some(pid) = read_pid_file(&dir) {
            if os::pid_alive(pid) {
                self.attach(pid).await;
                return true;
            }
            tracing::info!(instance = %self.name(), pid, "removing stale pid file");
            clear_pid_file(&dir).await;
        }

        let name = launch::expected_process_name(&self.inner.config, &self.inner.settings.java_bin);
        let scan_dir = dir.clone();
        let scan_name = name.clone();
        let found = tokio::task::spawn_blocking(move || os::find_orphan(&scan_dir, &scan_name)).await;
        match found {
            Ok(Ok(Some(pid))) => {
                tracing::info!(instance = %self.name(), pid, process = %name, "found orphaned server by process scan");
                self.attach(pid).await;
                true
            }
            Ok(Ok(None)) => false,
            Ok(Err(err)) => {
                tracing::warn!(
                    instance = %self.name(),
                    err = %format_error_chain(&err),
                    "process scan failed; leaving instance offline"
                );
                false
            }
            Err(err) => {
                tracing::warn!(instance = %self.name(), %err, "process scan task failed");
                false
            }
        }
    }

    async fn promote_if_starting(&self, run: u64, pid: u32) {
        if !os::pid_alive(pid) {
            return;
        }
        let mut st = self.inner.state.lock().await;
        if st.run == run && st.status == InstanceStatus::Starting {
            st.status = InstanceStatus::Online;
            tracing::info!(instance = %self.name(), "no ready line seen before timeout; assuming online");
        }
    }

    async fn monitor_child(self, run: u64, mut child: Child) {
        let pid = child.id().unwrap_or_default();
        let ready = tokio::time::sleep(self.inner.settings.ready_timeout);
        tokio::pin!(ready);
        let mut promoted = false;

        loop {
            tokio::select! {
                res = child.wait() => {
                    match res {
                        Ok(status) => tracing::info!(instance = %self.name(), pid, %status, "server exited"),
                        Err(err) => tracing::warn!(instance = %self.name(), pid, %err, "wait on server failed"),
                    }
                    break;
                }
                _ = &mut ready, if !promoted => {
                    promoted = true;
                    self.promote_if_starting(run, pid).await;
                }
            }
        }
        self.finalize(run, "process exited").await;
    }

    async fn monitor_pid(self, run: u64, pid: u32) {
        let mut tick = tokio::time::interval(self.inner.settings.monitor_interval);
        let ready_at = tokio::time::Instant::now() + self.inner.settings.ready_timeout;
        loop {
            tick.tick().await;
            if !self.is_current(run).await {
                return;
            }
            if !os::pid_alive(pid) {
                self.finalize(run, "process exited").await;
                return;
            }
            if tokio::time::Instant::now() >= ready_at {
                self.promote_if_starting(run, pid).await;
            }
        }
    }

    async fn open_log(&self, run: u64) -> Option<File> {
        let path = self.latest_log();
        for _ in 0..self.inner.settings.log_wait_retries {
            if !self.is_current(run).await {
                return None;
            }
            if let Ok(f) = File::open(&path).await {
                return Some(f);
            }
            tokio::time::sleep(self.inner.settings.tail_poll).await;
        }
        tracing::warn!(
            instance = %self.name(),
            path = %path.display(),
            "live log did not appear; not tailing this run"
        );
        None
    }

    async fn tail_loop(self, run: u64, from: TailFrom) {
        let path = self.latest_log();
        let Some(mut file) = self.open_log(run).await else {
            return;
        };

        let mut pos = 0u64;
        if matches!(from, TailFrom::End) {
            match file.seek(SeekFrom::End(0)).await {
                Ok(p) => pos = p,
                Err(err) => tracing::warn!(instance = %self.name(), %err, "seek to end of log failed"),
            }
        }
        let mut ident = file.metadata().await.ok().as_ref().and_then(file_id);
        let mut reader = BufReader::new(file);
        let mut buf = Vec::<u8>::new();
        let mut errors = ReadErrors::new(ReadErrors::LIMIT);

        loop {
            let n = match reader.read_until(b'\n', &mut buf).await {
                Ok(n) => {
                    errors.reset();
                    n
                }
                Err(err) => {
                    match errors.record() {
                        ReadErrorAction::Warn => {
                            tracing::warn!(instance = %self.name(), %err, "reading live log failed");
                        }
                        ReadErrorAction::Quiet => {}
                        ReadErrorAction::GiveUp => {
                            tracing::warn!(
                                instance = %self.name(),
                                %err,
                                failures = errors.streak,
                                "live log keeps failing; not tailing this run"
                            );
                            return;
                        }
                    }
                    if !self.is_current(run).await {
                        return;
                    }
                    tokio::time::sleep(errors.backoff(self.inner.settings.tail_poll)).await;
                    continue;
                }
            };

            if n > 0 {
                pos += n as u64;
                if buf.last() != Some(&b'\n') {
                    // Partial line; the rest arrives with a later read.
                    continue;
                }
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                buf.clear();
                self.ingest(run, line).await;
                continue;
            }

            if !self.is_current(run).await {
                return;
            }

            let rotated = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len() < pos || (ident.is_some() && file_id(&meta) != ident),
                Err(_) => false,
            };
            if rotated && let Ok(f) = File::open(&path).await {
                tracing::debug!(instance = %self.name(), "live log rotated; reopening");
                ident = f.metadata().await.ok().as_ref().and_then(file_id);
                reader = BufReader::new(f);
                pos = 0;
                buf.clear();
                continue;
            }

            tokio::time::sleep(self.inner.settings.tail_poll).await;
        }
    }

    async fn apply_hint(&self, run: u64, hint: StatusHint) {
        let mut st = self.inner.state.lock().await;
        if st.run != run {
            return;
        }
        match (hint, st.status) {
            (StatusHint::Ready, InstanceStatus::Starting) => {
                st.status = InstanceStatus::Online;
                tracing::info!(instance = %self.name(), "server is ready");
            }
            (
                StatusHint::Stopping | StatusHint::Terminated,
                InstanceStatus::Starting | InstanceStatus::Online,
            ) => {
                st.status = InstanceStatus::Stopping;
                tracing::info!(instance = %self.name(), "server is stopping");
            }
            _ => {}
        }
    }

    /// One tailed line: status hint, then player state and activity, then fan-out.
    async fn ingest(&self, run: u64, line: String) {
        tracing::trace!(instance = %self.name(), %line, "console");
        let parsed = log_parser::parse_line(&line);
        if let Some(hint) = parsed.hint {
            self.apply_hint(run, hint).await;
        }
        if let Some(ev) = &parsed.event {
            self.inner.players.apply(ev, Utc::now());
            let mode = ParseMode::Live {
                now: Local::now().naive_local(),
            };
            if let Some(rec) = log_parser::to_record(&parsed, mode) {
                self.inner.activity.push(rec).await;
            }
        }
        self.inner.fanout.publish(line);
    }

    /// Writes one command line to the server's stdin.
    pub async fn write(&self, command: &str) -> Result<(), SupervisorError> {
        let command = command.trim_end_matches(['\r', '\n']);
        {
            let mut guard = self.inner.stdin.lock().await;
            if let Some(w) = guard.as_mut() {
                let line = format!("{command}\n");
                let res = async {
                    w.write_all(line.as_bytes()).await?;
                    w.flush().await
                }
                .await;
                return match res {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        // Broken pipe: the process is on its way out.
                        *guard = None;
                        tracing::warn!(instance = %self.name(), %err, "stdin write failed");
                        Err(SupervisorError::Io(err))
                    }
                };
            }
        }

        if self.status().await.is_offline() {
            Err(SupervisorError::NotOnline {
                instance: self.name().to_string(),
            })
        } else {
            Err(SupervisorError::NoInteractiveChannel {
                instance: self.name().to_string(),
            })
        }
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let _ctl = self.inner.control.lock().await;
        if self.status().await.is_offline() {
            return Ok(());
        }

        let (pid, run) = {
            let mut st = self.inner.state.lock().await;
            st.status = InstanceStatus::Stopping;
            (st.pid, st.run)
        };
        let Some(pid) = pid else {
            self.finalize(run, "stopped").await;
            return Ok(());
        };

        tracing::info!(instance = %self.name(), pid, "stopping server");
        let stop_timeout = self.inner.settings.stop_timeout;
        let sent = match tokio::time::timeout(stop_timeout, self.write("stop")).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(instance = %self.name(), %err, "no stdin for stop; sending SIGTERM");
                false
            }
            Err(_) => {
                tracing::warn!(instance = %self.name(), pid, "stdin is not draining; sending SIGTERM");
                false
            }
        };
        if !sent && let Err(err) = os::request_terminate(pid) {
            tracing::warn!(instance = %self.name(), pid, %err, "SIGTERM failed");
        }

        if !os::wait_for_exit(pid, stop_timeout).await {
            tracing::warn!(
                instance = %self.name(),
                pid,
                timeout_ms = stop_timeout.as_millis() as u64,
                "graceful stop timed out; killing"
            );
            self.kill_inner().await;
            return Ok(());
        }

        self.finalize(run, "stopped").await;
        Ok(())
    }

    pub async fn kill(&self) -> Result<(), SupervisorError> {
        let _ctl = self.inner.control.lock().await;
        self.kill_inner().await;
        Ok(())
    }

    async fn kill_inner(&self) {
        let (pid, run) = {
            let st = self.inner.state.lock().await;
            (st.pid, st.run)
        };
        let pid = pid.or_else(|| read_pid_file(self.working_dir()).filter(|p| os::pid_alive(*p)));

        if let Some(pid) = pid {
            tracing::info!(instance = %self.name(), pid, "killing server");
            if let Err(err) = os::force_kill(pid) {
                tracing::warn!(instance = %self.name(), pid, %err, "SIGKILL failed");
            }
            if !os::wait_for_exit(pid, self.inner.settings.kill_timeout).await {
                tracing::warn!(instance = %self.name(), pid, "process still alive after SIGKILL");
            }
        }

        self.finalize(run, "killed").await;
        clear_pid_file(self.working_dir()).await;
    }

    pub fn online_players(&self) -> Vec<PlayerInfo> {
        self.inner.players.online()
    }

    /// Newest first.
    pub fn recent_activity(&self, limit: usize) -> Vec<ActivityRecord> {
        self.inner.activity.recent(limit)
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.fanout.subscribe()
    }

    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        self.inner.fanout.unsubscribe(id)
    }

    pub async fn get_stats(&self) -> InstanceStats {
        let status = self.status().await;
        let Some(pid) = self.pid().await.filter(|_| !status.is_offline()) else {
            return InstanceStats::offline();
        };

        let sampled = {
            let mut sampler = self
                .inner
                .sampler
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            sampler.sample(pid)
        };
        let (cpu_percent, memory_mb) = sampled.unwrap_or_else(|err| {
            tracing::debug!(instance = %self.name(), pid, err = %format_error_chain(&err), "resource sample failed");
            (0.0, 0)
        });

        InstanceStats {
            status,
            cpu_percent,
            memory_mb,
            players_online: self.inner.players.count(),
        }
    }

    async fn require_online(&self) -> Result<(), SupervisorError> {
        if self.status().await == InstanceStatus::Online {
            Ok(())
        } else {
            Err(SupervisorError::NotOnline {
                instance: self.name().to_string(),
            })
        }
    }

    pub async fn kick(&self, player: &str, reason: Option<&str>) -> Result<(), SupervisorError> {
        self.require_online().await?;
        match reason.map(str::trim).filter(|r| !r.is_empty()) {
            Some(r) => self.write(&format!("kick {player} {r}")).await,
            None => self.write(&format!("kick {player}")).await,
        }
    }

    pub async fn op(&self, player: &str) -> Result<(), SupervisorError> {
        self.require_online().await?;
        self.write(&format!("op {player}")).await
    }

    pub async fn deop(&self, player: &str) -> Result<(), SupervisorError> {
        self.require_online().await?;
        self.write(&format!("deop {player}")).await
    }

    /// Sends an in-band moderation command when possible. The ban file has
    /// already been updated, so a missing channel is not an error here.
    async fn try_in_band(&self, command: String) {
        if self.status().await != InstanceStatus::Online {
            return;
        }
        if let Err(err) = self.write(&command).await {
            tracing::debug!(instance = %self.name(), %err, "ban list changed on disk only");
        }
    }

    pub async fn get_bans(&self, kind: BanKind) -> Result<Vec<BanRecord>, SupervisorError> {
        Ok(bans::read_bans(self.working_dir(), kind).await?)
    }

    /// Bans `subject`. `expires` is the server's expiry stamp; `None` bans
    /// forever.
    pub async fn add_ban(
        &self,
        kind: BanKind,
        subject: &str,
        reason: &str,
        expires: Option<&str>,
    ) -> Result<(), SupervisorError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(SupervisorError::InvalidConfig("ban subject is empty".to_string()));
        }
        let record = match kind {
            BanKind::Player => {
                let uuid = self
                    .inner
                    .players
                    .get(subject)
                    .and_then(|p| p.uuid)
                    .or_else(|| self.inner.players.uuid_of(subject));
                BanRecord::player(subject, uuid, reason, expires)
            }
            BanKind::Ip => {
                let linked = self
                    .inner
                    .players
                    .online()
                    .into_iter()
                    .find(|p| p.ip.as_deref() == Some(subject))
                    .map(|p| p.name);
                BanRecord::ip(subject, linked, reason, expires)
            }
        };

        {
            let _g = self.inner.bans_lock.lock().await;
            bans::upsert_ban(self.working_dir(), kind, record).await?;
        }
        tracing::info!(instance = %self.name(), ?kind, subject, "ban added");

        let verb = match kind {
            BanKind::Player => "ban",
            BanKind::Ip => "ban-ip",
        };
        let command = if reason.trim().is_empty() {
            format!("{verb} {subject}")
        } else {
            format!("{verb} {subject} {}", reason.trim())
        };
        self.try_in_band(command).await;
        Ok(())
    }

    /// Changes the reason of an existing ban, and its expiry when `expires`
    /// is given. Returns false if there was none.
    pub async fn update_ban(
        &self,
        kind: BanKind,
        subject: &str,
        reason: &str,
        expires: Option<&str>,
    ) -> Result<bool, SupervisorError> {
        let _g = self.inner.bans_lock.lock().await;
        Ok(bans::update_ban(self.working_dir(), kind, subject.trim(), reason, expires).await?)
    }

    /// Returns false if `subject` was not banned.
    pub async fn remove_ban(&self, kind: BanKind, subject: &str) -> Result<bool, SupervisorError> {
        let subject = subject.trim();
        let removed = {
            let _g = self.inner.bans_lock.lock().await;
            bans::remove_ban(self.working_dir(), kind, subject).await?
        };
        if removed {
            tracing::info!(instance = %self.name(), ?kind, subject, "ban removed");
        }
        let verb = match kind {
            BanKind::Player => "pardon",
            BanKind::Ip => "pardon-ip",
        };
        self.try_in_band(format!("{verb} {subject}")).await;
        Ok(removed)
    }

    /// Waits for status to leave STARTING/STOPPING or for `timeout`.
    pub async fn wait_settled(&self, timeout: Duration) -> InstanceStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let s = self.status().await;
            if matches!(s, InstanceStatus::Online | InstanceStatus::Offline)
                || tokio::time::Instant::now() >= deadline
            {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use kiln_process::ActivityKind;

    pub(crate) const FAKE_SERVER: &str = r#"#!/bin/sh
mkdir -p logs
echo "[10:00:00] [Server thread/INFO]: Starting minecraft server version test" >> logs/latest.log
echo "[10:00:01] [Server thread/INFO]: Done (1.234s)! For help, type \"help\"" >> logs/latest.log
while IFS= read -r line; do
  case "$line" in
    stop)
      echo "[10:09:00] [Server thread/INFO]: Stopping server" >> logs/latest.log
      [ -n "$STUBBORN" ] || exit 0
      ;;
    join\ *)
      n="${line#join }"
      echo "[10:00:10] [Server thread/INFO]: $n[/1.2.3.4:9000] logged in with entity id 1" >> logs/latest.log
      echo "[10:00:10] [Server thread/INFO]: $n joined the game" >> logs/latest.log
      ;;
    leave\ *)
      n="${line#leave }"
      echo "[10:05:00] [Server thread/INFO]: $n left the game" >> logs/latest.log
      ;;
    *)
      echo "[10:00:02] [Server thread/INFO]: $line" >> logs/latest.log
      ;;
  esac
done
while :; do sleep 1; done
"#;

    pub(crate) fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut dir = std::env::temp_dir();
        dir.push(format!("kiln-process-{test_name}-{}-{n}-{ts}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::canonicalize(&dir).unwrap()
    }

    pub(crate) fn test_settings() -> Settings {
        Settings {
            java_bin: "java".to_string(),
            stop_timeout: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(2),
            tail_poll: Duration::from_millis(50),
            log_wait_retries: 40,
            monitor_interval: Duration::from_millis(100),
            subscriber_capacity: 64,
        }
    }

    // Prints the ready line and then never reads stdin again.
    const DEAF_SERVER: &str = r#"#!/bin/sh
mkdir -p logs
echo "[10:00:01] [Server thread/INFO]: Done (0.5s)! For help, type \"help\"" >> logs/latest.log
exec sleep 1000
"#;

    // Never prints a ready line.
    const SILENT_SERVER: &str = r#"#!/bin/sh
mkdir -p logs
echo "[10:00:00] [Server thread/INFO]: Starting minecraft server version test" >> logs/latest.log
while :; do sleep 1; done
"#;

    // Never writes a live log at all.
    const LOGLESS_SERVER: &str = "#!/bin/sh\nwhile :; do sleep 1; done\n";

    pub(crate) fn fake_instance(test_name: &str, stubborn: bool) -> InstanceConfig {
        if stubborn {
            script_instance(
                test_name,
                &FAKE_SERVER.replacen("#!/bin/sh\n", "#!/bin/sh\nSTUBBORN=1\n", 1),
            )
        } else {
            script_instance(test_name, FAKE_SERVER)
        }
    }

    pub(crate) fn script_instance(test_name: &str, body: &str) -> InstanceConfig {
        let dir = temp_dir_for(test_name);
        std::fs::write(dir.join("fake-server.sh"), body).unwrap();
        InstanceConfig {
            name: test_name.to_string(),
            ram_mb: 1024,
            executable: dir.join("fake-server.sh"),
            working_dir: dir,
            port: 25565,
        }
    }

    macro_rules! eventually {
        ($cond:expr) => {{
            let mut ok = false;
            for _ in 0..100 {
                if $cond {
                    ok = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            ok
        }};
    }

    #[tokio::test]
    async fn start_reaches_online_and_kill_clears_everything() {
        let cfg = fake_instance("start-kill", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.start().await.unwrap();
        assert_eq!(p.wait_settled(Duration::from_secs(5)).await, InstanceStatus::Online);

        let pid = p.pid().await.unwrap();
        assert_eq!(read_pid_file(&cfg.working_dir), Some(pid));

        p.kill().await.unwrap();
        assert_eq!(p.status().await, InstanceStatus::Offline);
        assert!(!launch::pid_file(&cfg.working_dir).exists());
        assert!(!os::pid_alive(pid));
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let cfg = fake_instance("double-start", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.start().await.unwrap();
        let first = p.pid().await;
        p.wait_settled(Duration::from_secs(5)).await;
        p.start().await.unwrap();
        assert_eq!(p.pid().await, first);

        p.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn join_and_leave_are_tracked() {
        let cfg = fake_instance("join-leave", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        let mut sub = p.subscribe();
        p.start().await.unwrap();
        assert_eq!(p.wait_settled(Duration::from_secs(5)).await, InstanceStatus::Online);

        p.write("join Alice").await.unwrap();
        assert!(eventually!(p.online_players().iter().any(|pl| pl.name == "Alice")));
        let alice = p.online_players().into_iter().find(|pl| pl.name == "Alice").unwrap();
        assert_eq!(alice.ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(p.get_stats().await.players_online, 1);

        p.write("leave Alice").await.unwrap();
        assert!(eventually!(p.online_players().is_empty()));

        let recent = p.recent_activity(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, ActivityKind::Leave);
        assert_eq!(recent[1].kind, ActivityKind::Join);
        assert!(recent.iter().all(|r| r.subject == "Alice"));

        // Subscribers saw the console in order.
        let mut seen = Vec::new();
        while let Ok(Some(line)) = tokio::time::timeout(Duration::from_millis(500), sub.recv()).await {
            seen.push(line);
            if seen.iter().any(|l| l.contains("left the game")) {
                break;
            }
        }
        let joined = seen.iter().position(|l| l.contains("joined the game")).unwrap();
        let left = seen.iter().position(|l| l.contains("left the game")).unwrap();
        assert!(joined < left);

        p.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    async fn saw_line(sub: &mut Subscription, needle: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, sub.recv()).await {
            if line.contains(needle) {
                return true;
            }
        }
        false
    }

    async fn cached_status(p: &ManagedProcess) -> InstanceStatus {
        p.inner.state.lock().await.status
    }

    #[tokio::test]
    async fn ready_timeout_promotes_a_quiet_server() {
        let cfg = script_instance("quiet", SILENT_SERVER);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.start().await.unwrap();
        assert_eq!(p.status().await, InstanceStatus::Starting);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(p.status().await, InstanceStatus::Starting);
        assert!(eventually!(p.status().await == InstanceStatus::Online));

        p.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn repeated_ready_line_is_idempotent() {
        let cfg = fake_instance("ready-twice", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        let mut sub = p.subscribe();
        p.start().await.unwrap();
        assert_eq!(p.wait_settled(Duration::from_secs(5)).await, InstanceStatus::Online);
        let run = p.inner.state.lock().await.run;

        p.write("Done (9.876s)! For help, type \"help\"").await.unwrap();
        assert!(saw_line(&mut sub, "Done (9.876s)").await);
        assert_eq!(p.status().await, InstanceStatus::Online);
        assert_eq!(p.inner.state.lock().await.run, run);

        p.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn stopping_line_moves_online_to_stopping() {
        let cfg = fake_instance("stopping-line", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        let mut sub = p.subscribe();
        p.start().await.unwrap();
        assert_eq!(p.wait_settled(Duration::from_secs(5)).await, InstanceStatus::Online);

        p.write("Stopping server").await.unwrap();
        assert!(eventually!(cached_status(&p).await == InstanceStatus::Stopping));

        // A late ready line does not bring it back.
        p.write("Done (1.000s)! For help, type \"help\"").await.unwrap();
        assert!(saw_line(&mut sub, "Done (1.000s)").await);
        assert_eq!(p.status().await, InstanceStatus::Stopping);

        p.kill().await.unwrap();
        assert_eq!(p.status().await, InstanceStatus::Offline);
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn missing_live_log_is_not_fatal() {
        let cfg = script_instance("no-log", LOGLESS_SERVER);
        let settings = Settings {
            log_wait_retries: 3,
            ..test_settings()
        };
        let p = ManagedProcess::new(cfg.clone(), settings);
        p.start().await.unwrap();
        let pid = p.pid().await.unwrap();

        // Well past 3 polls: the tail has given up, the run carries on.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(p.status().await, InstanceStatus::Starting);
        assert!(os::pid_alive(pid));
        assert!(!launch::latest_log(&cfg.working_dir).exists());
        assert!(eventually!(p.status().await == InstanceStatus::Online));

        p.kill().await.unwrap();
        assert_eq!(p.status().await, InstanceStatus::Offline);
        assert!(!os::pid_alive(pid));
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn tail_follows_a_rotated_log() {
        let cfg = fake_instance("rotate", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.start().await.unwrap();
        assert_eq!(p.wait_settled(Duration::from_secs(5)).await, InstanceStatus::Online);

        let logs = launch::logs_dir(&cfg.working_dir);
        std::fs::rename(logs.join(launch::LATEST_LOG), logs.join("2026-03-01-1.log")).unwrap();
        p.write("join Carol").await.unwrap();
        assert!(eventually!(p.online_players().iter().any(|pl| pl.name == "Carol")));

        p.kill().await.unwrap();
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn stop_is_bounded_when_stdin_is_not_read() {
        let cfg = script_instance("deaf", DEAF_SERVER);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.start().await.unwrap();
        assert_eq!(p.wait_settled(Duration::from_secs(5)).await, InstanceStatus::Online);
        let pid = p.pid().await.unwrap();

        // Larger than any pipe buffer, so this write parks holding stdin.
        let writer = p.clone();
        let big = "x".repeat(200_000);
        let stuck = tokio::spawn(async move { writer.write(&big).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!stuck.is_finished());

        let res = tokio::time::timeout(Duration::from_secs(8), p.stop()).await;
        assert!(matches!(res, Ok(Ok(()))), "stop did not finish: {res:?}");
        assert_eq!(p.status().await, InstanceStatus::Offline);
        assert!(!os::pid_alive(pid));

        // The parked writer is released by the broken pipe.
        let written = tokio::time::timeout(Duration::from_secs(5), stuck).await.unwrap().unwrap();
        assert!(written.is_err());
        assert!(!p.has_interactive_channel().await);
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn launch_preparation_rotates_previous_log() {
        let cfg = fake_instance("prepare", false);
        let logs = launch::logs_dir(&cfg.working_dir);
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join(launch::LATEST_LOG), "[10:09:00] Stopping server\n").unwrap();

        let c = cfg.clone();
        let (spec, _cmd) = tokio::task::spawn_blocking(move || prepare_launch(&c, "java"))
            .await
            .unwrap()
            .unwrap();
        assert!(spec.display().contains("fake-server.sh"));
        assert!(!logs.join(launch::LATEST_LOG).exists());
        assert!(logs.join(launch::CONSOLE_OUT).exists());
        assert_eq!(std::fs::read_dir(&logs).unwrap().count(), 2);
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[test]
    fn read_errors_warn_once_then_give_up() {
        let mut errors = ReadErrors::new(4);
        assert_eq!(errors.record(), ReadErrorAction::Warn);
        assert_eq!(errors.record(), ReadErrorAction::Quiet);
        errors.reset();
        assert_eq!(errors.record(), ReadErrorAction::Warn);
        assert_eq!(errors.record(), ReadErrorAction::Quiet);
        assert_eq!(errors.record(), ReadErrorAction::Quiet);
        assert_eq!(errors.record(), ReadErrorAction::GiveUp);

        let poll = Duration::from_millis(50);
        assert_eq!(ReadErrors::new(10).backoff(poll), poll);
        assert_eq!(errors.backoff(poll), poll * 16);
        let mut long = ReadErrors::new(100);
        for _ in 0..30 {
            long.record();
        }
        assert_eq!(long.backoff(poll), poll * 16);
    }

    #[tokio::test]
    async fn crash_is_detected_without_stop() {
        let cfg = fake_instance("crash", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.start().await.unwrap();
        p.wait_settled(Duration::from_secs(5)).await;
        let pid = p.pid().await.unwrap();

        os::force_kill(pid).unwrap();
        assert!(
            eventually!(
                p.inner.state.lock().await.status == InstanceStatus::Offline
                    && !launch::pid_file(&cfg.working_dir).exists()
            )
        );
        assert_eq!(p.status().await, InstanceStatus::Offline);
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn graceful_stop() {
        let cfg = fake_instance("stop", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.start().await.unwrap();
        p.wait_settled(Duration::from_secs(5)).await;
        let pid = p.pid().await.unwrap();

        p.stop().await.unwrap();
        assert_eq!(p.status().await, InstanceStatus::Offline);
        assert!(!os::pid_alive(pid));
        assert!(!launch::pid_file(&cfg.working_dir).exists());

        // Stopping an offline instance is fine too.
        p.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_on_timeout() {
        let cfg = fake_instance("stubborn", true);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.start().await.unwrap();
        p.wait_settled(Duration::from_secs(5)).await;
        let pid = p.pid().await.unwrap();

        p.stop().await.unwrap();
        assert_eq!(p.status().await, InstanceStatus::Offline);
        assert!(!os::pid_alive(pid));
        assert!(!launch::pid_file(&cfg.working_dir).exists());
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn orphan_is_found_by_process_scan() {
        let cfg = fake_instance("orphan", false);
        let owner = ManagedProcess::new(cfg.clone(), test_settings());
        owner.start().await.unwrap();
        owner.wait_settled(Duration::from_secs(5)).await;
        let pid = owner.pid().await.unwrap();
        owner.write("join Bob").await.unwrap();
        assert!(eventually!(owner.online_players().len() == 1));

        std::fs::remove_file(launch::pid_file(&cfg.working_dir)).unwrap();

        let adopter = ManagedProcess::new(cfg.clone(), test_settings());
        assert!(adopter.recover().await);
        assert_eq!(adopter.pid().await, Some(pid));
        assert_eq!(adopter.status().await, InstanceStatus::Online);
        assert_eq!(read_pid_file(&cfg.working_dir), Some(pid));
        assert_eq!(adopter.online_players()[0].name, "Bob");

        let err = adopter.write("say hi").await.unwrap_err();
        assert_eq!(err.code(), "no_interactive_channel");
        assert!(matches!(
            adopter.kick("Bob", None).await,
            Err(SupervisorError::NoInteractiveChannel { .. })
        ));

        adopter.kill().await.unwrap();
        assert_eq!(adopter.status().await, InstanceStatus::Offline);
        assert!(eventually!(owner.status().await == InstanceStatus::Offline));
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn missing_executable_leaves_instance_offline() {
        let mut cfg = fake_instance("no-exe", false);
        cfg.executable = cfg.working_dir.join("missing.jar");
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        let err = p.start().await.unwrap_err();
        assert_eq!(err.code(), "spawn_failed");
        assert_eq!(p.status().await, InstanceStatus::Offline);
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[tokio::test]
    async fn bans_fall_back_to_file_when_offline() {
        let cfg = fake_instance("bans", false);
        let p = ManagedProcess::new(cfg.clone(), test_settings());
        p.add_ban(BanKind::Player, "Mallory", "griefing", None).await.unwrap();
        p.add_ban(BanKind::Ip, "10.0.0.7", "spam", Some("2026-12-31 23:59:59 +0000"))
            .await
            .unwrap();

        let players = p.get_bans(BanKind::Player).await.unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].reason, "griefing");
        assert_eq!(players[0].expires, bans::FOREVER);
        assert_eq!(
            p.get_bans(BanKind::Ip).await.unwrap()[0].expires,
            "2026-12-31 23:59:59 +0000"
        );

        let until = "2027-01-31 00:00:00 +0000";
        assert!(
            p.update_ban(BanKind::Player, "Mallory", "repeat griefing", Some(until))
                .await
                .unwrap()
        );
        let updated = &p.get_bans(BanKind::Player).await.unwrap()[0];
        assert_eq!(updated.reason, "repeat griefing");
        assert_eq!(updated.expires, until);
        assert!(!p.update_ban(BanKind::Player, "Nobody", "x", None).await.unwrap());

        assert!(p.remove_ban(BanKind::Ip, "10.0.0.7").await.unwrap());
        assert!(p.get_bans(BanKind::Ip).await.unwrap().is_empty());

        assert!(matches!(
            p.kick("Mallory", None).await,
            Err(SupervisorError::NotOnline { .. })
        ));
        let _ = std::fs::remove_dir_all(&cfg.working_dir);
    }

    #[test]
    fn inference_reads_last_state() {
        let dir = temp_dir_for("infer");
        let log = dir.join("latest.log");
        std::fs::write(
            &log,
            "[10:00:00] [Server thread/INFO]: Done (1.0s)! For help, type \"help\"\n\
             [10:00:10] [Server thread/INFO]: Carol joined the game\n\
             [10:00:20] [Server thread/INFO]: Dave joined the game\n\
             [10:00:30] [Server thread/INFO]: Dave left the game\n",
        )
        .unwrap();
        let (status, players) = infer_from_log_tail(&log);
        assert_eq!(status, InstanceStatus::Online);
        assert_eq!(players.count(), 1);
        assert!(players.get("Carol").is_some());

        std::fs::write(&log, "[10:00:00] Done (1.0s)!\n[10:09:00] Stopping server\n").unwrap();
        assert_eq!(infer_from_log_tail(&log).0, InstanceStatus::Stopping);
        assert_eq!(infer_from_log_tail(&dir.join("absent.log")).0, InstanceStatus::Online);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

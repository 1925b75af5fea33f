//! Thin OS layer: liveness checks, signals, orphan scans and resource sampling.

use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesized comm.
    let Ok(s) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let Some(end) = s.rfind(')') else {
        return false;
    };
    s.get(end + 1..)
        .and_then(|rest| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Reports whether `pid` refers to a running (non-zombie) process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return !is_zombie(pid);
    }
    // EPERM still means the process exists.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    sys.process(pid).is_some()
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;

    // Instances are launched with setsid(); when the pid still leads its
    // group, signal the whole group so helper children go down with it.
    let pgid = unsafe { libc::getpgid(raw) };
    let target = if pgid == raw { -raw } else { raw };

    let rc = unsafe { libc::kill(target, sig) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// SIGKILL by pid. A process that is already gone counts as success.
#[cfg(unix)]
pub fn force_kill(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

/// SIGTERM by pid; used when there is no stdin to send the shutdown command to.
#[cfg(unix)]
pub fn request_terminate(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGTERM)
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> io::Result<()> {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    if let Some(p) = sys.process(pid) {
        p.kill();
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn request_terminate(pid: u32) -> io::Result<()> {
    force_kill(pid)
}

/// Waits until `pid` is gone or `timeout` elapses. Returns true when it exited.
pub async fn wait_for_exit(pid: u32, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn canonical(p: &Path) -> PathBuf {
    std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf())
}

/// Process names are truncated by the kernel (15 bytes on Linux), so accept
/// either direction of prefix match.
fn name_matches(actual: &str, expected: &str) -> bool {
    let actual = actual.to_ascii_lowercase();
    let expected = expected.to_ascii_lowercase();
    if actual.is_empty() || expected.is_empty() {
        return false;
    }
    actual.contains(&expected) || expected.starts_with(&actual)
}

/// Scans all OS processes for one whose working directory is `working_dir`
/// and whose name matches `process_name`. The lowest matching pid wins.
pub fn find_orphan(working_dir: &Path, process_name: &str) -> anyhow::Result<Option<u32>> {
    let want = canonical(working_dir);
    let own = std::process::id();

    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cwd(UpdateKind::Always),
    );
    if sys.processes().is_empty() {
        anyhow::bail!("process table is empty (no permission to enumerate processes?)");
    }

    let mut matches: Vec<u32> = sys
        .processes()
        .values()
        .filter(|p| p.pid().as_u32() != own)
        .filter(|p| name_matches(&p.name().to_string_lossy(), process_name))
        .filter(|p| p.cwd().is_some_and(|cwd| canonical(cwd) == want))
        .map(|p| p.pid().as_u32())
        .filter(|pid| pid_alive(*pid))
        .collect();
    matches.sort_unstable();
    Ok(matches.into_iter().next())
}

/// Keeps a `System` between calls so CPU usage is computed over the interval
/// since the previous sample. The first sample of a pid reads 0% CPU.
#[derive(Default)]
pub struct ResourceSampler {
    sys: Option<System>,
}

impl ResourceSampler {
    /// Returns (cpu percent, resident memory in MiB).
    pub fn sample(&mut self, pid: u32) -> anyhow::Result<(f32, u64)> {
        let sys = self.sys.get_or_insert_with(System::new);
        let pid = Pid::from_u32(pid);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let p = sys
            .process(pid)
            .with_context(|| format!("process {} not found", pid.as_u32()))?;
        let cpu = p.cpu_usage();
        let cpu = if cpu.is_finite() { cpu.max(0.0) } else { 0.0 };
        Ok((cpu, p.memory() / (1024 * 1024)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_not_alive() {
        assert!(!pid_alive(0));
    }

    #[test]
    fn truncated_names_match() {
        assert!(name_matches("java", "java"));
        assert!(name_matches("Java.exe", "java"));
        assert!(name_matches("fake-server.sh", "fake-server.sh"));
        assert!(name_matches("a-very-long-scr", "a-very-long-script-name.sh"));
        assert!(!name_matches("python3", "java"));
        assert!(!name_matches("", "java"));
    }

    #[cfg(unix)]
    #[test]
    fn invalid_pid_is_rejected() {
        let err = force_kill(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn sampler_reads_own_memory() {
        let mut s = ResourceSampler::default();
        let (cpu, _mem) = s.sample(std::process::id()).unwrap();
        assert!(cpu >= 0.0);
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::Context;
use kiln_process::InstanceConfig;
use tokio::process::Command;

use crate::error::SupervisorError;

pub const LOGS_DIR: &str = "logs";
pub const LATEST_LOG: &str = "latest.log";
pub const CONSOLE_OUT: &str = "console.out";
pub const PID_FILE: &str = "server.pid";
const USER_JVM_ARGS: &str = "user_jvm_args.txt";
const MIN_HEAP_FLOOR_MB: u32 = 512;
// Loader installers put their generated args files under one of these.
const LOADER_MARKERS: &[&str] = &["minecraftforge", "neoforged"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    /// `java -Xmx -Xms -jar <jar> nogui`
    Jar,
    /// Installer layout: `java @user_jvm_args.txt @libraries/.../unix_args.txt nogui`
    ArgsFile,
    /// Shell script, run through `sh`.
    Script,
    /// Anything else that is directly executable.
    Native,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub kind: LaunchKind,
}

impl LaunchSpec {
    /// Name the running process is expected to have, for orphan scans.
    pub fn process_name(&self) -> String {
        Path::new(&self.exec)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.exec.clone())
    }

    pub fn display(&self) -> String {
        format!("{} {}", self.exec, self.args.join(" "))
    }
}

pub fn logs_dir(working_dir: &Path) -> PathBuf {
    working_dir.join(LOGS_DIR)
}

pub fn latest_log(working_dir: &Path) -> PathBuf {
    logs_dir(working_dir).join(LATEST_LOG)
}

pub fn pid_file(working_dir: &Path) -> PathBuf {
    working_dir.join(PID_FILE)
}

/// (max heap, min heap) in MiB. The floor never exceeds the maximum.
pub fn heap_sizes(ram_mb: u32) -> (u32, u32) {
    let max = ram_mb.max(1);
    let min = MIN_HEAP_FLOOR_MB.max(max / 2).min(max);
    (max, min)
}

fn heap_args(ram_mb: u32) -> Vec<String> {
    let (max, min) = heap_sizes(ram_mb);
    vec![format!("-Xmx{max}M"), format!("-Xms{min}M")]
}

fn collect_named_files(root: &Path, file_name: &str, out: &mut Vec<PathBuf>) {
    let rd = match fs::read_dir(root) {
        Ok(v) => v,
        Err(_) => return,
    };
    for e in rd.flatten() {
        let path = e.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            collect_named_files(&path, file_name, out);
            continue;
        }
        if meta.is_file()
            && path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|n| n == file_name)
        {
            out.push(path);
        }
    }
}

/// Shallowest path wins; ties are broken lexically so the choice is stable.
fn best_candidate(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.to_string_lossy().cmp(&b.to_string_lossy()))
    });
    candidates.into_iter().next()
}

fn find_loader_args(working_dir: &Path) -> Option<PathBuf> {
    let name = if cfg!(windows) {
        "win_args.txt"
    } else {
        "unix_args.txt"
    };
    let mut out = Vec::new();
    collect_named_files(&working_dir.join("libraries"), name, &mut out);
    out.retain(|p| {
        let s = p.to_string_lossy();
        LOADER_MARKERS.iter().any(|m| s.contains(m))
    });
    best_candidate(out)
}

fn to_rel_str(base: &Path, path: &Path) -> anyhow::Result<String> {
    let rel = path
        .strip_prefix(base)
        .map_err(|_| anyhow::anyhow!("path is outside the working directory"))?;
    let s = rel.to_string_lossy().to_string();
    if s.trim().is_empty() {
        anyhow::bail!("invalid relative path");
    }
    Ok(s)
}

fn has_installer_layout(working_dir: &Path) -> bool {
    working_dir.join(USER_JVM_ARGS).is_file()
        && (working_dir.join("run.sh").is_file() || working_dir.join("run.bat").is_file())
}

/// Replaces any heap flags in `user_jvm_args.txt` with the configured ones.
fn rewrite_user_jvm_args(working_dir: &Path, ram_mb: u32) -> anyhow::Result<()> {
    let path = working_dir.join(USER_JVM_ARGS);
    let current =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

    let mut out = String::new();
    for line in current.lines() {
        let t = line.trim_start();
        if t.starts_with("-Xmx") || t.starts_with("-Xms") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    for arg in heap_args(ram_mb) {
        out.push_str(&arg);
        out.push('\n');
    }

    let tmp = path.with_extension("txt.tmp");
    fs::write(&tmp, out.as_bytes()).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
    Ok(())
}

fn jar_spec(cfg: &InstanceConfig, java_bin: &str) -> LaunchSpec {
    let mut args = heap_args(cfg.ram_mb);
    args.push("-jar".to_string());
    args.push(cfg.executable.to_string_lossy().to_string());
    args.push("nogui".to_string());
    LaunchSpec {
        exec: java_bin.to_string(),
        args,
        kind: LaunchKind::Jar,
    }
}

fn has_ext(p: &Path, ext: &str) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Decides how to start `cfg`. Fails when the working directory or the
/// executable is missing.
pub fn resolve_launch_spec(cfg: &InstanceConfig, java_bin: &str) -> Result<LaunchSpec, SupervisorError> {
    let dir = &cfg.working_dir;
    if !dir.is_dir() {
        return Err(SupervisorError::launch(
            &cfg.name,
            format!("working directory {} does not exist", dir.display()),
        ));
    }
    if !cfg.executable.is_file() {
        return Err(SupervisorError::launch(
            &cfg.name,
            format!("executable {} does not exist", cfg.executable.display()),
        ));
    }

    if has_installer_layout(dir) {
        match find_loader_args(dir) {
            Some(args_file) => {
                let rel = to_rel_str(dir, &args_file)
                    .map_err(|e| SupervisorError::launch(&cfg.name, e.to_string()))?;
                if let Err(err) = rewrite_user_jvm_args(dir, cfg.ram_mb) {
                    tracing::warn!(instance = %cfg.name, %err, "could not update user_jvm_args.txt");
                }
                return Ok(LaunchSpec {
                    exec: java_bin.to_string(),
                    args: vec![
                        format!("@{USER_JVM_ARGS}"),
                        format!("@{rel}"),
                        "nogui".to_string(),
                    ],
                    kind: LaunchKind::ArgsFile,
                });
            }
            None => {
                tracing::warn!(
                    instance = %cfg.name,
                    "installer layout without a loader args file; falling back to jar launch"
                );
            }
        }
    }

    let exe = &cfg.executable;
    if has_ext(exe, "jar") {
        return Ok(jar_spec(cfg, java_bin));
    }
    if has_ext(exe, "sh") {
        return Ok(LaunchSpec {
            exec: "sh".to_string(),
            args: vec![exe.to_string_lossy().to_string()],
            kind: LaunchKind::Script,
        });
    }
    if has_installer_layout(dir) {
        return Err(SupervisorError::launch(
            &cfg.name,
            "installer layout is incomplete and the executable is not a jar",
        ));
    }
    Ok(LaunchSpec {
        exec: exe.to_string_lossy().to_string(),
        args: Vec::new(),
        kind: LaunchKind::Native,
    })
}

/// Process name a running instance of `cfg` would have, without touching any
/// files. Used by the orphan scan.
pub fn expected_process_name(cfg: &InstanceConfig, java_bin: &str) -> String {
    let exe = &cfg.executable;
    let exec = if has_ext(exe, "jar") || has_installer_layout(&cfg.working_dir) {
        java_bin.to_string()
    } else if has_ext(exe, "sh") {
        "sh".to_string()
    } else {
        exe.to_string_lossy().to_string()
    };
    LaunchSpec {
        exec,
        args: Vec::new(),
        kind: LaunchKind::Native,
    }
    .process_name()
}

/// Moves an existing `latest.log` aside so a new run never sees the previous
/// run's terminal lines.
pub fn rotate_latest_log(working_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let latest = latest_log(working_dir);
    if !latest.exists() {
        return Ok(None);
    }
    let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    let logs = logs_dir(working_dir);
    let mut target = logs.join(format!("latest-{stamp}.log"));
    let mut n = 1;
    while target.exists() {
        target = logs.join(format!("latest-{stamp}-{n}.log"));
        n += 1;
    }
    fs::rename(&latest, &target)
        .with_context(|| format!("rotate {} to {}", latest.display(), target.display()))?;
    Ok(Some(target))
}

/// Builds the child command. stdout/stderr go to `logs/console.out`; the
/// server writes its own `latest.log`, which is what gets tailed.
pub fn build_command(spec: &LaunchSpec, working_dir: &Path) -> anyhow::Result<Command> {
    let logs = logs_dir(working_dir);
    fs::create_dir_all(&logs).with_context(|| format!("create {}", logs.display()))?;
    let console = logs.join(CONSOLE_OUT);
    let out = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&console)
        .with_context(|| format!("open {}", console.display()))?;
    let err = out
        .try_clone()
        .with_context(|| format!("clone {}", console.display()))?;

    let mut cmd = Command::new(&spec.exec);
    cmd.current_dir(working_dir)
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .kill_on_drop(false);

    // Own session: the server outlives a supervisor restart and is re-attached.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir_for(test_name: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut dir = std::env::temp_dir();
        dir.push(format!("kiln-launch-{test_name}-{}-{n}-{ts}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(dir: &Path, exe: &str, ram_mb: u32) -> InstanceConfig {
        InstanceConfig {
            name: "survival".to_string(),
            ram_mb,
            executable: dir.join(exe),
            working_dir: dir.to_path_buf(),
            port: 25565,
        }
    }

    #[test]
    fn heap_floor_is_half_or_512() {
        assert_eq!(heap_sizes(4096), (4096, 2048));
        assert_eq!(heap_sizes(800), (800, 512));
        assert_eq!(heap_sizes(256), (256, 256));
    }

    #[test]
    fn jar_layout() {
        let dir = temp_dir_for("jar");
        fs::write(dir.join("server.jar"), b"").unwrap();
        let cfg = config(&dir, "server.jar", 2048);
        let spec = resolve_launch_spec(&cfg, "java").unwrap();
        assert_eq!(spec.kind, LaunchKind::Jar);
        assert_eq!(spec.exec, "java");
        assert_eq!(spec.args[0], "-Xmx2048M");
        assert_eq!(spec.args[1], "-Xms1024M");
        assert_eq!(spec.args[2], "-jar");
        assert_eq!(spec.args.last().map(String::as_str), Some("nogui"));
        assert_eq!(spec.process_name(), "java");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_executable_is_a_launch_error() {
        let dir = temp_dir_for("missing-exe");
        let cfg = config(&dir, "server.jar", 1024);
        let err = resolve_launch_spec(&cfg, "java").unwrap_err();
        assert_eq!(err.code(), "spawn_failed");

        let mut cfg = cfg;
        cfg.working_dir = dir.join("nope");
        assert!(resolve_launch_spec(&cfg, "java").is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn installer_layout_uses_args_files() {
        let dir = temp_dir_for("installer");
        fs::write(dir.join("run.sh"), b"#!/bin/sh\n").unwrap();
        fs::write(dir.join("user_jvm_args.txt"), "# comment\n-Xmx1G\n-XX:+UseG1GC\n").unwrap();
        let args_dir = dir.join("libraries/net/minecraftforge/forge/1.20.1-47.2.0");
        fs::create_dir_all(&args_dir).unwrap();
        fs::write(args_dir.join(if cfg!(windows) { "win_args.txt" } else { "unix_args.txt" }), b"").unwrap();

        let cfg = config(&dir, "run.sh", 3000);
        let spec = resolve_launch_spec(&cfg, "java").unwrap();
        assert_eq!(spec.kind, LaunchKind::ArgsFile);
        assert_eq!(spec.args[0], "@user_jvm_args.txt");
        assert!(spec.args[1].starts_with("@libraries/net/minecraftforge/"));
        assert_eq!(spec.args[2], "nogui");

        let jvm = fs::read_to_string(dir.join("user_jvm_args.txt")).unwrap();
        assert!(jvm.contains("-XX:+UseG1GC"));
        assert!(jvm.contains("-Xmx3000M"));
        assert!(jvm.contains("-Xms1500M"));
        assert!(!jvm.contains("-Xmx1G"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn installer_without_args_falls_back_to_jar() {
        let dir = temp_dir_for("fallback");
        fs::write(dir.join("run.sh"), b"").unwrap();
        fs::write(dir.join("user_jvm_args.txt"), b"").unwrap();
        fs::write(dir.join("forge-server.jar"), b"").unwrap();
        let cfg = config(&dir, "forge-server.jar", 1024);
        let spec = resolve_launch_spec(&cfg, "java").unwrap();
        assert_eq!(spec.kind, LaunchKind::Jar);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn scripts_run_through_sh() {
        let dir = temp_dir_for("script");
        fs::write(dir.join("start.sh"), b"").unwrap();
        let spec = resolve_launch_spec(&config(&dir, "start.sh", 1024), "java").unwrap();
        assert_eq!(spec.kind, LaunchKind::Script);
        assert_eq!(spec.exec, "sh");
        assert_eq!(spec.process_name(), "sh");

        fs::write(dir.join("bedrock_server"), b"").unwrap();
        let spec = resolve_launch_spec(&config(&dir, "bedrock_server", 1024), "java").unwrap();
        assert_eq!(spec.kind, LaunchKind::Native);
        assert_eq!(spec.process_name(), "bedrock_server");
        assert_eq!(
            expected_process_name(&config(&dir, "bedrock_server", 1024), "java"),
            "bedrock_server"
        );
        assert_eq!(expected_process_name(&config(&dir, "start.sh", 1024), "java"), "sh");
        assert_eq!(
            expected_process_name(&config(&dir, "server.jar", 1024), "/opt/jdk/bin/java"),
            "java"
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rotation_moves_previous_log_aside() {
        let dir = temp_dir_for("rotate");
        assert!(rotate_latest_log(&dir).unwrap().is_none());

        fs::create_dir_all(logs_dir(&dir)).unwrap();
        fs::write(latest_log(&dir), "[10:00:00] Stopping server\n").unwrap();
        let first = rotate_latest_log(&dir).unwrap().unwrap();
        assert!(!latest_log(&dir).exists());
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("latest-"));

        fs::write(latest_log(&dir), "again\n").unwrap();
        let second = rotate_latest_log(&dir).unwrap().unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        let _ = fs::remove_dir_all(&dir);
    }
}

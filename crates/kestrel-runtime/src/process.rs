use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use kestrel_observability::{emit_event, ObservabilityEvent, ProcessKind};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use crate::PathGuard;

const META_FILE: &str = "meta.json";
const STDOUT_FILE: &str = "stdout.log";
const STDERR_FILE: &str = "stderr.log";
const DENIED_COMMANDS: [&str; 3] = ["sudo", "su", "passwd"];
const SHELLS: [&str; 4] = ["sh", "bash", "zsh", "dash"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Exited,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Exited | JobStatus::Failed | JobStatus::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Exited => "exited",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
        }
    }
}

/// Persisted record of one background job (`<jobs_root>/<id>/meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessJob {
    pub id: String,
    pub command: Vec<String>,
    pub workdir: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "stdout" | "out" => Some(LogStream::Stdout),
            "stderr" | "err" => Some(LogStream::Stderr),
            _ => None,
        }
    }
}

struct LiveJob {
    kill: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Spawns, tracks and tails long-running jobs.
///
/// Reapers run on their own tasks and never observe a turn's cancellation;
/// only [`ProcessSupervisor::kill`] stops a job. The live-handle map is the
/// only lock this type takes.
#[derive(Clone)]
pub struct ProcessSupervisor {
    guard: PathGuard,
    jobs_root: PathBuf,
    bin_dir: Option<PathBuf>,
    live: Arc<Mutex<HashMap<String, LiveJob>>>,
}

impl ProcessSupervisor {
    pub fn new(guard: PathGuard, jobs_root: impl Into<PathBuf>, bin_dir: Option<PathBuf>) -> Self {
        Self {
            guard,
            jobs_root: jobs_root.into(),
            bin_dir,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }

    pub async fn start(
        &self,
        command: Vec<String>,
        workdir: Option<&str>,
    ) -> anyhow::Result<ProcessJob> {
        let Some(program) = command.first().filter(|p| !p.trim().is_empty()) else {
            anyhow::bail!("command must not be empty");
        };
        if let Some(denied) = denied_command(&command) {
            anyhow::bail!("`{denied}` is interactive and cannot run as a background job");
        }
        let workdir = self.guard.resolve(workdir.unwrap_or(""))?;

        let id = new_job_id();
        let job_dir = self.jobs_root.join(&id);
        fs::create_dir_all(&job_dir)
            .await
            .with_context(|| format!("creating job directory {}", job_dir.display()))?;
        let stdout_path = job_dir.join(STDOUT_FILE);
        let stderr_path = job_dir.join(STDERR_FILE);
        let stdout_file = fs::File::create(&stdout_path).await?.into_std().await;
        let stderr_file = fs::File::create(&stderr_path).await?.into_std().await;

        let mut job = ProcessJob {
            id: id.clone(),
            command: command.clone(),
            workdir: workdir.display().to_string(),
            status: JobStatus::Starting,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            error: None,
            pid: None,
            stdout: stdout_path.display().to_string(),
            stderr: stderr_path.display().to_string(),
        };
        // Written before launch so a crash mid-spawn still leaves a record.
        write_meta(&job_dir, &job).await?;

        let mut cmd = Command::new(program);
        cmd.args(&command[1..])
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));
        if let Some(path) = self.extended_path() {
            cmd.env("PATH", path);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                job.status = JobStatus::Failed;
                job.error = Some(format!("spawn failed: {err}"));
                job.ended_at = Some(Utc::now());
                write_meta(&job_dir, &job).await?;
                emit_job_event(&job, "job.spawn_failed", Level::WARN);
                return Ok(job);
            }
        };
        drop(cmd);

        let kill = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        // Registered before the record says `running`, so `get` never
        // mistakes a fresh job for an orphan.
        self.live.lock().await.insert(
            id.clone(),
            LiveJob {
                kill: kill.clone(),
                done: done_rx,
            },
        );

        job.pid = child.id();
        job.status = JobStatus::Running;
        write_meta(&job_dir, &job).await?;
        emit_job_event(&job, "job.start", Level::INFO);

        let live = self.live.clone();
        let reaped = job.clone();
        tokio::spawn(async move {
            reap(child, reaped, job_dir, kill, live, done_tx).await;
        });

        Ok(job)
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<ProcessJob> {
        let dir = self.job_dir(id)?;
        let job = read_meta(&dir).await?;
        self.reconcile(&dir, job).await
    }

    /// All recorded jobs, newest first.
    pub async fn list(&self) -> anyhow::Result<Vec<ProcessJob>> {
        let mut jobs = Vec::new();
        let mut entries = match fs::read_dir(&self.jobs_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(jobs),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dir = entry.path();
            let job = match read_meta(&dir).await {
                Ok(job) => self.reconcile(&dir, job).await,
                Err(err) => Err(err),
            };
            match job {
                Ok(job) => jobs.push(job),
                Err(err) => tracing::debug!("skipping job dir {}: {err}", entry.path().display()),
            }
        }
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }

    /// Last `tail` lines of one stream, then narrowed to lines containing
    /// `filter` when given.
    pub async fn logs(
        &self,
        id: &str,
        stream: LogStream,
        tail: usize,
        filter: Option<&str>,
    ) -> anyhow::Result<String> {
        let dir = self.job_dir(id)?;
        let file = match stream {
            LogStream::Stdout => STDOUT_FILE,
            LogStream::Stderr => STDERR_FILE,
        };
        let raw = fs::read(dir.join(file))
            .await
            .with_context(|| format!("no logs for job `{id}`"))?;
        let text = String::from_utf8_lossy(&raw);
        let lines = text.lines().collect::<Vec<_>>();
        let start = lines.len().saturating_sub(tail);
        let kept = lines[start..]
            .iter()
            .filter(|line| match filter {
                Some(needle) if !needle.is_empty() => line.contains(needle),
                _ => true,
            })
            .copied()
            .collect::<Vec<_>>();
        Ok(kept.join("\n"))
    }

    /// Signals a running job.
    ///
    /// Jobs started by this supervisor are stopped through their reaper.
    /// Jobs started by another process are signalled through the recorded
    /// pid and marked `Killed` here.
    pub async fn kill(&self, id: &str) -> anyhow::Result<()> {
        let token = {
            let live = self.live.lock().await;
            live.get(id).map(|job| job.kill.clone())
        };
        if let Some(token) = token {
            token.cancel();
            return Ok(());
        }

        let dir = self.job_dir(id)?;
        let mut job = self.get(id).await?;
        let pid = match (job.status, job.pid) {
            (JobStatus::Running, Some(pid)) => pid,
            (status, _) => {
                anyhow::bail!("job `{id}` is not running (status: {})", status.as_str())
            }
        };
        // Recorded first: a reaper elsewhere reads it once the signal lands.
        let previous = job.clone();
        job.status = JobStatus::Killed;
        job.ended_at = Some(Utc::now());
        write_meta(&dir, &job).await?;
        if let Err(err) = signal_terminate(pid) {
            write_meta(&dir, &previous).await?;
            return Err(anyhow::Error::new(err)
                .context(format!("signalling job `{id}` (pid {pid})")));
        }
        emit_job_event(&job, "job.exit", Level::INFO);
        Ok(())
    }

    /// Resolves once the job's reaper has recorded a terminal state.
    pub async fn wait(&self, id: &str) -> anyhow::Result<ProcessJob> {
        let done = {
            let live = self.live.lock().await;
            live.get(id).map(|job| job.done.clone())
        };
        if let Some(mut done) = done {
            // A dropped sender means the reaper finished; the record is final.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get(id).await
    }

    /// Marks a `running` record whose process is gone and which no reaper
    /// in this process watches. Its exit code is unknown.
    async fn reconcile(&self, dir: &Path, mut job: ProcessJob) -> anyhow::Result<ProcessJob> {
        let Some(pid) = job.pid else {
            return Ok(job);
        };
        if job.status != JobStatus::Running || pid_alive(pid) {
            return Ok(job);
        }
        if self.live.lock().await.contains_key(&job.id) {
            return Ok(job);
        }
        job.status = JobStatus::Failed;
        job.ended_at = Some(Utc::now());
        job.error = Some("process exited while no supervisor was watching it".to_string());
        write_meta(dir, &job).await?;
        emit_job_event(&job, "job.orphaned", Level::WARN);
        Ok(job)
    }

    fn job_dir(&self, id: &str) -> anyhow::Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            anyhow::bail!("invalid job id `{id}`");
        }
        Ok(self.jobs_root.join(id))
    }

    fn extended_path(&self) -> Option<std::ffi::OsString> {
        let bin_dir = self.bin_dir.as_ref()?;
        let mut paths = vec![bin_dir.clone()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).ok()
    }
}

async fn reap(
    mut child: Child,
    mut job: ProcessJob,
    job_dir: PathBuf,
    kill: CancellationToken,
    live: Arc<Mutex<HashMap<String, LiveJob>>>,
    done: watch::Sender<bool>,
) {
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                tracing::warn!("failed to signal job {}: {err}", job.id);
            }
            (child.wait().await, true)
        }
    };
    drop(child);

    // Another process may have signalled the job and recorded the kill.
    let killed = killed
        || read_meta(&job_dir)
            .await
            .is_ok_and(|recorded| recorded.status == JobStatus::Killed);

    job.ended_at = Some(Utc::now());
    match status {
        Ok(status) => {
            job.exit_code = status.code();
            job.status = if killed {
                JobStatus::Killed
            } else {
                match status.code() {
                    Some(0) => JobStatus::Exited,
                    Some(_) => JobStatus::Failed,
                    None => {
                        job.error = Some(signal_description(&status));
                        JobStatus::Failed
                    }
                }
            };
        }
        Err(err) => {
            job.status = JobStatus::Failed;
            job.error = Some(format!("wait failed: {err}"));
        }
    }

    if let Err(err) = write_meta(&job_dir, &job).await {
        tracing::error!("failed to record exit of job {}: {err}", job.id);
    }
    emit_job_event(&job, "job.exit", Level::INFO);
    live.lock().await.remove(&job.id);
    let _ = done.send(true);
}

#[cfg(unix)]
fn signal_description(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => "terminated without exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_description(_status: &std::process::ExitStatus) -> String {
    "terminated without exit code".to_string()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM means it exists under another user.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "jobs started by another process cannot be signalled on this platform",
    ))
}

fn emit_job_event(job: &ProcessJob, event: &str, level: Level) {
    let detail = format!(
        "id={} status={} exit_code={:?} command={}",
        job.id,
        job.status.as_str(),
        job.exit_code,
        job.command.join(" ")
    );
    emit_event(
        level,
        ProcessKind::Engine,
        ObservabilityEvent {
            event,
            component: "runtime.process",
            status: Some(job.status.as_str()),
            error_code: job.error.as_deref().map(|_| "JOB_FAILED"),
            detail: Some(&detail),
            ..Default::default()
        },
    );
}

async fn write_meta(job_dir: &Path, job: &ProcessJob) -> anyhow::Result<()> {
    let tmp = job_dir.join(format!("{META_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec_pretty(job)?).await?;
    fs::rename(&tmp, job_dir.join(META_FILE)).await?;
    Ok(())
}

async fn read_meta(job_dir: &Path) -> anyhow::Result<ProcessJob> {
    let path = job_dir.join(META_FILE);
    let raw = fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&raw)?)
}

fn new_job_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S%3f"), &suffix[..8])
}

/// First interactive program the command would run, looking through a
/// leading `sh -c` wrapper.
fn denied_command(command: &[String]) -> Option<String> {
    let program = basename(command.first()?);
    if DENIED_COMMANDS.contains(&program.as_str()) {
        return Some(program);
    }
    if SHELLS.contains(&program.as_str()) {
        let script_idx = command.iter().position(|arg| arg == "-c" || arg == "-lc")? + 1;
        let first_word = command.get(script_idx)?.split_whitespace().next()?;
        let first_word = basename(first_word);
        if DENIED_COMMANDS.contains(&first_word.as_str()) {
            return Some(first_word);
        }
    }
    None
}

fn basename(raw: &str) -> String {
    Path::new(raw)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn deny_list_catches_direct_and_wrapped_commands() {
        assert_eq!(denied_command(&args(&["sudo", "ls"])).as_deref(), Some("sudo"));
        assert_eq!(denied_command(&args(&["/usr/bin/passwd"])).as_deref(), Some("passwd"));
        assert_eq!(
            denied_command(&args(&["sh", "-c", "su root -c id"])).as_deref(),
            Some("su")
        );
        assert_eq!(denied_command(&args(&["cargo", "build"])), None);
        assert_eq!(denied_command(&args(&["sh", "-c", "echo sudo"])), None);
    }

    #[test]
    fn job_ids_are_unique_and_path_safe() {
        let a = new_job_id();
        let b = new_job_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn log_stream_parse_defaults_to_stdout() {
        assert_eq!(LogStream::parse(""), Some(LogStream::Stdout));
        assert_eq!(LogStream::parse("STDERR"), Some(LogStream::Stderr));
        assert_eq!(LogStream::parse("both"), None);
    }
}

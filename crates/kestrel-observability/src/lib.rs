use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing_appender::non_blocking::WorkerGuard;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub session_id: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub tool: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

macro_rules! obs_record {
    ($level:expr, $process:expr, $record:expr) => {
        tracing::event!(
            target: "kestrel.obs",
            $level,
            process = $process.as_str(),
            component = $record.component,
            event = $record.event,
            session_id = $record.session_id.unwrap_or(""),
            provider_id = $record.provider_id.unwrap_or(""),
            model_id = $record.model_id.unwrap_or(""),
            tool = $record.tool.unwrap_or(""),
            status = $record.status.unwrap_or(""),
            error_code = $record.error_code.unwrap_or(""),
            detail = $record.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

/// Emits one structured record under the `kestrel.obs` target. Levels below
/// INFO are raised to INFO.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    if level == Level::ERROR {
        obs_record!(Level::ERROR, process, event);
    } else if level == Level::WARN {
        obs_record!(Level::WARN, process, event);
    } else {
        obs_record!(Level::INFO, process, event);
    }
}

/// Installs the global subscriber: compact console output on stderr plus a
/// daily-rotated JSONL file under `logs_dir`. The returned guard must be held
/// for the life of the process or buffered file records are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(format!("kestrel.{}", process.as_str()))
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // stdout carries the event stream, so console logs go to stderr.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: format!("kestrel.{}", process.as_str()),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("kestrel.{process}.");

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let expired = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| log_file_day(name, &prefix))
            .is_some_and(|day| day < cutoff);
        if expired {
            if let Err(err) = fs::remove_file(&path) {
                tracing::debug!("could not remove expired log {}: {err}", path.display());
            }
        }
    }
    Ok(())
}

/// Day encoded in `kestrel.<process>.YYYY-MM-DD.jsonl`.
fn log_file_day(name: &str, prefix: &str) -> Option<DateTime<Utc>> {
    let date = name.strip_prefix(prefix)?.strip_suffix(".jsonl")?;
    let midnight = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc))
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/kestrel");
        assert_eq!(
            canonical_logs_dir_from_root(&root),
            PathBuf::from("/tmp/kestrel").join("logs")
        );
    }

    #[test]
    fn cleanup_removes_only_expired_files_for_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("kestrel.engine.2001-01-01.jsonl");
        let other = dir.path().join("kestrel.cli.2001-01-01.jsonl");
        let today = dir
            .path()
            .join(format!("kestrel.engine.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        for path in [&old, &other, &today] {
            fs::write(path, "{}\n").expect("seed log");
        }

        cleanup_old_jsonl(dir.path(), "engine", 14).expect("cleanup");

        assert!(!old.exists());
        assert!(other.exists());
        assert!(today.exists());
    }
}

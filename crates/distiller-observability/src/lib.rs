use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

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

    fn log_prefix(self) -> String {
        format!("distiller.{}", self.as_str())
    }
}

/// One structured lifecycle event. Unset fields are logged as empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub job_id: Option<&'a str>,
    /// 1-based turn number.
    pub turn: Option<usize>,
    pub attempt: Option<u32>,
    pub provider_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Length and hash only, so prompts and keys never reach the logs.
pub fn redact_text(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    trimmed.hash(&mut hasher);
    format!("[redacted len={} hash={:016x}]", trimmed.len(), hasher.finish())
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    // Callsite levels must be static, hence one expansion per level.
    macro_rules! log_at {
        ($macro:ident) => {
            tracing::$macro!(
                target: "distiller.obs",
                process = process.as_str(),
                component = event.component,
                event = event.event,
                job_id = event.job_id.unwrap_or(""),
                turn = event.turn.unwrap_or(0) as u64,
                attempt = event.attempt.unwrap_or(0),
                provider_id = event.provider_id.unwrap_or(""),
                model_id = event.model_id.unwrap_or(""),
                status = event.status.unwrap_or(""),
                error_code = event.error_code.unwrap_or(""),
                detail = event.detail.unwrap_or(""),
                "observability_event"
            )
        };
    }
    match level {
        Level::ERROR => log_at!(error),
        Level::WARN => log_at!(warn),
        Level::DEBUG | Level::TRACE => log_at!(debug),
        _ => log_at!(info),
    }
}

/// Installs the console (stderr) and daily JSONL file layers. The returned
/// guard must live as long as the process writes logs.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(logs_dir)?;
    prune_expired_logs(logs_dir, process, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(process.log_prefix())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    // stdout carries the document itself, so diagnostics go to stderr.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    tracing::info!(
        process = process.as_str(),
        logs_dir = %logs_dir.display(),
        retention_days,
        "logging initialized"
    );
    Ok(guard)
}

/// Removes `distiller.<process>.YYYY-MM-DD.jsonl` files older than the
/// retention window. Other processes' files and unknown names are kept.
fn prune_expired_logs(logs_dir: &Path, process: ProcessKind, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", process.log_prefix());

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".jsonl"))
            .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if date < cutoff && path.is_file() {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let redacted = redact_text("AIzaSy-very-secret");
        assert!(redacted.starts_with("[redacted len=18 hash="));
        assert!(!redacted.contains("secret"));
        assert_eq!(redact_text("   "), "");
        assert_eq!(redact_text(" same "), redact_text("same"));
    }

    #[test]
    fn pruning_removes_only_expired_files_for_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("distiller.cli.2001-01-01.jsonl");
        let other_process = dir.path().join("distiller.engine.2001-01-01.jsonl");
        let unrelated = dir.path().join("distiller.cli.notes.jsonl");
        let today = dir
            .path()
            .join(format!("distiller.cli.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        for path in [&old, &other_process, &unrelated, &today] {
            fs::write(path, "{}").expect("write");
        }

        prune_expired_logs(dir.path(), ProcessKind::Cli, 14).expect("prune");

        assert!(!old.exists());
        assert!(other_process.exists());
        assert!(unrelated.exists());
        assert!(today.exists());
    }
}

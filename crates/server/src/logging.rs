//! Server log output: one file under the data dir, JSON by default.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Everything the environment can say about logging, resolved once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub format: LogFormat,
    pub filter: String,
    pub truncate_on_start: bool,
    pub run_id: String,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let format = match var("TETHER_SERVER_LOG_FORMAT") {
            Some(value) if value.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        let filter = var("TETHER_SERVER_LOG_FILTER")
            .or_else(|| var("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let run_id = var("TETHER_SERVER_RUN_ID").unwrap_or_else(|| {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis())
                .unwrap_or(0);
            format!("pid-{}-{millis}", std::process::id())
        });
        Self {
            format,
            filter,
            truncate_on_start: var("TETHER_TRUNCATE_SERVER_LOG_ON_START").as_deref() == Some("1"),
            run_id,
        }
    }
}

/// Hold for the life of the process; dropping it stops the file writer.
pub struct LoggingHandle {
    pub run_id: String,
    pub log_path: PathBuf,
    pub guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    let settings = LogSettings::from_env();
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);
    if settings.truncate_on_start {
        std::fs::File::create(&log_path)?;
    }

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        log_dir, LOG_FILE,
    ));
    install(&settings, writer)?;

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = ?settings.format,
        filter = %settings.filter,
        run_id = %settings.run_id,
    );

    Ok(LoggingHandle {
        run_id: settings.run_id,
        log_path,
        guard,
    })
}

fn install(settings: &LogSettings, writer: NonBlocking) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_new(&settings.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let base = fmt::layer()
        .with_writer(writer)
        .with_file(true)
        .with_line_number(true)
        .with_target(true);
    let registry = tracing_subscriber::registry().with(filter);
    match settings.format {
        LogFormat::Pretty => registry.with(base.with_ansi(false).pretty()).try_init()?,
        LogFormat::Json => registry
            .with(base.json().flatten_event(true).with_current_span(true))
            .try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_json_and_default_filter() {
        let s = settings(&[]);
        assert_eq!(s.format, LogFormat::Json);
        assert_eq!(s.filter, DEFAULT_FILTER);
        assert!(!s.truncate_on_start);
        assert!(s.run_id.starts_with("pid-"));
    }

    #[test]
    fn server_filter_wins_over_rust_log() {
        let s = settings(&[
            ("RUST_LOG", "debug"),
            ("TETHER_SERVER_LOG_FILTER", "tether_server=trace"),
            ("TETHER_SERVER_LOG_FORMAT", "Pretty"),
            ("TETHER_TRUNCATE_SERVER_LOG_ON_START", "1"),
            ("TETHER_SERVER_RUN_ID", "run-7"),
        ]);
        assert_eq!(s.filter, "tether_server=trace");
        assert_eq!(s.format, LogFormat::Pretty);
        assert!(s.truncate_on_start);
        assert_eq!(s.run_id, "run-7");

        assert_eq!(settings(&[("RUST_LOG", "debug")]).filter, "debug");
    }
}

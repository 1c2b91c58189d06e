use std::path::Path;

use anyhow::Context;
use once_cell::sync::OnceCell;
use time::format_description::well_known::Rfc3339;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "PLANTKEEPER_LOG";
pub const DEFAULT_FILTER: &str = "plantkeeper=info,sqlx=warn";
pub const LOG_FILE_PREFIX: &str = "plantkeeper.log";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Install the global subscriber: JSON lines on stderr, plus a daily-rolling
/// file under `log_dir` when one is given. Calling it twice is harmless.
pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let _ = tracing_log::LogTracer::init();
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::new(Rfc3339))
        .with_writer(std::io::stderr);

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_ansi(false)
                    .with_timer(UtcTime::new(Rfc3339))
                    .with_writer(writer),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub const LOG_DIR: &str = "logs";

/// Install stderr plus daily-rolling file logging.
///
/// stdout stays clean so worker processes can hand their report back on it.
/// The returned guard flushes the file writer on drop and must outlive `main`'s work.
pub fn init(log_dir: &Path, file_prefix: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let (file_writer, guard) = non_blocking(rolling::daily(log_dir, file_prefix));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx::query=warn,chromiumoxide=warn,hyper=warn"));

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()?;
    Ok(guard)
}

/// Logging configuration and initialization
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// In development mode (debug builds), logs are written to both console and
/// file. In production mode (release builds), logs are written to file only.
///
/// Log file location: `{data_dir}/logs/`, rotated daily. The returned guard
/// must be kept alive for the lifetime of the process; dropping it stops
/// the background log writer.
pub fn init_logger(data_dir: &Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = get_log_directory(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "galleon.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    #[cfg(debug_assertions)]
    let log_level = "debug";

    #[cfg(not(debug_assertions))]
    let log_level = "info";

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    #[cfg(debug_assertions)]
    {
        // Development: Console + File
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(fmt::layer().with_writer(non_blocking_file).with_ansi(false))
            .init();
    }

    #[cfg(not(debug_assertions))]
    {
        // Production: File only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking_file).with_ansi(false))
            .init();
    }

    tracing::info!("Logger initialized - log directory: {}", log_dir.display());
    Ok(guard)
}

fn get_log_directory(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

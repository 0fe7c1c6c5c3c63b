use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the process-wide subscriber: console output on stderr, filtered by
/// `RUST_LOG` (default `info`), plus a rolling plain-text file under
/// `BATCHWISE_LOG_DIR` when that is set. Calling it twice is a no-op.
pub fn init() {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());
    let registry = tracing_subscriber::registry().with(console);

    let Some(dir) = std::env::var("BATCHWISE_LOG_DIR")
        .ok()
        .filter(|d| !d.trim().is_empty())
    else {
        let _ = registry.try_init();
        return;
    };

    let prefix = std::env::var("BATCHWISE_LOG_PREFIX").unwrap_or_else(|_| "batchwise".into());
    let rotation = std::env::var("BATCHWISE_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
    if std::fs::create_dir_all(&dir).is_err() {
        eprintln!("batchwise: failed to create log directory {dir}");
    }
    let writer = match rotation.to_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
        "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
        "never" => tracing_appender::rolling::never(&dir, &prefix),
        _ => tracing_appender::rolling::daily(&dir, &prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(env_filter());
    let _ = registry.with(file_layer).try_init();
}

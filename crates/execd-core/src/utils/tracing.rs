use chrono::Local;
use std::io;
use std::path::Path;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

pub const DEFAULT_FILTER: &str = "info,execd=debug";

/// Initialize tracing. The filter comes from RUST_LOG, falling back to
/// `default_filter` (or [`DEFAULT_FILTER`]).
///
/// With a `log_dir`, logs go to a timestamp-named file in that directory;
/// otherwise they go to stderr so stdout stays free for program output.
pub fn init_tracing(log_dir: Option<&Path>, default_filter: Option<&str>) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or(DEFAULT_FILTER)))
        .map_err(io::Error::other)?;

    if let Some(log_dir) = log_dir {
        std::fs::create_dir_all(log_dir)?;

        let file_name = format!("{}.log", Local::now().format("%Y%m%d_%H%M%S"));
        let file_appender = rolling::never(log_dir, &file_name);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

        tracing::debug!(
            target: "execd::utils::tracing",
            path = %log_dir.join(&file_name).display(),
            "Tracing initialized with file output"
        );
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::default()
                    .with_writer(io::stderr)
                    .with_target(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

        tracing::debug!(
            target: "execd::utils::tracing",
            "Tracing initialized with stderr output"
        );
    }

    Ok(())
}

//! Structured, layered logging setup (SPEC_FULL "Ambient Stack: Logging"),
//! grounded directly on `goose-server/src/logging.rs`: a detailed file layer
//! plus a pretty console layer, both filtered by `EnvFilter`, composed onto
//! one `tracing_subscriber::Registry`. The otlp/langfuse exporter layers
//! that file also builds are left out — no tracing-backend requirement is
//! in scope here — but the file+console layering mechanism itself is kept
//! regardless, per "ambient concerns survive Non-goals."

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::rolling::Rotation;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

fn log_directory() -> Result<PathBuf> {
    let dir = PathBuf::from("logs");
    std::fs::create_dir_all(&dir).context("failed to create log directory")?;
    Ok(dir)
}

/// Installs the global subscriber. `name` is folded into the log file name
/// the way `goose-server` names its files after the subcommand it ran
/// (`"goosed"`); ccr-server has no subcommands, so it passes a constant.
pub fn setup_logging(name: &str) -> Result<()> {
    let log_dir = log_directory()?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let log_filename = format!("{timestamp}-{name}.log");

    let file_appender =
        tracing_appender::rolling::RollingFileAppender::new(Rotation::NEVER, log_dir, log_filename);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_writer(file_appender)
        .with_ansi(false)
        .with_file(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_ansi(true)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("")
            .add_directive("ccr_core=debug".parse().unwrap())
            .add_directive("ccr_server=info".parse().unwrap())
            .add_directive("tower_http=info".parse().unwrap())
            .add_directive(LevelFilter::WARN.into())
    });

    let layers = vec![
        file_layer.with_filter(env_filter).boxed(),
        console_layer.with_filter(LevelFilter::INFO).boxed(),
    ];

    Registry::default()
        .with(layers)
        .try_init()
        .context("failed to set global tracing subscriber")?;

    Ok(())
}

/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::MpuConfig;
use crate::error::{MpuError, MpuResult};

/// Effective level: `verbose` forces debug
pub fn effective_level(config: &MpuConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.log_level.to_tracing_level()
    }
}

/// Filter directive used when `RUST_LOG` is not set
pub fn default_directive(config: &MpuConfig) -> String {
    format!("orbit_mpu={}", effective_level(config))
}

/// Initialize structured logging based on configuration
pub fn init_logging(config: &MpuConfig) -> MpuResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(config)))
        .map_err(|e| MpuError::InvalidConfig(format!("Failed to create log filter: {}", e)))?;

    if let Some(ref log_path) = config.log_file {
        init_file_logging(log_path, env_filter)
    } else {
        init_stdout_logging(env_filter)
    }
}

fn init_stdout_logging(env_filter: EnvFilter) -> MpuResult<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| MpuError::InvalidConfig(format!("Logging already initialized: {}", e)))
}

/// JSON lines, one per event, with span close timings
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> MpuResult<()> {
    json_subscriber(log_path, env_filter)?
        .try_init()
        .map_err(|e| MpuError::InvalidConfig(format!("Logging already initialized: {}", e)))
}

fn json_subscriber(
    log_path: &Path,
    env_filter: EnvFilter,
) -> MpuResult<impl Subscriber + Send + Sync + 'static> {
    let file = File::create(log_path).map_err(|e| {
        MpuError::InvalidConfig(format!(
            "Failed to create log file {}: {}",
            log_path.display(),
            e
        ))
    })?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    Ok(tracing_subscriber::registry().with(env_filter).with(fmt_layer))
}

/// Initialize logging for unit tests
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("orbit_mpu=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}

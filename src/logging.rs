//! Logging setup (ambient stack). Mirrors `main.py`'s `setup_logging`:
//! a console handler always on, plus an optional file handler, both at a
//! configurable level, expressed with `tracing-subscriber`'s idiom instead
//! of `logging.basicConfig`.

use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber. `debug` forces `debug` level
/// regardless of what the config file says, mirroring the CLI's `--debug`
/// flag taking priority over `logging.level`.
pub fn init(config: &LoggingConfig, debug: bool) {
    let level = if debug { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let Some(path) = &config.file else {
        builder.init();
        return;
    };

    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => builder.with_writer(Mutex::new(file)).init(),
        Err(e) => {
            builder.init();
            tracing::warn!("failed to open log file {path}: {e}, logging to console only");
        }
    }
}
